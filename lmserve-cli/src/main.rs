//! lmserve CLI — serve a pretrained causal language model over HTTP.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use lmserve_core::{ChatTemplate, ModelFiles, ModelSource, SamplingParams};
use tracing_subscriber::EnvFilter;

mod cmd;

#[derive(Parser)]
#[command(
    name = "lmserve",
    about = "lmserve - text generation over a pretrained causal language model",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the model and serve POST /generate.
    Serve {
        #[command(flatten)]
        model: ModelArgs,

        #[command(flatten)]
        generation: GenerationArgs,

        /// Address to bind.
        #[arg(long, env = "HOST", default_value = "0.0.0.0")]
        host: String,

        /// Port to listen on.
        #[arg(short, long, env = "PORT", default_value_t = 5005)]
        port: u16,
    },
    /// Generate one reply, streaming tokens to stdout.
    Run {
        #[command(flatten)]
        model: ModelArgs,

        #[command(flatten)]
        generation: GenerationArgs,

        /// User message.
        #[arg(short, long)]
        message: String,

        /// Optional system message sent before the user message.
        #[arg(short, long)]
        system: Option<String>,
    },
    /// Download the model files into the local HuggingFace cache.
    Download {
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Show available backends and the configured model.
    Info {
        #[command(flatten)]
        model: ModelArgs,
    },
}

/// Where the model comes from and how its weights are loaded.
#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
    /// Local model directory. Takes precedence over --model-id.
    #[arg(long, env = "MODEL_PATH")]
    pub model_path: Option<PathBuf>,

    /// HuggingFace repo ID [default: Qwen/Qwen2.5-1.5B-Instruct].
    #[arg(long, env = "HF_MODEL_ID")]
    pub model_id: Option<String>,

    /// HuggingFace revision/branch [default: main].
    #[arg(long, env = "HF_REVISION")]
    pub revision: Option<String>,

    /// HuggingFace access token for gated repos.
    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    pub hf_token: Option<String>,

    /// Weight dtype: f32, f16 or bf16.
    #[arg(long, env = "DTYPE", default_value = "f32")]
    pub dtype: String,
}

impl ModelArgs {
    pub fn source(&self) -> ModelSource {
        ModelSource::from_settings(
            self.model_path.clone(),
            self.model_id.clone(),
            self.revision.clone(),
            self.hf_token.clone(),
        )
    }
}

/// Prompt formatting and sampling defaults.
#[derive(Args, Debug, Clone)]
pub struct GenerationArgs {
    /// Maximum tokens to generate per request.
    #[arg(long, env = "MAX_NEW_TOKENS", default_value_t = 200)]
    pub max_new_tokens: usize,

    /// Prompt format: chatml or plain.
    #[arg(long, env = "CHAT_TEMPLATE", default_value_t = ChatTemplate::ChatMl)]
    pub template: ChatTemplate,

    /// System prompt used when a conversation has none (chatml only).
    #[arg(long, env = "DEFAULT_SYSTEM_PROMPT")]
    pub default_system_prompt: Option<String>,

    /// Sampling temperature. Overrides the model's generation config.
    #[arg(long, env = "TEMPERATURE")]
    pub temperature: Option<f64>,

    /// Seed for the sampling RNG.
    #[arg(long, env = "SEED")]
    pub seed: Option<u64>,
}

impl GenerationArgs {
    /// Sampling defaults: the model's generation config, then these flags.
    pub fn sampling_params(&self, files: &ModelFiles) -> Result<SamplingParams> {
        let mut params = match &files.generation_config {
            Some(path) => SamplingParams::from_generation_config(path)?,
            None => SamplingParams::default(),
        };
        params.max_new_tokens = self.max_new_tokens;
        if let Some(t) = self.temperature {
            params.temperature = t;
        }
        if self.seed.is_some() {
            params.seed = self.seed;
        }
        params.validate()?;
        Ok(params)
    }
}

/// The `.env` load error worth reporting. A missing file is fine.
fn dotenv_failure(result: &dotenvy::Result<PathBuf>) -> Option<&dotenvy::Error> {
    match result {
        Err(e) if !e.not_found() => Some(e),
        _ => None,
    }
}

fn main() -> Result<()> {
    // Loaded before the subscriber so RUST_LOG from .env applies.
    let dotenv = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Some(e) = dotenv_failure(&dotenv) {
        tracing::warn!(error = %e, "failed to load .env");
    }

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            model,
            generation,
            host,
            port,
        } => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(cmd::serve::execute(&model, &generation, &host, port))
        }
        Commands::Run {
            model,
            generation,
            message,
            system,
        } => cmd::run::execute(&model, &generation, &message, system.as_deref()),
        Commands::Download { model } => cmd::download::execute(&model),
        Commands::Info { model } => cmd::info::execute(&model),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_dotenv_is_silent() {
        let missing = Err(dotenvy::Error::Io(std::io::Error::from(
            std::io::ErrorKind::NotFound,
        )));
        assert!(dotenv_failure(&missing).is_none());
        assert!(dotenv_failure(&Ok(PathBuf::from(".env"))).is_none());
    }

    #[test]
    fn malformed_dotenv_is_reported() {
        let malformed = Err(dotenvy::Error::LineParse("MODEL_PATH='unterminated".into(), 10));
        let err = dotenv_failure(&malformed).expect("parse errors are reported");
        assert!(err.to_string().contains("unterminated"));
    }
}
