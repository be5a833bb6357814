//! Model source resolution: a local directory or a HuggingFace Hub repo.
//!
//! Both paths end in the same [`ModelFiles`] set so loading never cares
//! where the files came from.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use hf_hub::api::sync::{ApiBuilder, ApiRepo};
use hf_hub::{Cache, Repo, RepoType};
use indicatif::{ProgressBar, ProgressStyle};

/// Model used when neither a local path nor a hub id is configured.
pub const DEFAULT_MODEL_ID: &str = "Qwen/Qwen2.5-1.5B-Instruct";

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";
const GENERATION_CONFIG_FILE: &str = "generation_config.json";
const SAFETENSORS_FILE: &str = "model.safetensors";
const SAFETENSORS_INDEX_FILE: &str = "model.safetensors.index.json";

/// Where model weights and tokenizer come from.
#[derive(Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// A directory holding `config.json`, `tokenizer.json` and safetensors.
    Local(PathBuf),
    /// A HuggingFace Hub repo.
    Hub {
        model_id: String,
        revision: String,
        token: Option<String>,
    },
}

// Hand-written so the access token never ends up in logs.
impl std::fmt::Debug for ModelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local(path) => f.debug_tuple("Local").field(path).finish(),
            Self::Hub {
                model_id,
                revision,
                token,
            } => f
                .debug_struct("Hub")
                .field("model_id", model_id)
                .field("revision", revision)
                .field("token", &token.as_ref().map(|_| "<redacted>"))
                .finish(),
        }
    }
}

impl std::fmt::Display for ModelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local(path) => write!(f, "{}", path.display()),
            Self::Hub {
                model_id, revision, ..
            } => write!(f, "{model_id}@{revision}"),
        }
    }
}

/// Local paths of every file needed to load a model.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub tokenizer_config: Option<PathBuf>,
    pub generation_config: Option<PathBuf>,
    pub weights: Vec<PathBuf>,
}

impl ModelSource {
    /// Pick a source from the configured settings.
    ///
    /// A local `model_path` always wins. Otherwise the hub id (or
    /// [`DEFAULT_MODEL_ID`]) is used, with an optional access token.
    pub fn from_settings(
        model_path: Option<PathBuf>,
        model_id: Option<String>,
        revision: Option<String>,
        token: Option<String>,
    ) -> Self {
        if let Some(path) = model_path {
            return Self::Local(path);
        }
        Self::Hub {
            model_id: model_id.unwrap_or_else(|| DEFAULT_MODEL_ID.to_string()),
            revision: revision.unwrap_or_else(|| "main".to_string()),
            token: token.filter(|t| !t.trim().is_empty()),
        }
    }

    /// Short identifier reported by the server.
    pub fn model_id(&self) -> String {
        match self {
            Self::Local(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            Self::Hub { model_id, .. } => model_id.clone(),
        }
    }

    /// Resolve to local file paths, downloading from the hub if needed.
    pub fn resolve(&self) -> Result<ModelFiles> {
        match self {
            Self::Local(dir) => resolve_local(dir),
            Self::Hub {
                model_id,
                revision,
                token,
            } => download_from_hub(model_id, revision, token.as_deref()),
        }
    }
}

fn resolve_local(dir: &Path) -> Result<ModelFiles> {
    if !dir.is_dir() {
        bail!("model path is not a directory: {}", dir.display());
    }
    tracing::info!(path = %dir.display(), "using local model directory");

    let required = |name: &str| -> Result<PathBuf> {
        let path = dir.join(name);
        if !path.is_file() {
            bail!("{name} not found in {}", dir.display());
        }
        Ok(path)
    };
    let optional = |name: &str| -> Option<PathBuf> {
        let path = dir.join(name);
        path.is_file().then_some(path)
    };

    let config = required(CONFIG_FILE)?;
    let tokenizer = required(TOKENIZER_FILE)?;

    let index = dir.join(SAFETENSORS_INDEX_FILE);
    let weights = if index.is_file() {
        let shards = read_shard_names(&index)?;
        shards
            .iter()
            .map(|name| required(name))
            .collect::<Result<Vec<_>>>()?
    } else {
        vec![required(SAFETENSORS_FILE)?]
    };

    Ok(ModelFiles {
        config,
        tokenizer,
        tokenizer_config: optional(TOKENIZER_CONFIG_FILE),
        generation_config: optional(GENERATION_CONFIG_FILE),
        weights,
    })
}

/// The token hub requests authenticate with: an explicit one wins over
/// the one cached by a previous login.
fn hub_token<'a>(explicit: Option<&'a str>, cached: Option<&'a str>) -> Option<&'a str> {
    explicit.or(cached)
}

/// Download model files from HuggingFace Hub into the local cache.
///
/// Sharded checkpoints are detected through the safetensors index;
/// single-file checkpoints fall back to `model.safetensors`.
fn download_from_hub(model_id: &str, revision: &str, token: Option<&str>) -> Result<ModelFiles> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .context("invalid progress template")?,
    );
    pb.set_message(format!("Connecting to HuggingFace Hub for {model_id}..."));

    // `ApiBuilder::new` already picks up a token saved by `huggingface-cli
    // login`; only an explicit HF_TOKEN may replace it.
    let cached = Cache::default().token();
    if hub_token(token, cached.as_deref()).is_none() {
        tracing::warn!(repo = %model_id, "no HF_TOKEN set, gated repos will fail to download");
    }
    let mut builder = ApiBuilder::new().with_progress(false);
    if let Some(token) = token {
        builder = builder.with_token(Some(token.to_string()));
    }
    let api = builder
        .build()
        .context("failed to initialize HuggingFace Hub API")?;
    let repo = api.repo(Repo::with_revision(
        model_id.to_string(),
        RepoType::Model,
        revision.to_string(),
    ));

    tracing::info!(repo = %model_id, rev = %revision, "downloading from HF Hub");

    pb.set_message(format!("Downloading {CONFIG_FILE}..."));
    let config = fetch(&repo, model_id, CONFIG_FILE)?;
    pb.set_message(format!("Downloading {TOKENIZER_FILE}..."));
    let tokenizer = fetch(&repo, model_id, TOKENIZER_FILE)?;
    let tokenizer_config = repo.get(TOKENIZER_CONFIG_FILE).ok();
    let generation_config = repo.get(GENERATION_CONFIG_FILE).ok();

    let weights = match repo.get(SAFETENSORS_INDEX_FILE) {
        Ok(index) => {
            let shards = read_shard_names(&index)?;
            let mut paths = Vec::with_capacity(shards.len());
            for (i, name) in shards.iter().enumerate() {
                pb.set_message(format!("Downloading shard {}/{}: {name}...", i + 1, shards.len()));
                paths.push(fetch(&repo, model_id, name)?);
            }
            paths
        }
        Err(_) => {
            pb.set_message(format!("Downloading {SAFETENSORS_FILE}..."));
            vec![fetch(&repo, model_id, SAFETENSORS_FILE)?]
        }
    };

    pb.finish_with_message(format!("Model files cached for {model_id}"));

    Ok(ModelFiles {
        config,
        tokenizer,
        tokenizer_config,
        generation_config,
        weights,
    })
}

fn fetch(repo: &ApiRepo, model_id: &str, name: &str) -> Result<PathBuf> {
    repo.get(name)
        .with_context(|| format!("failed to download {name} from {model_id}"))
}

/// Distinct shard filenames listed in a safetensors index, in sorted order.
fn read_shard_names(index: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read(index).with_context(|| format!("cannot read {}", index.display()))?;
    let json: serde_json::Value =
        serde_json::from_slice(&raw).with_context(|| format!("invalid JSON in {}", index.display()))?;
    let weight_map = match json.get("weight_map") {
        Some(serde_json::Value::Object(map)) => map,
        _ => bail!("no weight_map in {}", index.display()),
    };

    let shards: BTreeSet<String> = weight_map
        .values()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    if shards.is_empty() {
        bail!("weight_map in {} lists no files", index.display());
    }
    Ok(shards.into_iter().collect())
}
