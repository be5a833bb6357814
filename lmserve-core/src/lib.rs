//! lmserve core -- text generation over a pretrained causal language model.
//!
//! Resolves model files locally or from HuggingFace Hub, loads safetensors
//! weights with Candle as the tensor backend, formats chat messages into a
//! prompt and runs autoregressive generation.

use anyhow::Result;
use candle_core::Device;
use serde::{Deserialize, Serialize};

pub mod chat;
pub mod model;
pub mod sampling;
pub mod session;
pub mod source;
pub mod tokenizer;

pub use chat::{ChatMessage, ChatRequest, ChatTemplate, GenerationOverrides, RequestError};
pub use model::{load_model, parse_dtype, read_config, Model, Qwen2};
pub use sampling::{last_token_logits, sample_token, SamplingParams};
pub use session::{generate_text, InferenceSession};
pub use source::{ModelFiles, ModelSource, DEFAULT_MODEL_ID};
pub use tokenizer::TokenizerWrapper;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Select the best available compute device for the current platform.
pub fn default_device() -> Result<Device> {
    #[cfg(feature = "metal")]
    {
        tracing::info!("using Metal backend");
        return Ok(Device::new_metal(0)?);
    }

    #[cfg(feature = "cuda")]
    {
        tracing::info!("using CUDA backend");
        return Ok(Device::new_cuda(0)?);
    }

    #[allow(unreachable_code)]
    {
        tracing::info!("using CPU backend");
        Ok(Device::Cpu)
    }
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    /// The model emitted an end-of-sequence token.
    Stop,
    /// The token budget or the context window ran out.
    Length,
}

/// Output from a generation call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateOutput {
    pub text: String,
    pub tokens: Vec<u32>,
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub finish_reason: FinishReason,
}
