//! Model loading and the core `Model` trait.
//!
//! Loads Qwen2-family checkpoints (config.json + safetensors) using
//! `candle_transformers::models::qwen2` as the concrete implementation.

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::qwen2::{Config, ModelForCausalLM};

use crate::source::ModelFiles;
use crate::tokenizer::TokenizerWrapper;

// ---------------------------------------------------------------------------
// Model trait
// ---------------------------------------------------------------------------

/// Core trait for a loadable, runnable language model.
pub trait Model: Send {
    /// Forward pass: given input token IDs `(batch=1, seq_len)` and a
    /// starting position, return logits for the last position.
    fn forward(&mut self, input_ids: &Tensor, position: usize) -> Result<Tensor>;

    /// Reset internal KV-cache state (start a new conversation).
    fn reset(&mut self);

    /// Device this model lives on.
    fn device(&self) -> &Device;

    /// Maximum context length the model supports.
    fn max_seq_len(&self) -> usize;
}

// ---------------------------------------------------------------------------
// Qwen2 implementation
// ---------------------------------------------------------------------------

/// A Qwen2-family causal language model loaded from safetensors.
pub struct Qwen2 {
    inner: ModelForCausalLM,
    device: Device,
    max_seq_len: usize,
}

impl Qwen2 {
    /// Build from a parsed `config.json` and a var builder over the weights.
    pub fn new(config: &Config, vb: VarBuilder, device: &Device) -> Result<Self> {
        let inner = ModelForCausalLM::new(config, vb).context("failed to build qwen2 model")?;
        Ok(Self {
            inner,
            device: device.clone(),
            max_seq_len: config.max_position_embeddings,
        })
    }
}

impl Model for Qwen2 {
    fn forward(&mut self, input_ids: &Tensor, position: usize) -> Result<Tensor> {
        let logits = self
            .inner
            .forward(input_ids, position)
            .context("qwen2 forward pass")?;
        Ok(logits)
    }

    fn reset(&mut self) {
        self.inner.clear_kv_cache();
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Parse a dtype name as accepted on the command line.
pub fn parse_dtype(name: &str) -> Result<DType> {
    match name.to_ascii_lowercase().as_str() {
        "f32" | "float32" => Ok(DType::F32),
        "f16" | "float16" => Ok(DType::F16),
        "bf16" | "bfloat16" => Ok(DType::BF16),
        other => bail!("unsupported dtype '{other}' (expected f32, f16 or bf16)"),
    }
}

/// Read and parse a model's `config.json`.
pub fn read_config(files: &ModelFiles) -> Result<Config> {
    let raw = std::fs::read(&files.config)
        .with_context(|| format!("cannot read {}", files.config.display()))?;
    serde_json::from_slice(&raw)
        .with_context(|| format!("unsupported model config {}", files.config.display()))
}

/// Load weights and tokenizer from resolved model files.
///
/// Returns `(Box<dyn Model>, TokenizerWrapper)`.
pub fn load_model(
    files: &ModelFiles,
    device: &Device,
    dtype: DType,
) -> Result<(Box<dyn Model>, TokenizerWrapper)> {
    // --- Load weights ---
    let config = read_config(files)?;
    tracing::info!(
        shards = files.weights.len(),
        ?dtype,
        layers = config.num_hidden_layers,
        hidden = config.hidden_size,
        vocab = config.vocab_size,
        "loading safetensors weights"
    );

    // SAFETY: the files are memory-mapped read-only and must not be
    // modified while the model is alive.
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, device) }
        .context("failed to map safetensors")?;
    let model = Qwen2::new(&config, vb, device)?;
    tracing::info!(max_seq_len = model.max_seq_len(), "model loaded");

    // --- Load tokenizer ---
    tracing::info!(path = %files.tokenizer.display(), "loading tokenizer");
    let mut tokenizer = TokenizerWrapper::from_file(&files.tokenizer)?;
    tokenizer.configure_eos(
        files.generation_config.as_deref(),
        files.tokenizer_config.as_deref(),
    )?;
    if tokenizer.eos_token_ids().is_empty() {
        tracing::warn!("no EOS token found, generation will run to max_new_tokens");
    }

    Ok((Box::new(model), tokenizer))
}
