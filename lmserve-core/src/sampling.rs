//! Token sampling strategies: temperature, top-k, top-p, repeat penalty.

use std::path::Path;

use anyhow::{bail, Context, Result};
use candle_core::{DType, Tensor};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::chat::GenerationOverrides;

/// Parameters controlling token sampling during generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Temperature for logit scaling. 0.0 = greedy.
    pub temperature: f64,
    /// Nucleus sampling threshold.
    pub top_p: f64,
    /// Top-k filtering. 0 = disabled.
    pub top_k: usize,
    /// Maximum tokens to generate.
    pub max_new_tokens: usize,
    /// Penalty applied to already-seen tokens.
    pub repeat_penalty: f32,
    /// Window of recent tokens to apply repeat penalty over.
    pub repeat_last_n: usize,
    /// Seed for the sampling RNG. `None` draws from OS entropy.
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            max_new_tokens: 200,
            repeat_penalty: 1.1,
            repeat_last_n: 64,
            seed: None,
        }
    }
}

/// Sampling-related fields of a HuggingFace `generation_config.json`.
#[derive(Debug, Default, Deserialize)]
struct GenerationConfig {
    do_sample: Option<bool>,
    temperature: Option<f64>,
    top_p: Option<f64>,
    top_k: Option<usize>,
    repetition_penalty: Option<f32>,
}

impl SamplingParams {
    /// Defaults taken from the model's `generation_config.json`.
    ///
    /// Fields the file does not set keep their [`Default`] values.
    /// `do_sample: false` means greedy decoding.
    pub fn from_generation_config(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
        let cfg: GenerationConfig = serde_json::from_slice(&raw)
            .with_context(|| format!("invalid generation config {}", path.display()))?;

        let mut params = Self::default();
        if let Some(t) = cfg.temperature {
            params.temperature = t;
        }
        if let Some(p) = cfg.top_p {
            params.top_p = p;
        }
        if let Some(k) = cfg.top_k {
            params.top_k = k;
        }
        if let Some(r) = cfg.repetition_penalty {
            params.repeat_penalty = r;
        }
        if cfg.do_sample == Some(false) {
            params.temperature = 0.0;
        }
        Ok(params)
    }

    /// Apply per-request overrides on top of these parameters.
    pub fn apply(&self, overrides: &GenerationOverrides) -> Self {
        let mut params = self.clone();
        if let Some(n) = overrides.max_new_tokens {
            params.max_new_tokens = n;
        }
        if let Some(t) = overrides.temperature {
            params.temperature = t;
        }
        if let Some(p) = overrides.top_p {
            params.top_p = p;
        }
        if let Some(k) = overrides.top_k {
            params.top_k = k;
        }
        if overrides.seed.is_some() {
            params.seed = overrides.seed;
        }
        params
    }

    /// Reject values sampling cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.max_new_tokens == 0 {
            bail!("max_new_tokens must be at least 1");
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            bail!("temperature must be a non-negative number");
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            bail!("top_p must be in (0, 1]");
        }
        if !self.repeat_penalty.is_finite() || self.repeat_penalty <= 0.0 {
            bail!("repeat_penalty must be positive");
        }
        Ok(())
    }
}

/// Reduce model output to the 1-D logits of the final position.
///
/// Accepts `(vocab)`, `(seq, vocab)` and `(1, seq, vocab)`; depending on the
/// architecture the forward pass returns any of these.
pub fn last_token_logits(logits: &Tensor) -> Result<Tensor> {
    let logits = match logits.rank() {
        1 => logits.clone(),
        2 => {
            let seq = logits.dim(0)?;
            if seq == 0 {
                bail!("logits have an empty sequence dimension");
            }
            logits.get(seq - 1)?
        }
        3 => {
            let (batch, seq, _) = logits.dims3()?;
            if batch != 1 {
                bail!("expected a single batch, got {batch}");
            }
            if seq == 0 {
                bail!("logits have an empty sequence dimension");
            }
            logits.get(0)?.get(seq - 1)?
        }
        rank => bail!("unsupported logits shape {:?} (rank {rank})", logits.dims()),
    };
    Ok(logits)
}

/// Sample a single token from model logits.
///
/// Applies repeat penalty, temperature scaling, top-k filtering,
/// and top-p (nucleus) sampling in that order.
pub fn sample_token<R: Rng>(
    logits: &Tensor,
    params: &SamplingParams,
    previous_tokens: &[u32],
    rng: &mut R,
) -> Result<u32> {
    // Cast to f32 for numerical stability.
    let logits = last_token_logits(logits)?.to_dtype(DType::F32)?;
    let mut logits_vec: Vec<f32> = logits
        .to_vec1()
        .context("failed to extract logits to vec")?;
    if logits_vec.is_empty() {
        bail!("empty logits");
    }

    // --- Repeat penalty ---
    if params.repeat_penalty != 1.0 && !previous_tokens.is_empty() {
        let start = previous_tokens.len().saturating_sub(params.repeat_last_n);
        let mut recent = previous_tokens[start..].to_vec();
        recent.sort_unstable();
        recent.dedup();
        for tok in recent {
            let idx = tok as usize;
            if idx < logits_vec.len() {
                let score = logits_vec[idx];
                logits_vec[idx] = if score > 0.0 {
                    score / params.repeat_penalty
                } else {
                    score * params.repeat_penalty
                };
            }
        }
    }

    // --- Greedy (temperature ~ 0) ---
    if params.temperature < 1e-7 {
        let (best_idx, _) = logits_vec
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .context("empty logits")?;
        return Ok(best_idx as u32);
    }

    // --- Temperature scaling ---
    let inv_temp = 1.0 / params.temperature as f32;
    for v in logits_vec.iter_mut() {
        *v *= inv_temp;
    }

    // Build (index, logit) pairs sorted descending by logit.
    let mut indexed: Vec<(usize, f32)> = logits_vec.iter().copied().enumerate().collect();
    indexed.sort_unstable_by(|a, b| b.1.total_cmp(&a.1));

    // --- Top-k filtering ---
    if params.top_k > 0 && params.top_k < indexed.len() {
        indexed.truncate(params.top_k);
    }

    // --- Softmax over candidates ---
    let max_logit = indexed[0].1;
    let mut probs: Vec<(usize, f32)> = indexed
        .iter()
        .map(|&(i, l)| (i, (l - max_logit).exp()))
        .collect();
    let sum: f32 = probs.iter().map(|(_, p)| p).sum();
    for (_, p) in probs.iter_mut() {
        *p /= sum;
    }

    // --- Top-p (nucleus) filtering ---
    if params.top_p < 1.0 {
        let mut cumsum = 0.0f32;
        let mut cutoff = probs.len();
        for (i, &(_, p)) in probs.iter().enumerate() {
            cumsum += p;
            if cumsum >= params.top_p as f32 {
                cutoff = i + 1;
                break;
            }
        }
        probs.truncate(cutoff);
    }

    // --- Weighted random selection ---
    let total: f32 = probs.iter().map(|(_, p)| p).sum();
    let r: f32 = rng.gen::<f32>() * total;

    let mut acc = 0.0f32;
    for &(idx, p) in &probs {
        acc += p;
        if acc >= r {
            return Ok(idx as u32);
        }
    }

    // Fallback: last candidate.
    Ok(probs.last().map(|(idx, _)| *idx as u32).unwrap_or(0))
}
