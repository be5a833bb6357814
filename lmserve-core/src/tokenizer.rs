//! Tokenizer wrapper around HuggingFace `tokenizers` crate.
//!
//! Handles loading, encoding text to token IDs, decoding token IDs back to
//! text, and EOS detection. Chat models often stop on more than one token
//! (Qwen stops on both `<|im_end|>` and `<|endoftext|>`), so EOS is a set.

use std::path::Path;

use anyhow::{Context, Result};
use tokenizers::Tokenizer;

/// Token names tried when no config names an EOS token.
const FALLBACK_EOS: &[&str] = &["<|im_end|>", "<|endoftext|>", "</s>", "<|end|>"];

/// Wraps a HuggingFace tokenizer with convenience methods and EOS tracking.
pub struct TokenizerWrapper {
    inner: Tokenizer,
    eos_token_ids: Vec<u32>,
}

impl TokenizerWrapper {
    /// Build from a `tokenizers::Tokenizer` instance.
    ///
    /// EOS ids start out as whichever well-known end tokens exist in the
    /// vocabulary; configs loaded later replace them.
    pub fn new(tokenizer: Tokenizer) -> Self {
        let eos_token_ids = FALLBACK_EOS
            .iter()
            .filter_map(|name| tokenizer.token_to_id(name))
            .collect();
        Self {
            inner: tokenizer,
            eos_token_ids,
        }
    }

    /// Load a tokenizer from a local `tokenizer.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(path).map_err(|e| {
            anyhow::anyhow!("failed to load tokenizer from {}: {e}", path.display())
        })?;
        Ok(Self::new(tokenizer))
    }

    /// Load a tokenizer from the bytes of a `tokenizer.json` document.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let tokenizer = Tokenizer::from_bytes(bytes)
            .map_err(|e| anyhow::anyhow!("failed to parse tokenizer: {e}"))?;
        Ok(Self::new(tokenizer))
    }

    /// Replace the EOS set with ids from `generation_config.json`
    /// and/or the token named in `tokenizer_config.json`.
    ///
    /// Either file may be absent. The current set is kept when neither
    /// names anything usable.
    pub fn configure_eos(
        &mut self,
        generation_config: Option<&Path>,
        tokenizer_config: Option<&Path>,
    ) -> Result<()> {
        let mut ids = Vec::new();

        if let Some(path) = generation_config {
            let json = read_json(path)?;
            match json.get("eos_token_id") {
                Some(serde_json::Value::Number(n)) => ids.extend(n.as_u64().map(|v| v as u32)),
                Some(serde_json::Value::Array(items)) => {
                    ids.extend(items.iter().filter_map(|v| v.as_u64()).map(|v| v as u32))
                }
                _ => {}
            }
        }

        if let Some(path) = tokenizer_config {
            let json = read_json(path)?;
            let name = match json.get("eos_token") {
                Some(serde_json::Value::String(s)) => Some(s.as_str()),
                Some(serde_json::Value::Object(obj)) => {
                    obj.get("content").and_then(|v| v.as_str())
                }
                _ => None,
            };
            if let Some(id) = name.and_then(|n| self.inner.token_to_id(n)) {
                ids.push(id);
            }
        }

        ids.sort_unstable();
        ids.dedup();
        if !ids.is_empty() {
            tracing::debug!(?ids, "eos tokens from model config");
            self.eos_token_ids = ids;
        }
        Ok(())
    }

    /// Encode text to token IDs. If `add_special` is true,
    /// the tokenizer adds BOS/EOS per its configuration.
    pub fn encode(&self, text: &str, add_special: bool) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, add_special)
            .map_err(|e| anyhow::anyhow!("tokenizer encode error: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Decode token IDs back to text, optionally skipping special tokens.
    pub fn decode(&self, tokens: &[u32], skip_special: bool) -> Result<String> {
        self.inner
            .decode(tokens, skip_special)
            .map_err(|e| anyhow::anyhow!("tokenizer decode error: {e}"))
    }

    /// Check whether a token ends the sequence.
    pub fn is_eos(&self, token: u32) -> bool {
        self.eos_token_ids.contains(&token)
    }

    pub fn eos_token_ids(&self) -> &[u32] {
        &self.eos_token_ids
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

fn read_json(path: &Path) -> Result<serde_json::Value> {
    let raw = std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("invalid JSON in {}", path.display()))
}

/// A tiny word-level tokenizer used by tests across the crate.
///
/// Ids: `<|im_end|>`=0, `<|endoftext|>`=1, `<|im_start|>`=2, `[UNK]`=3,
/// then `hello`, `world`, `user`, `assistant`, `system`, `hi` from 4.
#[cfg(test)]
pub(crate) fn test_tokenizer() -> TokenizerWrapper {
    let json = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [
            {"id": 0, "content": "<|im_end|>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
            {"id": 1, "content": "<|endoftext|>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
            {"id": 2, "content": "<|im_start|>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true}
        ],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {
                "<|im_end|>": 0,
                "<|endoftext|>": 1,
                "<|im_start|>": 2,
                "[UNK]": 3,
                "hello": 4,
                "world": 5,
                "user": 6,
                "assistant": 7,
                "system": 8,
                "hi": 9
            },
            "unk_token": "[UNK]"
        }
    }"#;
    TokenizerWrapper::from_bytes(json.as_bytes()).expect("valid test tokenizer")
}

/// A byte-level BPE tokenizer without merges, used by tests.
///
/// Ids: `<|im_end|>`=0, `a`=1, `b`=2, `Ã`=3, `©`=4. Tokens 3 and 4 are
/// the two bytes of "é".
#[cfg(test)]
pub(crate) fn test_byte_level_tokenizer() -> TokenizerWrapper {
    let json = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [
            {"id": 0, "content": "<|im_end|>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true}
        ],
        "normalizer": null,
        "pre_tokenizer": null,
        "post_processor": null,
        "decoder": {"type": "ByteLevel", "add_prefix_space": true, "trim_offsets": true, "use_regex": true},
        "model": {
            "type": "BPE",
            "dropout": null,
            "unk_token": null,
            "continuing_subword_prefix": null,
            "end_of_word_suffix": null,
            "fuse_unk": false,
            "byte_fallback": false,
            "vocab": {"<|im_end|>": 0, "a": 1, "b": 2, "Ã": 3, "©": 4},
            "merges": []
        }
    }"#;
    TokenizerWrapper::from_bytes(json.as_bytes()).expect("valid byte-level test tokenizer")
}
