//! `lmserve info` — print backends and model architecture.

use anyhow::Result;
use lmserve_core::{default_device, read_config, TokenizerWrapper};

use crate::ModelArgs;

/// Print device info and, if the model resolves, its config summary.
pub fn execute(model_args: &ModelArgs) -> Result<()> {
    println!("lmserve v{}", lmserve_core::VERSION);
    println!();

    let device = default_device()?;
    println!("Device: {device:?}");

    println!("Backends:");
    #[cfg(feature = "metal")]
    println!("  - Metal (enabled)");
    #[cfg(not(feature = "metal"))]
    println!("  - Metal (disabled)");

    #[cfg(feature = "cuda")]
    println!("  - CUDA (enabled)");
    #[cfg(not(feature = "cuda"))]
    println!("  - CUDA (disabled)");

    println!("  - CPU (always available)");
    println!();

    let source = model_args.source();
    let files = match source.resolve() {
        Ok(files) => files,
        Err(e) => {
            println!("Model {source}: unavailable ({e:#})");
            return Ok(());
        }
    };
    let config = read_config(&files)?;
    let mut tokenizer = TokenizerWrapper::from_file(&files.tokenizer)?;
    tokenizer.configure_eos(
        files.generation_config.as_deref(),
        files.tokenizer_config.as_deref(),
    )?;

    println!("Model:           {source}");
    println!("Layers:          {}", config.num_hidden_layers);
    println!("Hidden size:     {}", config.hidden_size);
    println!(
        "Attention heads: {} (KV: {})",
        config.num_attention_heads, config.num_key_value_heads
    );
    println!("Context length:  {}", config.max_position_embeddings);
    println!("Vocab size:      {}", config.vocab_size);
    println!("Tokenizer vocab: {}", tokenizer.vocab_size());
    println!("EOS token ids:   {:?}", tokenizer.eos_token_ids());
    println!("Weight files:    {}", files.weights.len());

    Ok(())
}
