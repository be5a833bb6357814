//! `lmserve download` — fetch model files ahead of serving.

use anyhow::Result;

use crate::ModelArgs;

pub fn execute(model_args: &ModelArgs) -> Result<()> {
    let source = model_args.source();
    tracing::info!(%source, "resolving model files");

    let files = source.resolve()?;

    println!("Config:            {}", files.config.display());
    println!("Tokenizer:         {}", files.tokenizer.display());
    if let Some(path) = &files.tokenizer_config {
        println!("Tokenizer config:  {}", path.display());
    }
    if let Some(path) = &files.generation_config {
        println!("Generation config: {}", path.display());
    }
    for path in &files.weights {
        println!("Weights:           {}", path.display());
    }
    println!();
    println!("Model downloaded successfully!");

    Ok(())
}
