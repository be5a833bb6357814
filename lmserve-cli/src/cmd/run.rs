//! `lmserve run` — generate one reply, streaming tokens to stdout.

use std::io::Write;
use std::time::Instant;

use anyhow::Result;
use lmserve_core::{default_device, load_model, parse_dtype, ChatMessage, InferenceSession};

use crate::{GenerationArgs, ModelArgs};

/// Run one chat turn with streaming token output.
pub fn execute(
    model_args: &ModelArgs,
    generation: &GenerationArgs,
    message: &str,
    system: Option<&str>,
) -> Result<()> {
    let source = model_args.source();
    let dtype = parse_dtype(&model_args.dtype)?;
    let device = default_device()?;

    let files = source.resolve()?;
    let (mut model, tokenizer) = load_model(&files, &device, dtype)?;
    let params = generation.sampling_params(&files)?;

    let mut messages = Vec::with_capacity(2);
    if let Some(system) = system {
        messages.push(ChatMessage::new("system", system));
    }
    messages.push(ChatMessage::new("user", message));
    let prompt = generation
        .template
        .render(&messages, generation.default_system_prompt.as_deref());

    let mut session = InferenceSession::new(model.as_mut(), &tokenizer, params);
    let mut stdout = std::io::stdout().lock();

    let t_start = Instant::now();
    let mut stream = session.generate_stream(&prompt)?;
    let ttft = t_start.elapsed();

    eprintln!("Model:  {source}\nTokens: {} prompt tokens\n", stream.prompt_tokens());

    for piece in stream.by_ref() {
        write!(stdout, "{}", piece?)?;
        stdout.flush()?;
    }
    writeln!(stdout)?;

    let generated = stream.generated_tokens();
    let total = t_start.elapsed();
    let decode_secs = (total - ttft).as_secs_f64();
    let tokens_per_sec = if decode_secs > 0.0 {
        generated.saturating_sub(1) as f64 / decode_secs
    } else {
        0.0
    };

    eprintln!();
    eprintln!("--- generation stats ---");
    eprintln!("Generated tokens: {generated}");
    eprintln!("Time to first:    {:.1}ms", ttft.as_secs_f64() * 1000.0);
    eprintln!("Decode speed:     {tokens_per_sec:.1} tok/s");
    eprintln!("Total time:       {:.2}s", total.as_secs_f64());

    Ok(())
}
