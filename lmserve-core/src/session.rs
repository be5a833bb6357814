//! Inference session: drives token-by-token autoregressive generation.

use anyhow::{bail, Result};
use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::model::Model;
use crate::sampling::{sample_token, SamplingParams};
use crate::tokenizer::TokenizerWrapper;
use crate::{FinishReason, GenerateOutput};

/// Drives autoregressive generation from a model + tokenizer pair.
pub struct InferenceSession<'a> {
    model: &'a mut dyn Model,
    tokenizer: &'a TokenizerWrapper,
    params: SamplingParams,
    rng: StdRng,
}

impl<'a> InferenceSession<'a> {
    pub fn new(
        model: &'a mut dyn Model,
        tokenizer: &'a TokenizerWrapper,
        params: SamplingParams,
    ) -> Self {
        let rng = match params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            model,
            tokenizer,
            params,
            rng,
        }
    }

    /// Generate a completion for the given prompt.
    ///
    /// Only the newly generated tokens are decoded: the prompt never
    /// appears in `text`, special tokens are skipped and surrounding
    /// whitespace is trimmed.
    pub fn generate(&mut self, prompt: &str) -> Result<GenerateOutput> {
        let prompt_tokens = self.encode_prompt(prompt)?;
        let (generated_ids, finish_reason) = self.generate_from_tokens(&prompt_tokens)?;

        let text = self.tokenizer.decode(&generated_ids, true)?;

        Ok(GenerateOutput {
            text: text.trim().to_string(),
            prompt_tokens: prompt_tokens.len(),
            generated_tokens: generated_ids.len(),
            tokens: generated_ids,
            finish_reason,
        })
    }

    /// Streaming generation: yields decoded text fragments as they complete.
    ///
    /// Fragments are suffixes of the decoded output so far, so characters
    /// spanning several byte-level tokens are only emitted once whole.
    pub fn generate_stream<'b>(&'b mut self, prompt: &str) -> Result<StreamIter<'b, 'a>> {
        let prompt_tokens = self.encode_prompt(prompt)?;

        // Prefill: process entire prompt at once.
        let first_token = self.prefill(&prompt_tokens)?;

        let mut all_tokens = prompt_tokens.clone();
        all_tokens.push(first_token);

        Ok(StreamIter {
            session: self,
            all_tokens,
            prompt_len: prompt_tokens.len(),
            pos: prompt_tokens.len(),
            first_token: Some(first_token),
            generated: Vec::new(),
            emitted_len: 0,
            done: false,
        })
    }

    fn encode_prompt(&self, prompt: &str) -> Result<Vec<u32>> {
        self.params.validate()?;
        let prompt_tokens = self.tokenizer.encode(prompt, true)?;
        if prompt_tokens.is_empty() {
            bail!("prompt must not be empty");
        }
        if prompt_tokens.len() >= self.model.max_seq_len() {
            bail!(
                "prompt is {} tokens, model context is {}",
                prompt_tokens.len(),
                self.model.max_seq_len()
            );
        }
        Ok(prompt_tokens)
    }

    /// Clear the KV cache and run the whole prompt through the model.
    fn prefill(&mut self, prompt_tokens: &[u32]) -> Result<u32> {
        self.model.reset();
        let device = self.model.device().clone();
        let input = Tensor::new(prompt_tokens, &device)?.unsqueeze(0)?;
        let logits = self.model.forward(&input, 0)?;
        sample_token(&logits, &self.params, prompt_tokens, &mut self.rng)
    }

    /// Low-level generation from pre-tokenized input.
    fn generate_from_tokens(&mut self, prompt_tokens: &[u32]) -> Result<(Vec<u32>, FinishReason)> {
        let device = self.model.device().clone();
        let mut all_tokens = prompt_tokens.to_vec();
        let mut generated = Vec::new();

        let mut next_token = self.prefill(prompt_tokens)?;
        if self.tokenizer.is_eos(next_token) {
            return Ok((generated, FinishReason::Stop));
        }
        all_tokens.push(next_token);
        generated.push(next_token);

        // Decode loop: one token at a time.
        for i in 1..self.params.max_new_tokens {
            let pos = prompt_tokens.len() + i - 1;
            if pos >= self.model.max_seq_len() {
                tracing::warn!(pos, max = self.model.max_seq_len(), "reached max sequence length");
                break;
            }

            let input = Tensor::new(&[next_token], &device)?.unsqueeze(0)?;
            let logits = self.model.forward(&input, pos)?;
            next_token = sample_token(&logits, &self.params, &all_tokens, &mut self.rng)?;

            if self.tokenizer.is_eos(next_token) {
                return Ok((generated, FinishReason::Stop));
            }

            all_tokens.push(next_token);
            generated.push(next_token);
        }

        Ok((generated, FinishReason::Length))
    }
}

/// Iterator over decoded text fragments.
pub struct StreamIter<'b, 'a: 'b> {
    session: &'b mut InferenceSession<'a>,
    all_tokens: Vec<u32>,
    prompt_len: usize,
    pos: usize,
    first_token: Option<u32>,
    /// Generated tokens, EOS excluded.
    generated: Vec<u32>,
    /// Byte length of the decoded text already yielded.
    emitted_len: usize,
    done: bool,
}

impl<'b, 'a: 'b> StreamIter<'b, 'a> {
    /// Number of tokens produced so far, EOS excluded.
    pub fn generated_tokens(&self) -> usize {
        self.generated.len()
    }

    pub fn prompt_tokens(&self) -> usize {
        self.prompt_len
    }

    /// The next sampled token, or `None` once the budget or context is spent.
    fn next_token(&mut self) -> Result<Option<u32>> {
        if let Some(tok) = self.first_token.take() {
            return Ok(Some(tok));
        }
        if self.all_tokens.len() - self.prompt_len >= self.session.params.max_new_tokens {
            return Ok(None);
        }
        self.step()
    }

    fn step(&mut self) -> Result<Option<u32>> {
        let last_token = match self.all_tokens.last() {
            Some(&t) => t,
            None => return Ok(None),
        };
        if self.pos >= self.session.model.max_seq_len() {
            return Ok(None);
        }

        let device = self.session.model.device().clone();
        let input = Tensor::new(&[last_token], &device)?.unsqueeze(0)?;
        let logits = self.session.model.forward(&input, self.pos)?;
        let next_token = sample_token(
            &logits,
            &self.session.params,
            &self.all_tokens,
            &mut self.session.rng,
        )?;
        self.pos += 1;
        self.all_tokens.push(next_token);
        Ok(Some(next_token))
    }

    /// Decoded text past what has been yielded.
    ///
    /// Unless `flush` is set, nothing is returned while the text ends in an
    /// incomplete character (U+FFFD from a partial UTF-8 sequence).
    fn pending_text(&mut self, flush: bool) -> Result<Option<String>> {
        let text = self.session.tokenizer.decode(&self.generated, true)?;
        if !flush && text.ends_with('\u{FFFD}') {
            return Ok(None);
        }
        match text.get(self.emitted_len..) {
            Some(suffix) if !suffix.is_empty() => {
                let suffix = suffix.to_string();
                self.emitted_len = text.len();
                Ok(Some(suffix))
            }
            _ => Ok(None),
        }
    }
}

impl<'b, 'a: 'b> Iterator for StreamIter<'b, 'a> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            let token = match self.next_token() {
                Ok(Some(tok)) => tok,
                Ok(None) => break,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            if self.session.tokenizer.is_eos(token) {
                break;
            }

            self.generated.push(token);
            match self.pending_text(false) {
                Ok(Some(text)) => return Some(Ok(text)),
                Ok(None) => continue,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }

        // Generation finished: release anything held back.
        self.done = true;
        self.pending_text(true).transpose()
    }
}

/// Convenience: encode prompt, generate, decode, return output.
pub fn generate_text(
    model: &mut dyn Model,
    tokenizer: &TokenizerWrapper,
    prompt: &str,
    params: SamplingParams,
) -> Result<GenerateOutput> {
    let mut session = InferenceSession::new(model, tokenizer, params);
    session.generate(prompt)
}

/// A model that replays a fixed token script, for tests.
#[cfg(test)]
pub(crate) mod mock {
    use anyhow::Result;
    use candle_core::{Device, Tensor};

    use crate::model::Model;

    pub struct ScriptedModel {
        pub script: Vec<u32>,
        pub vocab: usize,
        pub max_seq_len: usize,
        pub calls: Vec<(usize, usize)>,
        pub resets: usize,
        step: usize,
        device: Device,
    }

    impl ScriptedModel {
        pub fn new(script: Vec<u32>, vocab: usize) -> Self {
            Self {
                script,
                vocab,
                max_seq_len: 4096,
                calls: Vec::new(),
                resets: 0,
                step: 0,
                device: Device::Cpu,
            }
        }
    }

    impl Model for ScriptedModel {
        fn forward(&mut self, input_ids: &Tensor, position: usize) -> Result<Tensor> {
            let (_, seq_len) = input_ids.dims2()?;
            self.calls.push((position, seq_len));
            let target = self.script.get(self.step).copied().unwrap_or(0) as usize;
            self.step += 1;
            let mut logits = vec![0.0f32; self.vocab];
            logits[target] = 10.0;
            Ok(Tensor::new(logits, &self.device)?.reshape((1, 1, self.vocab))?)
        }

        fn reset(&mut self) {
            self.resets += 1;
            self.step = 0;
            self.calls.clear();
        }

        fn device(&self) -> &Device {
            &self.device
        }

        fn max_seq_len(&self) -> usize {
            self.max_seq_len
        }
    }
}
