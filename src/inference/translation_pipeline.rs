use std::cmp::Ordering;

use anyhow::{anyhow, Result};
use candle_core::{Device, Tensor, D};
use candle_nn::ops::log_softmax;
use candle_transformers::models::quantized_t5::{self, T5ForConditionalGeneration};
use candle_transformers::quantized_var_builder::VarBuilder;
use hf_hub::api::sync::ApiRepo;
use tokenizers::Tokenizer;
use tracing::debug;

pub const MAX_TOKENS: usize = 512;
pub const NUM_BEAMS: usize = 5;

// Taken from https://github.com/huggingface/candle/blob/main/candle-examples/examples/quantized-t5/main.rs
pub struct TranslationPipeline {
    model: T5ForConditionalGeneration,
    tokenizer: Tokenizer,
    device: Device,
    decoder_start_token_id: u32,
    eos_token_id: u32,
}

impl TranslationPipeline {
    pub fn with_gguf_model(
        repo: &ApiRepo,
        config_filename: &str,
        tokenizer_filename: &str,
        gguf_filename: &str,
    ) -> Result<Self> {
        let config_path = repo.get(config_filename)?;
        let tokenizer_path = repo.get(tokenizer_filename)?;
        let model_path = repo.get(gguf_filename)?;

        let mut config: quantized_t5::Config =
            serde_json::from_str(&std::fs::read_to_string(config_path)?)?;
        // Beams are reordered between steps, which a per-sequence cache cannot follow.
        config.use_cache = false;
        let decoder_start_token_id =
            u32::try_from(config.decoder_start_token_id.unwrap_or(config.pad_token_id))?;
        let eos_token_id = u32::try_from(config.eos_token_id)?;

        let device = Device::Cpu;
        let tokenizer = Tokenizer::from_file(tokenizer_path).map_err(|e| anyhow!(e))?;
        let vb = VarBuilder::from_gguf(model_path, &device)?;
        let model = T5ForConditionalGeneration::load(vb, &config)?;

        Ok(Self {
            model,
            tokenizer,
            device,
            decoder_start_token_id,
            eos_token_id,
        })
    }

    /// Translates `text` into `target`. The source language is implied by the text itself.
    pub fn translate(&mut self, text: &str, target: &str) -> Result<String> {
        let prompt = format!("<2{target}> {text}");
        let ids = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| anyhow!(e))?
            .get_ids()
            .to_vec();
        let ids = truncate_input(ids, MAX_TOKENS, self.eos_token_id);
        debug!("encoding {} input tokens", ids.len());

        self.model.clear_kv_cache();
        let input = Tensor::new(ids.as_slice(), &self.device)?.unsqueeze(0)?;
        let encoder_output = self.model.encode(&input)?;

        let mut search = BeamSearch::new(NUM_BEAMS, self.eos_token_id, MAX_TOKENS);
        loop {
            let prefixes = search.decoder_inputs(self.decoder_start_token_id);
            let batch = prefixes.len();
            let width = prefixes[0].len();
            let flat: Vec<u32> = prefixes.into_iter().flatten().collect();
            let decoder_input = Tensor::from_vec(flat, (batch, width), &self.device)?;
            let encoder_batch = Tensor::cat(&vec![&encoder_output; batch], 0)?;

            let logits = self.model.decode(&decoder_input, &encoder_batch)?;
            let log_probs: Vec<Vec<f32>> = log_softmax(&logits, D::Minus1)?.to_vec2()?;
            if search.step(&log_probs) {
                break;
            }
        }

        let tokens = search.best();
        debug!("decoded {} output tokens", tokens.len());
        self.tokenizer
            .decode(&tokens, true)
            .map_err(|e| anyhow!(e))
    }
}

/// Caps the encoder input at `max` ids while keeping the closing eos.
fn truncate_input(mut ids: Vec<u32>, max: usize, eos_token_id: u32) -> Vec<u32> {
    if ids.len() > max {
        ids.truncate(max - 1);
        ids.push(eos_token_id);
    }
    ids
}

#[derive(Debug, Clone)]
struct Hypothesis {
    tokens: Vec<u32>,
    log_prob: f32,
}

impl Hypothesis {
    fn normalized(&self) -> f32 {
        self.log_prob / self.tokens.len().max(1) as f32
    }
}

/// Beam search over decoder steps, scored by length-normalized log probability.
pub(crate) struct BeamSearch {
    num_beams: usize,
    eos_token_id: u32,
    max_len: usize,
    active: Vec<Hypothesis>,
    finished: Vec<Hypothesis>,
}

impl BeamSearch {
    pub(crate) fn new(num_beams: usize, eos_token_id: u32, max_len: usize) -> Self {
        Self {
            num_beams,
            eos_token_id,
            max_len,
            active: vec![Hypothesis {
                tokens: vec![],
                log_prob: 0.0,
            }],
            finished: vec![],
        }
    }

    /// One decoder prefix per active beam, all of the same length.
    pub(crate) fn decoder_inputs(&self, start_token_id: u32) -> Vec<Vec<u32>> {
        self.active
            .iter()
            .map(|h| {
                let mut prefix = Vec::with_capacity(h.tokens.len() + 1);
                prefix.push(start_token_id);
                prefix.extend_from_slice(&h.tokens);
                prefix
            })
            .collect()
    }

    /// Advances every active beam with its row of log probabilities.
    /// Returns true once the search is complete.
    pub(crate) fn step(&mut self, log_probs: &[Vec<f32>]) -> bool {
        let mut candidates: Vec<(usize, u32, f32)> = self
            .active
            .iter()
            .zip(log_probs)
            .flat_map(|(hyp, row)| {
                top_k(row, 2 * self.num_beams)
                    .into_iter()
                    .map(|(token, lp)| (token, hyp.log_prob + lp))
                    .collect::<Vec<_>>()
            })
            .enumerate()
            .map(|(i, (token, score))| (i / (2 * self.num_beams), token, score))
            .collect();
        candidates.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(Ordering::Equal));

        let mut next = Vec::with_capacity(self.num_beams);
        for (rank, (beam, token, score)) in candidates.into_iter().enumerate() {
            let mut tokens = self.active[beam].tokens.clone();
            if token == self.eos_token_id {
                if rank < self.num_beams {
                    self.finished.push(Hypothesis {
                        tokens,
                        log_prob: score,
                    });
                }
                continue;
            }
            tokens.push(token);
            next.push(Hypothesis {
                tokens,
                log_prob: score,
            });
            if next.len() == self.num_beams {
                break;
            }
        }
        self.active = next;

        let at_max_len = self
            .active
            .first()
            .map_or(true, |h| h.tokens.len() + 1 >= self.max_len);
        self.finished.len() >= self.num_beams || self.active.is_empty() || at_max_len
    }

    /// Tokens of the best hypothesis, preferring ones that reached eos.
    pub(crate) fn best(self) -> Vec<u32> {
        let pool = if self.finished.is_empty() {
            self.active
        } else {
            self.finished
        };
        pool.into_iter()
            .max_by(|a, b| {
                a.normalized()
                    .partial_cmp(&b.normalized())
                    .unwrap_or(Ordering::Equal)
            })
            .map(|h| h.tokens)
            .unwrap_or_default()
    }
}

fn top_k(row: &[f32], k: usize) -> Vec<(u32, f32)> {
    let mut indexed: Vec<(u32, f32)> = row
        .iter()
        .enumerate()
        .map(|(i, lp)| (i as u32, *lp))
        .collect();
    let k = k.min(indexed.len());
    if k == 0 {
        return vec![];
    }
    let by_score_desc = |a: &(u32, f32), b: &(u32, f32)| b.1.total_cmp(&a.1);
    indexed.select_nth_unstable_by(k - 1, by_score_desc);
    indexed.truncate(k);
    indexed.sort_by(by_score_desc);
    indexed
}

#[cfg(test)]
mod tests {
    use super::*;

    const EOS: u32 = 1;

    fn row(entries: &[(usize, f32)], vocab: usize) -> Vec<f32> {
        let mut row = vec![-100.0; vocab];
        for (i, lp) in entries {
            row[*i] = *lp;
        }
        row
    }

    #[test]
    fn top_k_returns_highest_scores_in_order() {
        let picked = top_k(&[-3.0, -0.5, -2.0, -0.1], 2);
        assert_eq!(picked, vec![(3, -0.1), (1, -0.5)]);
        assert_eq!(top_k(&[-1.0], 5).len(), 1);
    }

    #[test]
    fn long_inputs_keep_the_closing_eos() {
        let ids: Vec<u32> = (10..20).collect();
        let truncated = truncate_input(ids, 4, EOS);
        assert_eq!(truncated, vec![10, 11, 12, EOS]);

        assert_eq!(truncate_input(vec![5, EOS], 4, EOS), vec![5, EOS]);
    }

    #[test]
    fn beams_start_from_the_decoder_start_token() {
        let search = BeamSearch::new(2, EOS, 16);
        assert_eq!(search.decoder_inputs(0), vec![vec![0]]);
    }

    #[test]
    fn picks_the_best_scoring_sequence() {
        let mut search = BeamSearch::new(2, EOS, 16);
        // token 5 is slightly better than token 6 at first
        assert!(!search.step(&[row(&[(5, -0.4), (6, -0.6)], 8)]));
        assert_eq!(search.decoder_inputs(0), vec![vec![0, 5], vec![0, 6]]);

        // but only 6 continues with a confident eos
        let eos = EOS as usize;
        let done = search.step(&[
            row(&[(7, -3.0), (eos, -2.5)], 8),
            row(&[(eos, -0.1)], 8),
        ]);
        assert!(done);
        assert_eq!(search.best(), vec![6]);
    }

    #[test]
    fn stops_at_max_length_without_eos() {
        let mut search = BeamSearch::new(1, EOS, 3);
        assert!(!search.step(&[row(&[(4, -0.1)], 8)]));
        assert!(search.step(&[row(&[(4, -0.1)], 8)]));
        assert_eq!(search.best(), vec![4, 4]);
    }
}
