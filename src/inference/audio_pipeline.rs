#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]

use std::io::Write;
use std::path::Path;

use anyhow::{anyhow, bail, Result};
use candle_core::{Device, IndexOp, Tensor, D};
use candle_nn::ops::softmax;
use candle_transformers::models::whisper;
use candle_transformers::models::whisper::quantized_model::Whisper;
use candle_transformers::models::whisper::{
    audio, Config, COMPRESSION_RATIO_THRESHOLD, EOT_TOKEN, HOP_LENGTH, LOGPROB_THRESHOLD,
    NO_SPEECH_THRESHOLD, NO_SPEECH_TOKENS, NO_TIMESTAMPS_TOKEN, SAMPLE_RATE, SOT_TOKEN,
    TEMPERATURES, TRANSCRIBE_TOKEN,
};
use candle_transformers::quantized_var_builder::VarBuilder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use hf_hub::api::sync::ApiRepo;
use rand::distributions::Distribution;
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;
use tracing::{debug, error};

use crate::inference::pcm_decode::{pcm_decode, resample};
use crate::language::WHISPER_LANGUAGES;

// Taken from https://github.com/huggingface/candle/blob/main/candle-examples/examples/whisper/main.rs
pub struct AudioGeneratorPipeline {
    model: Whisper,
    tokenizer: Tokenizer,
    config: Config,
    mel_filters: Vec<f32>,
    suppress_tokens: Tensor,
    sot_token: u32,
    transcribe_token: u32,
    eot_token: u32,
    no_speech_token: u32,
    no_timestamps_token: u32,
    language_tokens: Vec<(&'static str, u32)>,
    seed: rand::rngs::StdRng,
}

impl AudioGeneratorPipeline {
    pub fn with_gguf_model(
        repo: &ApiRepo,
        config_filename: &str,
        tokenizer_filename: &str,
        gguf_filename: &str,
        mel_filters_filename: &str,
        seed: rand::rngs::StdRng,
    ) -> Result<Self> {
        let config_path = repo.get(config_filename)?;
        let tokenizer_path = repo.get(tokenizer_filename)?;
        let model_path = repo.get(gguf_filename)?;

        let config: Config = serde_json::from_str(&std::fs::read_to_string(config_path)?)?;
        let tokenizer = Tokenizer::from_file(tokenizer_path).map_err(|e| anyhow!(e))?;

        let vb = VarBuilder::from_gguf(model_path, &Device::Cpu)?;
        let model = Whisper::load(&vb, config.clone())?;

        let mel_bytes = &*std::fs::read(mel_filters_filename)?;
        let mut mel_filters = vec![0f32; mel_bytes.len() / 4];
        <byteorder::LittleEndian as byteorder::ByteOrder>::read_f32_into(
            mel_bytes,
            &mut mel_filters,
        );

        let no_timestamps_token = token_id(&tokenizer, NO_TIMESTAMPS_TOKEN)?;
        let suppress_tokens: Vec<f32> = (0..model.config.vocab_size as u32)
            .map(|i| {
                if model.config.suppress_tokens.contains(&i) {
                    f32::NEG_INFINITY
                } else {
                    0f32
                }
            })
            .collect();
        let suppress_tokens = Tensor::new(suppress_tokens.as_slice(), &Device::Cpu)?;
        let start_of_transcript_token = token_id(&tokenizer, SOT_TOKEN)?;
        let transcribe_token = token_id(&tokenizer, TRANSCRIBE_TOKEN)?;
        let end_of_text_token = token_id(&tokenizer, EOT_TOKEN)?;
        let no_speech_token = NO_SPEECH_TOKENS
            .iter()
            .find_map(|token| token_id(&tokenizer, token).ok());
        let Some(no_speech_token) = no_speech_token else {
            bail!("Unable to find any non-speech token")
        };
        let language_tokens: Vec<(&'static str, u32)> = WHISPER_LANGUAGES
            .iter()
            .filter_map(|(code, _)| {
                token_id(&tokenizer, &format!("<|{code}|>"))
                    .ok()
                    .map(|id| (*code, id))
            })
            .collect();
        if language_tokens.is_empty() {
            bail!("The tokenizer has no language tokens, only multilingual models are supported")
        }

        Ok(Self {
            model,
            tokenizer,
            config,
            mel_filters,
            suppress_tokens,
            sot_token: start_of_transcript_token,
            transcribe_token,
            eot_token: end_of_text_token,
            no_speech_token,
            no_timestamps_token,
            language_tokens,
            seed,
        })
    }

    /// Transcribes the audio file, returning the language used and the decoded segments.
    pub fn transcribe(
        &mut self,
        audio: &Path,
        language: Option<&str>,
    ) -> Result<(String, Vec<Segment>)> {
        let mel = self.load_mel(audio)?;
        let (_, _, content_frames) = mel.dims3()?;

        let (language, language_token) = match language {
            Some(code) => match self.language_tokens.iter().find(|(c, _)| *c == code) {
                Some((code, token)) => (*code, *token),
                None => bail!("language {code} is not supported"),
            },
            None => self.detect_language(&mel)?,
        };

        let mut seek = 0;
        let mut segments = vec![];
        while seek < content_frames {
            let time_offset = (seek * HOP_LENGTH) as f64 / SAMPLE_RATE as f64;
            let segment_size = usize::min(content_frames - seek, whisper::N_FRAMES);
            let mel_segment = mel.narrow(2, seek, segment_size)?;
            let segment_duration = (segment_size * HOP_LENGTH) as f64 / SAMPLE_RATE as f64;
            let dr = self.decode_with_fallback(&mel_segment, language_token)?;
            let segment_seek = seek;
            seek += segment_size;
            if dr.no_speech_prob > NO_SPEECH_THRESHOLD && dr.avg_logprob < LOGPROB_THRESHOLD {
                debug!("no speech detected, skipping {seek} {dr:?}");
                continue;
            }
            segments.push(Segment {
                id: segments.len(),
                seek: segment_seek,
                start: time_offset,
                end: time_offset + segment_duration,
                text: dr.text,
                tokens: dr.tokens,
                temperature: dr.temperature,
                avg_logprob: dr.avg_logprob,
                compression_ratio: dr.compression_ratio,
                no_speech_prob: dr.no_speech_prob,
            });
        }
        Ok((language.to_string(), segments))
    }

    /// Picks the most likely language token from the first window of audio.
    fn detect_language(&mut self, mel: &Tensor) -> Result<(&'static str, u32)> {
        let (_, _, frames) = mel.dims3()?;
        let mel = mel.narrow(2, 0, usize::min(frames, whisper::N_FRAMES))?;
        let audio_features = self.model.encoder.forward(&mel, true)?;

        let tokens = Tensor::new(&[[self.sot_token]], mel.device())?;
        let ys = self.model.decoder.forward(&tokens, &audio_features, true)?;
        let logits = self.model.decoder.final_linear(&ys.i(..1)?)?.i(0)?.i(0)?;

        let ids: Vec<u32> = self.language_tokens.iter().map(|(_, id)| *id).collect();
        let ids = Tensor::new(ids.as_slice(), mel.device())?;
        let probs: Vec<f32> = softmax(&logits.index_select(&ids, 0)?, D::Minus1)?.to_vec1()?;

        let best = probs
            .iter()
            .enumerate()
            .max_by(|(_, u), (_, v)| u.total_cmp(v))
            .map(|(i, _)| i)
            .ok_or_else(|| anyhow!("no language probabilities"))?;
        debug!(
            "detected language {} with probability {}",
            self.language_tokens[best].0, probs[best]
        );
        Ok(self.language_tokens[best])
    }

    fn decode_with_fallback(
        &mut self,
        segment: &Tensor,
        language_token: u32,
    ) -> Result<DecodingResult> {
        for (i, &t) in TEMPERATURES.iter().enumerate() {
            let dr: Result<DecodingResult> = self.decode(segment, t, language_token);
            if i == TEMPERATURES.len() - 1 {
                return dr;
            }
            // On errors, we try again with a different temperature.
            match dr {
                Ok(dr) => {
                    let needs_fallback = dr.compression_ratio > COMPRESSION_RATIO_THRESHOLD
                        || dr.avg_logprob < LOGPROB_THRESHOLD;
                    if !needs_fallback || dr.no_speech_prob > NO_SPEECH_THRESHOLD {
                        return Ok(dr);
                    }
                }
                Err(err) => {
                    error!("Error running at {t}: {err}");
                }
            }
        }
        bail!("no decoding temperatures configured")
    }

    fn decode(&mut self, mel: &Tensor, t: f64, language_token: u32) -> Result<DecodingResult> {
        let model = &mut self.model;
        let audio_features = model.encoder.forward(mel, true)?;
        debug!("audio features: {:?}", audio_features.dims());

        let sample_len = model.config.max_target_positions / 2;
        let mut sum_logprob = 0f64;
        let mut no_speech_prob = f64::NAN;
        let mut tokens = vec![
            self.sot_token,
            language_token,
            self.transcribe_token,
            self.no_timestamps_token,
        ];
        let prompt_len = tokens.len();

        for i in 0..sample_len {
            let tokens_t = Tensor::new(tokens.as_slice(), mel.device())?;

            // The model expects a batch dim but this inference loop does not handle
            // it so we add it at this point.
            let tokens_t = tokens_t.unsqueeze(0)?;
            let ys = model.decoder.forward(&tokens_t, &audio_features, i == 0)?;

            // Extract the no speech probability on the first iteration by looking at the first
            // token logits and the probability for the according token.
            if i == 0 {
                let logits = model.decoder.final_linear(&ys.i(..1)?)?.i(0)?.i(0)?;
                no_speech_prob = f64::from(
                    softmax(&logits, 0)?
                        .i(self.no_speech_token as usize)?
                        .to_scalar::<f32>()?,
                );
            }

            let (_, seq_len, _) = ys.dims3()?;
            let logits = model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?;
            let logits = logits.broadcast_add(&self.suppress_tokens)?;
            let next_token = if t > 0f64 {
                let prs = softmax(&(&logits / t)?, 0)?;
                let logits_v: Vec<f32> = prs.to_vec1()?;
                let distr = rand::distributions::WeightedIndex::new(&logits_v)?;
                u32::try_from(distr.sample(&mut self.seed))?
            } else {
                let logits_v: Vec<f32> = logits.to_vec1()?;
                logits_v
                    .iter()
                    .enumerate()
                    .max_by(|(_, u), (_, v)| u.total_cmp(v))
                    .map(|(i, _)| i as u32)
                    .ok_or_else(|| anyhow!("empty logits"))?
            };
            tokens.push(next_token);
            let prob = f64::from(
                softmax(&logits, D::Minus1)?
                    .i(next_token as usize)?
                    .to_scalar::<f32>()?,
            );
            if next_token == self.eot_token || tokens.len() > model.config.max_target_positions {
                break;
            }
            sum_logprob += prob.ln();
        }
        let generated: Vec<u32> = tokens[prompt_len..]
            .iter()
            .copied()
            .filter(|token| *token != self.eot_token)
            .collect();
        let text = self
            .tokenizer
            .decode(&generated, true)
            .map_err(|e| anyhow!(e))?;
        let avg_logprob = sum_logprob / tokens.len() as f64;
        let compression_ratio = compression_ratio(&text)?;

        Ok(DecodingResult {
            text,
            tokens: generated,
            avg_logprob,
            no_speech_prob,
            temperature: t,
            compression_ratio,
        })
    }

    fn load_mel(&self, audio: &Path) -> Result<Tensor> {
        let (pcm_data, sample_rate) = pcm_decode(audio)?;
        let target_rate = u32::try_from(SAMPLE_RATE)?;
        let pcm_data = resample(&pcm_data, sample_rate, target_rate)?;
        if pcm_data.is_empty() {
            bail!("Audio file contains no samples")
        }
        debug!("pcm data loaded {}", pcm_data.len());
        let mel = audio::pcm_to_mel(&self.config, &pcm_data, &self.mel_filters);
        let mel_len = mel.len();
        let mel = Tensor::from_vec(
            mel,
            (
                1,
                self.config.num_mel_bins,
                mel_len / self.config.num_mel_bins,
            ),
            &Device::Cpu,
        )?;
        debug!("loaded mel: {:?}", mel.dims());
        Ok(mel)
    }
}

/// A transcribed window of audio, times in seconds.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Segment {
    pub id: usize,
    pub seek: usize,
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub tokens: Vec<u32>,
    pub temperature: f64,
    pub avg_logprob: f64,
    pub compression_ratio: f64,
    pub no_speech_prob: f64,
}

#[derive(Debug, Clone)]
struct DecodingResult {
    text: String,
    tokens: Vec<u32>,
    avg_logprob: f64,
    no_speech_prob: f64,
    temperature: f64,
    compression_ratio: f64,
}

pub fn token_id(tokenizer: &Tokenizer, token: &str) -> Result<u32> {
    match tokenizer.token_to_id(token) {
        None => bail!("no token-id for {token}"),
        Some(id) => Ok(id),
    }
}

/// Raw to zlib-compressed size of the decoded text. Repetitive output compresses well
/// and pushes the ratio above the fallback threshold.
fn compression_ratio(text: &str) -> Result<f64> {
    if text.is_empty() {
        return Ok(0.0);
    }
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes())?;
    let compressed = encoder.finish()?;
    Ok(text.len() as f64 / compressed.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_text_exceeds_the_fallback_threshold() {
        let looping = " Thank you.".repeat(20);
        assert!(compression_ratio(&looping).unwrap() > COMPRESSION_RATIO_THRESHOLD);

        let speech = " The quick brown fox jumps over the lazy dog near the river bank.";
        let ratio = compression_ratio(speech).unwrap();
        assert!(ratio.is_finite());
        assert!(ratio < COMPRESSION_RATIO_THRESHOLD);
    }

    #[test]
    fn empty_text_has_zero_ratio() {
        assert_eq!(compression_ratio("").unwrap(), 0.0);
    }
}
