use std::path::Path;

use anyhow::Error;
use serde::Deserialize;

#[derive(Deserialize, Debug, Default)]
pub struct SynthesizeRequest {
    pub text: Option<String>,
    pub language_id: Option<String>,
    pub speaker_wav: Option<String>,
    pub speaker: Option<String>,
    pub speed: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Voice {
    /// Clone the voice of a reference recording
    Clone(String),
    Preset(String),
    /// Models without a speaker concept
    ModelDefault,
}

impl Voice {
    /// Explicit reference audio wins over an explicit preset, which wins over the
    /// model's first built-in speaker.
    pub fn select(request: &SynthesizeRequest, builtin_speakers: &[String]) -> Self {
        let non_empty = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        if let Some(speaker_wav) = non_empty(&request.speaker_wav) {
            Voice::Clone(speaker_wav)
        } else if let Some(speaker) = non_empty(&request.speaker) {
            Voice::Preset(speaker)
        } else if let Some(first) = builtin_speakers.first() {
            Voice::Preset(first.clone())
        } else {
            Voice::ModelDefault
        }
    }
}

#[derive(Debug, Clone)]
pub struct SynthesisParams {
    pub text: String,
    pub language: Option<String>,
    pub voice: Voice,
    pub speed: Option<f32>,
}

pub trait SynthesizeHandler: Send {
    /// Built-in speakers exposed by the model, empty when it has none.
    fn speakers(&self) -> &[String];

    /// Whether the model takes language and speed arguments.
    fn is_multilingual(&self) -> bool;

    /// Synthesizes speech into the wav file at `output`.
    fn run_synthesize(&mut self, params: &SynthesisParams, output: &Path) -> Result<(), Error>;
}
