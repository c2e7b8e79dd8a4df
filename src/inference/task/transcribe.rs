use std::path::Path;

use anyhow::Error;
use serde::{Deserialize, Serialize};

use crate::inference::audio_pipeline::Segment;

#[derive(Deserialize, Serialize, Debug)]
pub struct TranscribeResponse {
    pub text: String,
    pub language: String,
    pub segments: Vec<Segment>,
}

pub trait TranscribeHandler: Send {
    /// Transcribes the audio file at `audio`, detecting the language when no hint is given.
    fn run_transcribe(
        &mut self,
        audio: &Path,
        language: Option<&str>,
    ) -> Result<TranscribeResponse, Error>;
}
