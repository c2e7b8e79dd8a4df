use std::path::Path;

use anyhow::{Error, Result};
use hf_hub::api::sync::Api;
use hf_hub::{Repo, RepoType};
use rand::SeedableRng;
use tracing::info;

use crate::inference::audio_pipeline::{AudioGeneratorPipeline, Segment};
use crate::inference::models::model::ModelBase;
use crate::inference::task::transcribe::{TranscribeHandler, TranscribeResponse};

pub struct WhisperModel {
    generator_pipeline: AudioGeneratorPipeline,
}

impl WhisperModel {
    #[tracing::instrument(level = "info", skip(api))]
    pub fn new(
        api: Api,
        base: &ModelBase,
        config_filename: &str,
        tokenizer_filename: &str,
        gguf_filename: &str,
        mel_filters_filename: &str,
    ) -> Result<Self> {
        let repo = api.repo(Repo::with_revision(
            base.repo_id.clone(),
            RepoType::Model,
            base.repo_revision.clone(),
        ));
        let generator_pipeline = AudioGeneratorPipeline::with_gguf_model(
            &repo,
            config_filename,
            tokenizer_filename,
            gguf_filename,
            mel_filters_filename,
            rand::rngs::StdRng::from_seed([0; 32]),
        )?;
        info!("Loaded {} from {}", base.name, base.repo_id);

        Ok(Self { generator_pipeline })
    }
}

impl TranscribeHandler for WhisperModel {
    #[tracing::instrument(level = "info", skip(self))]
    fn run_transcribe(
        &mut self,
        audio: &Path,
        language: Option<&str>,
    ) -> Result<TranscribeResponse, Error> {
        let (language, segments) = self.generator_pipeline.transcribe(audio, language)?;
        let text = join_segments(&segments);

        Ok(TranscribeResponse {
            text,
            language,
            segments,
        })
    }
}

// Segment texts carry their own leading space
fn join_segments(segments: &[Segment]) -> String {
    segments
        .iter()
        .map(|segment| segment.text.as_str())
        .collect()
}
