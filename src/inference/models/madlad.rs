use anyhow::{Error, Result};
use hf_hub::api::sync::Api;
use hf_hub::{Repo, RepoType};
use tracing::info;

use crate::inference::models::model::ModelBase;
use crate::inference::task::translate::TranslateHandler;
use crate::inference::translation_pipeline::TranslationPipeline;

pub struct MadladModel {
    generator_pipeline: TranslationPipeline,
}

impl MadladModel {
    #[tracing::instrument(level = "info", skip(api))]
    pub fn new(
        api: Api,
        base: &ModelBase,
        config_filename: &str,
        tokenizer_filename: &str,
        gguf_filename: &str,
    ) -> Result<Self> {
        let repo = api.repo(Repo::with_revision(
            base.repo_id.clone(),
            RepoType::Model,
            base.repo_revision.clone(),
        ));
        let generator_pipeline = TranslationPipeline::with_gguf_model(
            &repo,
            config_filename,
            tokenizer_filename,
            gguf_filename,
        )?;
        info!("Loaded {} from {}", base.name, base.repo_id);

        Ok(Self { generator_pipeline })
    }
}

impl TranslateHandler for MadladModel {
    #[tracing::instrument(level = "info", skip(self, text))]
    fn run_translate(&mut self, text: &str, source: &str, target: &str) -> Result<String, Error> {
        info!("Translating {} chars from {source} to {target}", text.chars().count());
        self.generator_pipeline.translate(text, target)
    }
}
