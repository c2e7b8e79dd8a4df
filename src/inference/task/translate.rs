use anyhow::Error;
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Debug)]
pub struct TranslateRequest {
    pub text: Option<String>,
    pub source_language: Option<String>,
    pub target_language: Option<String>,
}

#[derive(Deserialize, Serialize, Debug)]
pub struct TranslateResponse {
    pub original_text: String,
    pub translated_text: String,
    pub source_language: String,
    pub target_language: String,
    pub processing_time: f64,
}

#[derive(Deserialize, Debug)]
pub struct DetectRequest {
    pub text: Option<String>,
}

#[derive(Deserialize, Serialize, Debug)]
pub struct DetectResponse {
    pub text: String,
    pub language: String,
    pub detected_language: String,
    pub confidence: f64,
}

pub trait TranslateHandler: Send {
    /// Translates `text` between two canonical language codes that differ.
    fn run_translate(&mut self, text: &str, source: &str, target: &str) -> Result<String, Error>;
}
