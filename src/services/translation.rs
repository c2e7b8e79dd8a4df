use std::sync::Arc;
use std::time::Instant;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use hf_hub::api::sync::Api;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::bail_service;
use crate::config::Config;
use crate::error::ServiceError;
use crate::extractors::JsonBody;
use crate::inference::models::madlad::MadladModel;
use crate::inference::models::model::{ModelBase, ModelHandle, ModelTask};
use crate::inference::task::translate::{
    DetectRequest, DetectResponse, TranslateHandler, TranslateRequest, TranslateResponse,
};
use crate::language::{detect_language, TRANSLATION_LANGUAGES};
use crate::services::{
    handle_favicon, run_blocking, HealthResponse, IndexResponse, JsonResult, LanguagesResponse,
};

pub const SERVICE: &str = "madlad-translation";

/// Detection reports a fixed confidence, the detector's own score is not exposed.
const DETECT_CONFIDENCE: f64 = 0.8;

#[derive(Clone)]
pub struct TranslationState {
    model: ModelHandle<dyn TranslateHandler>,
}

impl TranslationState {
    pub fn new(model: ModelHandle<dyn TranslateHandler>) -> Self {
        Self { model }
    }

    /// Loads MADLAD-400, keeping the service up with an unavailable model when that fails.
    pub fn load(config: &Config) -> Self {
        let base = ModelBase {
            name: "MADLAD-400 3B MT".into(),
            license: "Apache-2.0".into(),
            task: ModelTask::Translate,
            repo_id: config.translation_repo.clone(),
            repo_revision: config.translation_revision.clone(),
        };
        let loaded = Api::new().map_err(anyhow::Error::from).and_then(|api| {
            MadladModel::new(
                api,
                &base,
                &config.translation_config,
                &config.translation_tokenizer,
                &config.translation_weights,
            )
        });
        let model = match loaded {
            Ok(model) => {
                let model: Arc<Mutex<dyn TranslateHandler>> = Arc::new(Mutex::new(model));
                ModelHandle::loaded(model)
            }
            Err(err) => {
                error!("Failed to load {}: {err:#}", base.name);
                ModelHandle::unavailable(format!("{err:#}"))
            }
        };
        Self::new(model)
    }
}

pub fn router(state: TranslationState, body_limit: usize) -> Router {
    let api_router = Router::new()
        .route("/translate", post(handle_translate_request))
        .route("/detect", post(handle_detect_request))
        .route("/languages", get(handle_languages_request))
        .layer(DefaultBodyLimit::max(body_limit));

    Router::new()
        .route("/", get(handle_index_request))
        .route("/health", get(handle_health_request))
        .route("/favicon.ico", get(handle_favicon))
        .nest("/api", api_router)
        .with_state(state)
}

#[axum_macros::debug_handler]
async fn handle_index_request() -> Json<IndexResponse> {
    Json(IndexResponse::new(
        SERVICE,
        &[
            ("/health", "Health check"),
            ("/api/translate", "Text translation"),
            ("/api/detect", "Language detection"),
            ("/api/languages", "List supported languages"),
        ],
    ))
}

#[axum_macros::debug_handler]
async fn handle_health_request(State(state): State<TranslationState>) -> Json<HealthResponse> {
    Json(HealthResponse::new(SERVICE, state.model.is_loaded(), "cpu"))
}

#[axum_macros::debug_handler]
async fn handle_languages_request() -> Json<LanguagesResponse> {
    Json(LanguagesResponse::new(TRANSLATION_LANGUAGES.codes()))
}

#[axum_macros::debug_handler]
async fn handle_detect_request(
    JsonBody(req): JsonBody<DetectRequest>,
) -> JsonResult<DetectResponse> {
    let Some(text) = req.text else {
        bail_service!(StatusCode::BAD_REQUEST, "Text is required")
    };
    let detected = detect_language(&text);

    Ok((
        StatusCode::OK,
        Json(DetectResponse {
            text,
            language: detected.to_string(),
            detected_language: detected.to_string(),
            confidence: DETECT_CONFIDENCE,
        }),
    ))
}

#[axum_macros::debug_handler]
async fn handle_translate_request(
    State(state): State<TranslationState>,
    JsonBody(req): JsonBody<TranslateRequest>,
) -> JsonResult<TranslateResponse> {
    let Some(text) = req.text else {
        bail_service!(StatusCode::BAD_REQUEST, "Text is required")
    };
    let model = state.model.get()?;

    let source = match req.source_language.as_deref() {
        Some(code) if !code.trim().is_empty() => TRANSLATION_LANGUAGES.resolve(code),
        _ => TRANSLATION_LANGUAGES.resolve(detect_language(&text)),
    };
    let target = TRANSLATION_LANGUAGES.resolve(req.target_language.as_deref().unwrap_or("en"));
    let preview: String = text.chars().take(50).collect();
    info!("Translating from {source} to {target}: {preview}...");

    let start = Instant::now();
    let translated_text = if source == target {
        text.clone()
    } else {
        let input = text.clone();
        run_blocking(move || {
            model
                .blocking_lock()
                .run_translate(&input, source, target)
                .map_err(|e| ServiceError::inference("Translation failed", e))
        })
        .await?
        .trim()
        .to_string()
    };
    let processing_time = round_millis(start.elapsed().as_secs_f64());
    info!("Translation completed in {processing_time:.3}s");

    Ok((
        StatusCode::OK,
        Json(TranslateResponse {
            original_text: text,
            translated_text,
            source_language: source.to_string(),
            target_language: target.to_string(),
            processing_time,
        }),
    ))
}

fn round_millis(seconds: f64) -> f64 {
    (seconds * 1000.0).round() / 1000.0
}
