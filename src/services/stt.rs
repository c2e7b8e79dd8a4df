use std::sync::Arc;

use axum::extract::multipart::MultipartRejection;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use hf_hub::api::sync::Api;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::bail_service;
use crate::config::Config;
use crate::error::ServiceError;
use crate::inference::models::model::{ModelBase, ModelHandle, ModelTask};
use crate::inference::models::whisper::WhisperModel;
use crate::inference::task::transcribe::{TranscribeHandler, TranscribeResponse};
use crate::language::{whisper_language_code, WHISPER_LANGUAGES};
use crate::services::{
    handle_favicon, run_blocking, HealthResponse, IndexResponse, JsonResult, LanguagesResponse,
};

pub const SERVICE: &str = "whisper-stt";

#[derive(Clone)]
pub struct SttState {
    model: ModelHandle<dyn TranscribeHandler>,
    base: Arc<ModelBase>,
}

impl SttState {
    pub fn new(model: ModelHandle<dyn TranscribeHandler>, base: ModelBase) -> Self {
        Self {
            model,
            base: Arc::new(base),
        }
    }

    /// Loads Whisper, keeping the service up with an unavailable model when that fails.
    pub fn load(config: &Config) -> Self {
        let base = ModelBase {
            name: "Candle Whisper".into(),
            license: "MIT".into(),
            task: ModelTask::Transcribe,
            repo_id: config.whisper_repo.clone(),
            repo_revision: config.whisper_revision.clone(),
        };
        let loaded = Api::new().map_err(anyhow::Error::from).and_then(|api| {
            WhisperModel::new(
                api,
                &base,
                &config.whisper_config,
                &config.whisper_tokenizer,
                &config.whisper_weights,
                &config.mel_filters,
            )
        });
        let model = match loaded {
            Ok(model) => {
                let model: Arc<Mutex<dyn TranscribeHandler>> = Arc::new(Mutex::new(model));
                ModelHandle::loaded(model)
            }
            Err(err) => {
                error!("Failed to load {}: {err:#}", base.name);
                ModelHandle::unavailable(format!("{err:#}"))
            }
        };
        Self::new(model, base)
    }
}

pub fn router(state: SttState, body_limit: usize) -> Router {
    let api_router = Router::new()
        .route("/transcribe", post(handle_transcribe_request))
        .route("/stt", post(handle_transcribe_request))
        .route("/models", get(handle_models_request))
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
            ("/api/transcribe", "Speech-to-text transcription"),
            ("/api/models", "List available models"),
            ("/api/languages", "List supported languages"),
        ],
    ))
}

#[axum_macros::debug_handler]
async fn handle_health_request(State(state): State<SttState>) -> Json<HealthResponse> {
    Json(HealthResponse::new(SERVICE, state.model.is_loaded(), "cpu"))
}

#[derive(Serialize, Debug)]
struct ModelsResponse {
    models: Vec<String>,
    current_model: String,
    repo_id: String,
    device: &'static str,
}

#[axum_macros::debug_handler]
async fn handle_models_request(State(state): State<SttState>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        models: vec![state.base.name.clone()],
        current_model: state.base.name.clone(),
        repo_id: state.base.repo_id.clone(),
        device: "cpu",
    })
}

#[axum_macros::debug_handler]
async fn handle_languages_request() -> Json<LanguagesResponse> {
    Json(LanguagesResponse::new(
        WHISPER_LANGUAGES.iter().map(|(code, _)| *code).collect(),
    ))
}

#[axum_macros::debug_handler]
async fn handle_transcribe_request(
    State(state): State<SttState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> JsonResult<TranscribeResponse> {
    let mut multipart = multipart.map_err(|e| ServiceError::bad_request(e.body_text()))?;
    let mut audio = None;
    let mut language = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServiceError::bad_request(e.body_text()))?
    {
        match field.name() {
            Some("audio") => {
                // Only file parts count as an upload
                let Some(file_name) = field.file_name().map(str::to_string) else {
                    continue;
                };
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ServiceError::bad_request(e.body_text()))?;
                audio = Some((file_name, bytes));
            }
            Some("language") => {
                let hint = field
                    .text()
                    .await
                    .map_err(|e| ServiceError::bad_request(e.body_text()))?;
                if !hint.trim().is_empty() {
                    language = Some(hint);
                }
            }
            _ => {}
        }
    }

    let Some((file_name, bytes)) = audio else {
        bail_service!(StatusCode::BAD_REQUEST, "Audio file is required")
    };
    if file_name.is_empty() {
        bail_service!(StatusCode::BAD_REQUEST, "No audio file selected")
    }
    let model = state.model.get()?;

    // Unknown hints are passed through and rejected by the model
    let language =
        language.map(|hint| whisper_language_code(&hint).map_or(hint.clone(), str::to_string));

    info!("Processing audio file: {file_name}");

    let mut response = run_blocking(move || {
        let file = tempfile::Builder::new()
            .prefix("stt-")
            .suffix(".wav")
            .tempfile()?;
        std::fs::write(file.path(), &bytes)?;
        let result = model
            .blocking_lock()
            .run_transcribe(file.path(), language.as_deref());
        drop(file);
        result.map_err(|e| ServiceError::inference("Transcription failed", e))
    })
    .await?;

    response.text = response.text.trim().to_string();
    if response.language.is_empty() {
        response.language = "unknown".into();
    }
    let preview: String = response.text.chars().take(50).collect();
    info!("Transcription completed: {preview}...");

    Ok((StatusCode::OK, Json(response)))
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::Mutex as StdMutex;

    use anyhow::{bail, Error};
    use axum::body::Body;
    use axum::http::Request;

    use super::*;
    use crate::services::testing::{get, post_json, send_json};

    #[derive(Default)]
    struct Calls {
        paths: Vec<PathBuf>,
        existed: Vec<bool>,
        sizes: Vec<u64>,
        languages: Vec<Option<String>>,
    }

    struct FakeWhisper {
        calls: Arc<StdMutex<Calls>>,
        fail: bool,
    }

    impl TranscribeHandler for FakeWhisper {
        fn run_transcribe(
            &mut self,
            audio: &Path,
            language: Option<&str>,
        ) -> Result<TranscribeResponse, Error> {
            let mut calls = self.calls.lock().unwrap();
            calls.paths.push(audio.to_path_buf());
            calls.existed.push(audio.exists());
            calls
                .sizes
                .push(std::fs::metadata(audio).map_or(0, |meta| meta.len()));
            calls.languages.push(language.map(str::to_string));
            if self.fail {
                bail!("unsupported codec");
            }
            Ok(TranscribeResponse {
                text: "  hello world \n".into(),
                language: language.unwrap_or("en").into(),
                segments: vec![],
            })
        }
    }

    fn base() -> ModelBase {
        ModelBase {
            name: "Fake Whisper".into(),
            license: "MIT".into(),
            task: ModelTask::Transcribe,
            repo_id: "local/fake".into(),
            repo_revision: "main".into(),
        }
    }

    fn app(fail: bool) -> (Router, Arc<StdMutex<Calls>>) {
        let calls = Arc::new(StdMutex::new(Calls::default()));
        let model: Arc<Mutex<dyn TranscribeHandler>> = Arc::new(Mutex::new(FakeWhisper {
            calls: calls.clone(),
            fail,
        }));
        let state = SttState::new(ModelHandle::loaded(model), base());
        (router(state, 1_000_000), calls)
    }

    fn unavailable_app() -> Router {
        router(
            SttState::new(ModelHandle::unavailable("weights missing"), base()),
            1_000_000,
        )
    }

    fn multipart(uri: &str, parts: &[(&str, Option<&str>, &str)]) -> Request<Body> {
        let mut body = String::new();
        for (name, file_name, content) in parts {
            body.push_str("--BOUNDARY\r\n");
            match file_name {
                Some(file_name) => body.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\nContent-Type: audio/wav\r\n\r\n"
                )),
                None => body.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{name}\"\r\n\r\n"
                )),
            }
            body.push_str(content);
            body.push_str("\r\n");
        }
        body.push_str("--BOUNDARY--\r\n");
        Request::post(uri)
            .header("content-type", "multipart/form-data; boundary=BOUNDARY")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn missing_audio_is_rejected_without_calling_the_model() {
        let (app, calls) = app(false);
        let (status, body) =
            send_json(app, multipart("/api/transcribe", &[("language", None, "de")])).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Audio file is required");
        assert!(calls.lock().unwrap().paths.is_empty());
    }

    #[tokio::test]
    async fn empty_file_name_is_rejected_without_calling_the_model() {
        let (app, calls) = app(false);
        let (status, body) =
            send_json(app, multipart("/api/transcribe", &[("audio", Some(""), "")])).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "No audio file selected");
        assert!(calls.lock().unwrap().paths.is_empty());
    }

    #[tokio::test]
    async fn non_multipart_body_is_a_bad_request() {
        let (app, calls) = app(false);
        let (status, body) = send_json(app, post_json("/api/stt", "{}")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
        assert!(calls.lock().unwrap().paths.is_empty());
    }

    #[tokio::test]
    async fn transcribes_and_removes_the_upload() {
        let (app, calls) = app(false);
        let request = multipart(
            "/api/transcribe",
            &[("audio", Some("clip.wav"), "RIFF"), ("language", None, "German")],
        );
        let (status, body) = send_json(app, request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["text"], "hello world");
        assert_eq!(body["language"], "de");
        assert_eq!(body["segments"], serde_json::json!([]));

        let calls = calls.lock().unwrap();
        assert_eq!(calls.existed, vec![true]);
        assert_eq!(calls.sizes, vec![4]);
        assert_eq!(calls.languages, vec![Some("de".to_string())]);
        assert!(calls.paths[0].to_string_lossy().ends_with(".wav"));
        assert!(!calls.paths[0].exists());
    }

    #[tokio::test]
    async fn failed_transcription_is_500_and_removes_the_upload() {
        let (app, calls) = app(true);
        let request = multipart("/api/stt", &[("audio", Some("clip.wav"), "RIFF")]);
        let (status, body) = send_json(app, request).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Transcription failed: unsupported codec");

        let calls = calls.lock().unwrap();
        assert_eq!(calls.languages, vec![None]);
        assert!(!calls.paths[0].exists());
    }

    #[tokio::test]
    async fn unloaded_model_answers_503_after_validation() {
        let (status, _) = send_json(
            unavailable_app(),
            multipart("/api/transcribe", &[("language", None, "de")]),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send_json(
            unavailable_app(),
            multipart("/api/transcribe", &[("audio", Some("clip.wav"), "RIFF")]),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "Model not loaded: weights missing");
    }

    #[tokio::test]
    async fn health_reports_model_state() {
        let (status, body) = send_json(unavailable_app(), get("/health")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], SERVICE);
        assert_eq!(body["model_loaded"], false);
    }

    #[tokio::test]
    async fn index_lists_endpoints() {
        let (app, _) = app(false);
        let (status, body) = send_json(app, get("/")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "running");
        assert!(body["endpoints"]["/api/transcribe"].is_string());
    }
}
