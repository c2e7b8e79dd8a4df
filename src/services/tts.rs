use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::bail_service;
use crate::config::Config;
use crate::error::{ServiceError, ServiceResult};
use crate::extractors::JsonBody;
use crate::inference::models::coqui::{CoquiModel, WorkerCommand};
use crate::inference::models::model::{ModelBase, ModelHandle, ModelTask};
use crate::inference::task::synthesize::{
    SynthesisParams, SynthesizeHandler, SynthesizeRequest, Voice,
};
use crate::language::SYNTHESIS_LANGUAGES;
use crate::services::{
    handle_favicon, run_blocking, HealthResponse, IndexResponse, LanguagesResponse,
};

pub const SERVICE: &str = "coqui-tts";

#[derive(Clone)]
pub struct TtsState {
    model: ModelHandle<dyn SynthesizeHandler>,
    base: Arc<ModelBase>,
    // Captured at load time so introspection never waits on a running synthesis
    speakers: Arc<[String]>,
    multilingual: bool,
    device: Arc<str>,
}

impl TtsState {
    pub fn new<M>(model: M, base: ModelBase, device: &str) -> Self
    where
        M: SynthesizeHandler + 'static,
    {
        let speakers: Arc<[String]> = model.speakers().into();
        let multilingual = model.is_multilingual();
        let model: Arc<Mutex<dyn SynthesizeHandler>> = Arc::new(Mutex::new(model));
        Self {
            model: ModelHandle::loaded(model),
            base: Arc::new(base),
            speakers,
            multilingual,
            device: device.into(),
        }
    }

    pub fn unavailable(reason: &str, base: ModelBase) -> Self {
        Self {
            model: ModelHandle::unavailable(reason),
            base: Arc::new(base),
            speakers: Arc::new([]),
            multilingual: false,
            device: "cpu".into(),
        }
    }

    /// Starts the synthesis worker, keeping the service up with an unavailable model when that fails.
    pub fn load(config: &Config) -> Self {
        let base = ModelBase {
            name: "Coqui XTTS".into(),
            license: "CPML".into(),
            task: ModelTask::Synthesize,
            repo_id: config.tts_model.clone(),
            repo_revision: "main".into(),
        };
        let command = WorkerCommand::coqui(
            &config.tts_program,
            &config.tts_worker_script,
            &config.tts_model,
            &config.tts_cache_dir,
        );
        match CoquiModel::new(&base, &command) {
            Ok(model) => {
                let device = model.device().to_string();
                Self::new(model, base, &device)
            }
            Err(err) => {
                error!("Failed to load {}: {err:#}", base.name);
                Self::unavailable(&format!("{err:#}"), base)
            }
        }
    }
}

pub fn router(state: TtsState, body_limit: usize) -> Router {
    let api_router = Router::new()
        .route("/tts", post(handle_tts_request))
        .route("/models", get(handle_models_request))
        .route("/languages", get(handle_languages_request))
        .route("/speakers", get(handle_speakers_request))
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
            ("/api/tts", "Text-to-speech synthesis"),
            ("/api/models", "List available models"),
            ("/api/languages", "List supported languages"),
            ("/api/speakers", "List built-in speakers"),
        ],
    ))
}

#[axum_macros::debug_handler]
async fn handle_health_request(State(state): State<TtsState>) -> Json<HealthResponse> {
    Json(HealthResponse::new(
        SERVICE,
        state.model.is_loaded(),
        &state.device,
    ))
}

#[derive(Serialize, Debug)]
struct ModelsResponse {
    models: Vec<String>,
    languages: Vec<&'static str>,
}

#[axum_macros::debug_handler]
async fn handle_models_request(State(state): State<TtsState>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        models: vec![state.base.repo_id.clone()],
        languages: SYNTHESIS_LANGUAGES.codes(),
    })
}

#[axum_macros::debug_handler]
async fn handle_languages_request() -> Json<LanguagesResponse> {
    Json(LanguagesResponse::new(SYNTHESIS_LANGUAGES.codes()))
}

#[derive(Serialize, Debug)]
struct SpeakersResponse {
    speakers: Vec<String>,
    total_speakers: usize,
}

#[axum_macros::debug_handler]
async fn handle_speakers_request(
    State(state): State<TtsState>,
) -> ServiceResult<Json<SpeakersResponse>> {
    state.model.get()?;
    Ok(Json(SpeakersResponse {
        speakers: state.speakers.to_vec(),
        total_speakers: state.speakers.len(),
    }))
}

#[axum_macros::debug_handler]
async fn handle_tts_request(
    State(state): State<TtsState>,
    JsonBody(req): JsonBody<SynthesizeRequest>,
) -> ServiceResult<impl IntoResponse> {
    let text = match req.text.as_deref().map(str::trim) {
        Some(text) if !text.is_empty() => text.to_string(),
        _ => bail_service!(StatusCode::BAD_REQUEST, "Text is required"),
    };
    let model = state.model.get()?;

    let language = SYNTHESIS_LANGUAGES.resolve(req.language_id.as_deref().unwrap_or("en"));
    let voice = Voice::select(&req, &state.speakers);
    let params = SynthesisParams {
        text,
        language: state.multilingual.then(|| language.to_string()),
        voice,
        speed: state.multilingual.then(|| req.speed.unwrap_or(1.0)),
    };
    let preview: String = params.text.chars().take(50).collect();
    info!("Generating speech for text: {preview}... in language: {language}");

    let file = tempfile::Builder::new()
        .prefix("tts-")
        .suffix(".wav")
        .tempfile()?;
    let audio = run_blocking(move || {
        model
            .blocking_lock()
            .run_synthesize(&params, file.path())
            .map_err(|e| ServiceError::inference("TTS generation failed", e))?;
        let audio = std::fs::read(file.path())
            .map_err(|e| ServiceError::inference("TTS generation failed", e))?;
        drop(file);
        if audio.is_empty() {
            bail_service!("TTS generation failed: no audio was produced");
        }
        Ok(audio)
    })
    .await?;

    Ok(([(header::CONTENT_TYPE, "audio/wav")], audio))
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::Mutex as StdMutex;

    use anyhow::{bail, Error};

    use super::*;
    use crate::services::testing::{get, post_json, send, send_json};

    #[derive(Default)]
    struct Calls {
        params: Vec<SynthesisParams>,
        outputs: Vec<PathBuf>,
    }

    struct FakeTts {
        calls: Arc<StdMutex<Calls>>,
        speakers: Vec<String>,
        multilingual: bool,
        fail: bool,
    }

    impl SynthesizeHandler for FakeTts {
        fn speakers(&self) -> &[String] {
            &self.speakers
        }

        fn is_multilingual(&self) -> bool {
            self.multilingual
        }

        fn run_synthesize(&mut self, params: &SynthesisParams, output: &Path) -> Result<(), Error> {
            let mut calls = self.calls.lock().unwrap();
            calls.params.push(params.clone());
            calls.outputs.push(output.to_path_buf());
            if self.fail {
                bail!("speaker not found");
            }
            std::fs::write(output, b"RIFF....WAVE")?;
            Ok(())
        }
    }

    fn base() -> ModelBase {
        ModelBase {
            name: "Fake TTS".into(),
            license: "MIT".into(),
            task: ModelTask::Synthesize,
            repo_id: "tts_models/fake".into(),
            repo_revision: "main".into(),
        }
    }

    fn app(multilingual: bool, fail: bool) -> (Router, Arc<StdMutex<Calls>>) {
        let calls = Arc::new(StdMutex::new(Calls::default()));
        let model = FakeTts {
            calls: calls.clone(),
            speakers: vec!["Ana Florence".into(), "Bob".into()],
            multilingual,
            fail,
        };
        (router(TtsState::new(model, base(), "cpu"), 1_000_000), calls)
    }

    #[tokio::test]
    async fn blank_text_is_rejected_without_calling_the_model() {
        for body in [r#"{}"#, r#"{"text": "   "}"#] {
            let (app, calls) = app(true, false);
            let (status, json) = send_json(app, post_json("/api/tts", body)).await;

            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(json["error"], "Text is required");
            assert!(calls.lock().unwrap().params.is_empty());
        }
    }

    #[tokio::test]
    async fn malformed_json_is_a_bad_request() {
        let (app, _) = app(true, false);
        let (status, json) = send_json(app, post_json("/api/tts", "{not json")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"]
            .as_str()
            .unwrap()
            .starts_with("Invalid JSON body"));
    }

    #[tokio::test]
    async fn returns_wav_and_removes_the_output_file() {
        let (app, calls) = app(true, false);
        let response = tower::ServiceExt::oneshot(
            app,
            post_json("/api/tts", r#"{"text": "Hi", "language_id": "sv"}"#),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/wav");
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"RIFF....WAVE");

        let calls = calls.lock().unwrap();
        let params = &calls.params[0];
        assert_eq!(params.text, "Hi");
        assert_eq!(params.language.as_deref(), Some("en"));
        assert_eq!(params.speed, Some(1.0));
        assert_eq!(params.voice, Voice::Preset("Ana Florence".into()));
        assert!(!calls.outputs[0].exists());
    }

    #[tokio::test]
    async fn single_language_models_get_no_language_or_speed() {
        let (app, calls) = app(false, false);
        let body = r#"{"text": "Hi", "language_id": "de", "speed": 1.5, "speaker": "Bob"}"#;
        let (status, _) = send(app, post_json("/api/tts", body)).await;

        assert_eq!(status, StatusCode::OK);
        let calls = calls.lock().unwrap();
        assert_eq!(calls.params[0].language, None);
        assert_eq!(calls.params[0].speed, None);
        assert_eq!(calls.params[0].voice, Voice::Preset("Bob".into()));
    }

    #[tokio::test]
    async fn failed_synthesis_is_500_and_removes_the_output_file() {
        let (app, calls) = app(true, true);
        let body = r#"{"text": "Hi", "speaker_wav": "/voices/me.wav"}"#;
        let (status, json) = send_json(app, post_json("/api/tts", body)).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["error"], "TTS generation failed: speaker not found");

        let calls = calls.lock().unwrap();
        assert_eq!(calls.params[0].voice, Voice::Clone("/voices/me.wav".into()));
        assert!(!calls.outputs[0].exists());
    }

    #[tokio::test]
    async fn unloaded_model_answers_503() {
        let app = router(TtsState::unavailable("No module named TTS", base()), 1_000_000);
        let request = post_json("/api/tts", r#"{"text": "Hi"}"#);
        let (status, json) = send_json(app.clone(), request).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["error"], "Model not loaded: No module named TTS");

        let (status, json) = send_json(app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["service"], SERVICE);
        assert_eq!(json["model_loaded"], false);
    }

    #[tokio::test]
    async fn speakers_come_from_the_model() {
        let (app, _) = app(true, false);
        let (status, json) = send_json(app, get("/api/speakers")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["speakers"], serde_json::json!(["Ana Florence", "Bob"]));
        assert_eq!(json["total_speakers"], 2);
    }
}
