use std::collections::BTreeMap;

use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::error::ServiceResult;

pub mod stt;
pub mod translation;
pub mod tts;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Serialize, Debug)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub model_loaded: bool,
    pub device: String,
}

impl HealthResponse {
    /// Always healthy while the process serves requests, model state is reported separately.
    pub fn new(service: &'static str, model_loaded: bool, device: &str) -> Self {
        Self {
            status: "healthy",
            service,
            model_loaded,
            device: device.to_string(),
        }
    }
}

#[derive(Serialize, Debug)]
pub struct IndexResponse {
    pub service: &'static str,
    pub status: &'static str,
    pub version: &'static str,
    pub endpoints: BTreeMap<&'static str, &'static str>,
}

impl IndexResponse {
    pub fn new(service: &'static str, endpoints: &[(&'static str, &'static str)]) -> Self {
        Self {
            service,
            status: "running",
            version: VERSION,
            endpoints: endpoints.iter().copied().collect(),
        }
    }
}

#[derive(Serialize, Debug)]
pub struct LanguagesResponse {
    pub supported_languages: Vec<&'static str>,
    pub total_languages: usize,
}

impl LanguagesResponse {
    pub fn new(supported_languages: Vec<&'static str>) -> Self {
        Self {
            total_languages: supported_languages.len(),
            supported_languages,
        }
    }
}

#[axum_macros::debug_handler]
pub async fn handle_favicon() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// Runs model work on the blocking pool. A panic inside `f` surfaces as a 500.
pub async fn run_blocking<F, T>(f: F) -> ServiceResult<T>
where
    F: FnOnce() -> ServiceResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

pub type JsonResult<T> = ServiceResult<(StatusCode, Json<T>)>;

#[cfg(test)]
pub(crate) mod testing {
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use serde_json::Value;
    use tower::ServiceExt;

    pub(crate) async fn send(router: Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    pub(crate) async fn send_json(router: Router, request: Request<Body>) -> (StatusCode, Value) {
        let (status, body) = send(router, request).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    pub(crate) fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    pub(crate) fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }
}
