use axum::async_trait;
use axum::extract::{FromRequest, Request};
use axum::Json;
use serde::de::DeserializeOwned;

use crate::error::ServiceError;

/// JSON body whose rejections are rendered as `{"error": ...}` with status 400.
pub(crate) struct JsonBody<T>(pub(crate) T);

#[async_trait]
impl<S, T> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(JsonBody(value)),
            Err(rejection) => Err(ServiceError::bad_request(format!(
                "Invalid JSON body: {}",
                rejection.body_text()
            ))),
        }
    }
}
