use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{ServiceError, ServiceResult};

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ModelBase {
    /// The name of the model
    pub name: String,

    /// The license of the model
    pub license: String,

    /// The task the model is served for
    pub task: ModelTask,

    /// The id of the model repository
    pub repo_id: String,

    /// The revision of the model repository
    pub repo_revision: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ModelTask {
    Transcribe,
    Synthesize,
    Translate,
}

/// Process-wide handle to a model loaded at startup.
///
/// A failed load is kept as the failure reason so that every request can be
/// answered with 503 instead of bringing the process down.
pub struct ModelHandle<T: ?Sized> {
    inner: Result<Arc<Mutex<T>>, Arc<str>>,
}

impl<T: ?Sized> Clone for ModelHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: ?Sized> ModelHandle<T> {
    pub fn loaded(model: Arc<Mutex<T>>) -> Self {
        Self { inner: Ok(model) }
    }

    pub fn unavailable(reason: impl Into<Arc<str>>) -> Self {
        Self {
            inner: Err(reason.into()),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.is_ok()
    }

    pub fn get(&self) -> ServiceResult<Arc<Mutex<T>>> {
        match &self.inner {
            Ok(model) => Ok(model.clone()),
            Err(reason) => Err(ServiceError::unavailable(format!(
                "Model not loaded: {reason}"
            ))),
        }
    }
}
