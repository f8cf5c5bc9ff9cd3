//! Error responses.
//!
//! Every failure is rendered as `{"code": <u32>, "description": <string>}`
//! with the HTTP status of the underlying `DirectorError`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use director_core::DirectorError;
use director_jobs::JobError;
use director_lock::LockError;
use director_state::StateError;
use director_tasks::TaskError;
use serde::Serialize;
use tracing::error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub struct ApiError(pub DirectorError);

#[derive(Debug, Serialize, serde::Deserialize)]
pub struct ErrorBody {
    pub code: u32,
    pub description: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(code = self.0.code(), error = %self.0, "request failed");
        }
        let body = ErrorBody {
            code: self.0.code(),
            description: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<DirectorError> for ApiError {
    fn from(e: DirectorError) -> Self {
        Self(e)
    }
}

impl From<StateError> for ApiError {
    fn from(e: StateError) -> Self {
        Self(DirectorError::Internal(e.to_string()))
    }
}

impl From<TaskError> for ApiError {
    fn from(e: TaskError) -> Self {
        Self(e.into())
    }
}

impl From<LockError> for ApiError {
    fn from(e: LockError) -> Self {
        Self(e.into())
    }
}

impl From<JobError> for ApiError {
    fn from(e: JobError) -> Self {
        Self(e.into())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        Self(DirectorError::Internal(e.to_string()))
    }
}
