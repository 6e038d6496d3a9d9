// API error type and its HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,

    #[error("exercise not found")]
    ExerciseNotFound,

    #[error("missing exercise id")]
    MissingId,

    #[error("overrides exceed {limit} bytes")]
    OverridesTooLarge { limit: usize },

    #[error("invalid override path '{0}'")]
    InvalidPath(String),

    /// The toolchain cannot be launched; no submission was created
    #[error("toolchain unavailable: {0}")]
    Spawn(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound | ApiError::ExerciseNotFound => StatusCode::NOT_FOUND,
            ApiError::MissingId | ApiError::OverridesTooLarge { .. } | ApiError::InvalidPath(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Spawn(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code sent as `{"error": code}`
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::NotFound => "not_found",
            ApiError::ExerciseNotFound => "exercise_not_found",
            ApiError::MissingId => "missing_id",
            ApiError::OverridesTooLarge { .. } => "overrides_too_large",
            ApiError::InvalidPath(_) => "invalid_path",
            ApiError::Spawn(_) => "spawn_error",
            ApiError::Unauthorized => "unauthorized",
            ApiError::Forbidden => "forbidden",
            ApiError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        (status, Json(json!({ "error": self.code() }))).into_response()
    }
}
