use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use thiserror::Error;

/// Errors produced anywhere in the session pipeline, collapsed to a single
/// type at the control-plane boundary so every handler returns the same
/// shape of JSON error body.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("session {0} not found")]
    NotFound(String),

    #[error("session pool at capacity")]
    AtCapacity,

    #[error("session {0} already exists")]
    AlreadyExists(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("browser driver error: {0}")]
    Driver(String),

    #[error("media pipeline error: {0}")]
    Media(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl AppError {
    fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "not_found",
            AppError::AtCapacity => "at_capacity",
            AppError::AlreadyExists(_) => "already_exists",
            AppError::Invalid(_) => "invalid",
            AppError::Driver(_) => "driver_error",
            AppError::Media(_) => "media_error",
            AppError::Transport(_) => "transport_error",
            AppError::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::AtCapacity => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::AlreadyExists(_) => StatusCode::CONFLICT,
            AppError::Invalid(_) => StatusCode::BAD_REQUEST,
            AppError::Driver(_) | AppError::Media(_) | AppError::Transport(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.kind(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
