use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::services::session_manager::{EnrollError, SessionError};
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Verification queue is at capacity")]
    QueueFull,

    #[error("No verification attempts remaining")]
    RetryExhausted,

    #[error("Session has expired")]
    SessionExpired,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl From<EnrollError> for AppError {
    fn from(err: EnrollError) -> Self {
        match err {
            EnrollError::UnknownCode { .. } => AppError::NotFound(err.to_string()),
            EnrollError::SessionExpired { .. } => AppError::SessionExpired,
            EnrollError::NotEnrolled { .. } | EnrollError::OutOfRange { .. } => {
                AppError::Validation(err.to_string())
            }
            EnrollError::RetryExhausted => AppError::RetryExhausted,
            EnrollError::QueueFull => AppError::QueueFull,
            EnrollError::Geofence(e) => AppError::Validation(e.to_string()),
            EnrollError::Store(e) => AppError::Store(e),
        }
    }
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::DuplicateSession { .. } => AppError::Conflict(err.to_string()),
            SessionError::CodeExhaustion { .. } => AppError::Internal(anyhow::anyhow!(err)),
            SessionError::EmptyRoster => AppError::Validation(err.to_string()),
            SessionError::Geofence(e) => AppError::Validation(e.to_string()),
            SessionError::Store(e) => AppError::Store(e),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let error_debug = format!("{:?}", self);

        let (status, error_message) = match self {
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::QueueFull => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Verification queue is full, retry shortly".to_string(),
            ),
            AppError::RetryExhausted => (
                StatusCode::TOO_MANY_REQUESTS,
                "No verification attempts remaining".to_string(),
            ),
            AppError::SessionExpired => (StatusCode::GONE, "Session has expired".to_string()),
            AppError::Store(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Storage error".to_string(),
            ),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        let body = Json(json!({
            "error": error_debug,
            "message": error_message,
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
