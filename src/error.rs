//! Application error taxonomy
//!
//! A single `AppError` enum covers every failure mode the engine can surface
//! to the HTTP boundary. Each variant maps to one of the semantic kinds in
//! the error handling design: Validation, NotFound, Conflict, Upstream,
//! Storage, Internal.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("position {0} not found")]
    NotFound(i64),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("upstream exchange error: {0}")]
    Upstream(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        AppError::Upstream(e.to_string())
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::BAD_REQUEST,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        // Storage/Internal failures are logged with full detail but the
        // client only ever sees a generic message - no internals leak out.
        match self {
            AppError::Storage(e) => {
                tracing::error!(error = %e, "storage operation failed");
                HttpResponse::build(self.status_code())
                    .json(serde_json::json!({"error": "internal storage error"}))
            }
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "internal invariant violation");
                HttpResponse::build(self.status_code())
                    .json(serde_json::json!({"error": "internal error"}))
            }
            other => HttpResponse::build(self.status_code())
                .json(serde_json::json!({"error": other.to_string()})),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
