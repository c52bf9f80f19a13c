//! Application error types and Axum response conversion.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use retrace_monitor::StoreError;
use retrace_shadow::ShadowError;
use serde::Serialize;

/// Application-level errors with HTTP status code mapping.
#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl AppError {
    /// Creates an Internal error from any error type.
    pub fn internal(e: impl std::fmt::Display) -> Self {
        AppError::Internal(e.to_string())
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvalidId(_) => AppError::BadRequest(e.to_string()),
            e => {
                tracing::error!(error = %e, "Store operation failed");
                AppError::internal(e)
            }
        }
    }
}

impl From<ShadowError> for AppError {
    fn from(e: ShadowError) -> Self {
        match e {
            ShadowError::InvalidId(_) => AppError::BadRequest(e.to_string()),
            ShadowError::Store(e) => e.into(),
            e => {
                tracing::error!(error = %e, "Shadow operation failed");
                AppError::internal(e)
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            AppError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}
