//! REST API endpoint modules.

pub mod settings;
pub mod status;
pub mod sync;

use axum::http::StatusCode;
use axum::Json;

use shelfsync_core::errors::{SchedulerError, SyncError};

// ---------------------------------------------------------------------------
// Shared error type for API handlers
// ---------------------------------------------------------------------------

/// Simple API error type that converts to an Axum response.
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unprocessable(String),
    Internal(String),
}

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = serde_json::json!({ "error": message });
        (status, Json(body)).into_response()
    }
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        let message = err.to_string();
        match err {
            SyncError::UnknownProvider(_) => AppError::NotFound(message),
            SyncError::NotConfigured(_) => AppError::Unprocessable(message),
            SyncError::AlreadySyncing(_) => AppError::Conflict(message),
            SyncError::Status(_) | SyncError::Provider { .. } => AppError::Internal(message),
        }
    }
}

impl From<SchedulerError> for AppError {
    fn from(err: SchedulerError) -> Self {
        let message = err.to_string();
        match err {
            SchedulerError::Interval(_) => AppError::BadRequest(message),
            SchedulerError::Storage(_)
            | SchedulerError::WriteAborted(_)
            | SchedulerError::Unavailable => {
                AppError::Internal(message)
            }
        }
    }
}
