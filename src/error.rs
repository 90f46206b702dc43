//! Error types for the order sync service

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::sync::{QueueError, ResolveError, SyncError};

/// Application-wide result type
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),
}

/// Error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "database_error",
                    "Database error".to_string(),
                )
            }
            AppError::Sync(e) => match e {
                SyncError::Queue(QueueError::Blocked(_))
                | SyncError::Queue(QueueError::EntityDeleted(_)) => {
                    (StatusCode::CONFLICT, "queue_blocked", e.to_string())
                }
                SyncError::Queue(QueueError::UnknownEntity(_)) => {
                    (StatusCode::NOT_FOUND, "unknown_entity", e.to_string())
                }
                SyncError::Resolve(ResolveError::NotInConflict(_)) => {
                    (StatusCode::CONFLICT, "not_in_conflict", e.to_string())
                }
                _ => {
                    tracing::error!("Sync error: {}", e);
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "sync_error",
                        "Sync storage error".to_string(),
                    )
                }
            },
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
            details: if cfg!(debug_assertions) {
                Some(self.to_string())
            } else {
                None
            },
        });

        (status, body).into_response()
    }
}
