//! Sync error types

use thiserror::Error;

/// Errors raised synchronously by the mutation queue
#[derive(Debug, Error)]
pub enum QueueError {
    /// The entity is parked in conflict; resolve it first
    #[error("Queue blocked: entity {0} is in conflict")]
    Blocked(String),

    /// A delete is already queued for the entity
    #[error("Entity {0} is pending deletion")]
    EntityDeleted(String),

    /// Update or delete for an entity with no known server version
    #[error("Entity {0} has never been synced")]
    UnknownEntity(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt queue record: {0}")]
    Corrupt(String),
}

/// Errors raised by conflict resolution
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Entity {0} is not in conflict")]
    NotInConflict(String),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Failures reported by the remote transport
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    /// Connection dropped, DNS failure, 5xx
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    /// The base version no longer matches the server (409/412)
    #[error("Version mismatch")]
    VersionMismatch,

    #[error("Not found: {0}")]
    NotFound(String),

    /// The server rejected the payload content (400/422)
    #[error("Validation failed: {0}")]
    Validation(String),
}

impl TransportError {
    /// Whether the failure should be retried with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Network(_) | TransportError::Timeout)
    }
}

/// Umbrella error for the engine facade
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;
