//! Error types for snapshot storage and coordination

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Dashboard snapshot not found: {0}")]
    NotFound(String),

    /// Payload or request is malformed. Not retryable for the same input.
    #[error("Invalid snapshot: {0}")]
    Validation(String),

    #[error("Dashboard snapshot already exists: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SnapshotError {
    /// Whether the caller's next poll may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SnapshotError::Database(_) | SnapshotError::Internal(_))
    }
}

pub type Result<T> = std::result::Result<T, SnapshotError>;
