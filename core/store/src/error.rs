//! Error types for the memory store.

use rusqlite::ErrorCode;
use thiserror::Error;
use user_memory_schemas::UserId;

/// Result type alias using `MemoryError`
pub type Result<T> = std::result::Result<T, MemoryError>;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MemoryError {
    pub fn unknown_user(user_id: &UserId) -> Self {
        MemoryError::NotFound(format!("user {}", user_id))
    }

    pub fn validation(message: impl Into<String>) -> Self {
        MemoryError::Validation(message.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, MemoryError::NotFound(_))
    }

    /// True when a write lost a race against a uniqueness constraint.
    pub(crate) fn is_constraint_violation(&self) -> bool {
        match self {
            MemoryError::StorageUnavailable(rusqlite::Error::SqliteFailure(err, _)) => {
                err.code == ErrorCode::ConstraintViolation
            }
            _ => false,
        }
    }
}
