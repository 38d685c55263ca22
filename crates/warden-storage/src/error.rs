//! Storage error types.

use thiserror::Error;

/// Errors that can occur in storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database error from rusqlite.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (e.g., creating the data directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The store could not be located or opened.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The connection lock was poisoned by a panicking holder.
    #[error("Connection pool poisoned")]
    Poisoned,
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
