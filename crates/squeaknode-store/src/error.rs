//! Error types for the store module.

use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Squeak serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A unique column (profile name, address, peer address) is taken.
    #[error("duplicate {0}")]
    Duplicate(String),

    /// Invalid data in storage.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// The connection mutex was poisoned or a blocking task panicked.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<squeaknode_core::CoreError> for StoreError {
    fn from(e: squeaknode_core::CoreError) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
