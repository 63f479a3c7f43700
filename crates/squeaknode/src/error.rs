//! Error types for the node.

use squeaknode_core::{CoreError, SqueakHash, ValidationError};
use squeaknode_payments::PaymentError;
use squeaknode_store::StoreError;
use squeaknode_sync::SyncError;
use thiserror::Error;

/// Errors that can occur during node operations.
///
/// Policy rejections at ingestion are not errors; see
/// [`crate::ingest::IngestOutcome`].
#[derive(Debug, Error)]
pub enum NodeError {
    /// Validation error.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Core primitive error.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Offer or payment error.
    #[error("payment error: {0}")]
    Payment(#[from] PaymentError),

    /// Sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// The blockchain oracle is unreachable. Transient.
    #[error("oracle error: {0}")]
    Oracle(String),

    /// A profile operation was refused.
    #[error("profile error: {0}")]
    Profile(String),

    /// The squeak is not stored locally.
    #[error("squeak not found: {0}")]
    SqueakNotFound(SqueakHash),

    /// Invalid operation.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl NodeError {
    /// Whether retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            NodeError::Oracle(_) => true,
            NodeError::Payment(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
