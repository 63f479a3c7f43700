//! Error types for offers and payments.

use squeaknode_core::{CoreError, PaymentHash, SqueakHash};
use squeaknode_store::StoreError;
use thiserror::Error;

/// Errors that can occur while negotiating offers or moving money.
#[derive(Debug, Error)]
pub enum PaymentError {
    /// The seller's proof does not match the buyer's challenge. The offer
    /// is discarded and must never be paid.
    #[error("proof mismatch for squeak {0}")]
    ProofMismatch(SqueakHash),

    /// The payment client could not pay. The offer stays payable.
    #[error("payment failed: {0}")]
    PaymentFailed(String),

    /// Payment succeeded but the revealed key does not open the content.
    #[error("payment {payment_hash} for squeak {squeak_hash} did not unlock the content")]
    IntegrityFailure {
        squeak_hash: SqueakHash,
        payment_hash: PaymentHash,
    },

    /// The received offer was already paid.
    #[error("offer {0} already paid")]
    AlreadyPaid(i64),

    /// The offer's invoice has expired.
    #[error("offer for squeak {0} has expired")]
    OfferExpired(SqueakHash),

    /// No received offer with this id.
    #[error("offer not found: {0}")]
    OfferNotFound(i64),

    /// The squeak is not stored locally.
    #[error("squeak not found: {0}")]
    SqueakNotFound(SqueakHash),

    /// The squeak is stored but locked.
    #[error("no decryption key for squeak {0}")]
    MissingDecryptionKey(SqueakHash),

    /// The offer contradicts its own invoice.
    #[error("invalid offer: {0}")]
    InvalidOffer(String),

    /// The payment client is unreachable or misbehaving. Transient.
    #[error("payment client error: {0}")]
    Client(String),

    /// Cryptographic failure.
    #[error("crypto error: {0}")]
    Crypto(#[from] CoreError),

    /// Storage failure.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

impl PaymentError {
    /// Whether retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, PaymentError::Client(_) | PaymentError::PaymentFailed(_))
    }
}

/// Result type for payment operations.
pub type Result<T> = std::result::Result<T, PaymentError>;
