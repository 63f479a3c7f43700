//! Error types for squeaknode core.

use thiserror::Error;

/// Core errors that can occur while building, encoding or decrypting squeaks.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid peer address: {0}")]
    InvalidPeerAddress(String),

    #[error("content too long: {len} bytes (max {max})")]
    ContentTooLong { len: usize, max: usize },

    #[error("content is not valid UTF-8")]
    ContentNotUtf8,

    #[error("squeak is locked (no decryption key)")]
    Locked,

    #[error("encryption error: {0}")]
    EncryptionError(String),

    #[error("decryption error: {0}")]
    DecryptionError(String),

    #[error("malformed squeak: {0}")]
    MalformedSqueak(String),

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),
}

/// Validation errors for squeak structure, signatures and keys.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("signature verification failed")]
    SignatureFailed,

    #[error("content hash does not match header")]
    ContentHashMismatch,

    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),

    #[error("encrypted content exceeds {max} bytes: {len}")]
    ContentTooLong { len: usize, max: usize },

    #[error("decryption key does not match the squeak's encryption key")]
    DecryptionKeyMismatch,

    #[error("decryption key does not decrypt the content")]
    DecryptionFailed,
}

impl From<CoreError> for ValidationError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::InvalidSignature | CoreError::InvalidPublicKey => {
                ValidationError::SignatureFailed
            }
            CoreError::ContentTooLong { len, max } => ValidationError::ContentTooLong { len, max },
            _ => ValidationError::DecryptionFailed,
        }
    }
}
