//! Error types for the sync module.

use squeaknode_core::PeerAddress;
use thiserror::Error;

/// Errors that can occur on peer connections and during sync.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Protocol version mismatch with peer.
    #[error("protocol version mismatch: local={local}, peer={peer}")]
    VersionMismatch { local: u32, peer: u32 },

    /// The handshake did not finish in time.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The peer broke the handshake sequence.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// A live connection to this address already exists.
    #[error("already connected to {0}")]
    AlreadyConnected(PeerAddress),

    /// The peer's nonce is ours or another live peer's.
    #[error("duplicate connection nonce {0}")]
    DuplicateNonce(u64),

    /// The peer table is full.
    #[error("too many peers (max {0})")]
    TooManyPeers(usize),

    /// Peer is not connected.
    #[error("peer not connected: {0}")]
    PeerNotConnected(PeerAddress),

    /// Frame length exceeds the limit.
    #[error("frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },

    /// Message validation failed.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// Socket I/O failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Store operation failed.
    #[error("store error: {0}")]
    StoreError(#[from] squeaknode_store::StoreError),

    /// Challenge creation failed.
    #[error("crypto error: {0}")]
    Crypto(#[from] squeaknode_core::CoreError),

    /// Timeout waiting for peer.
    #[error("timeout: {0}")]
    Timeout(String),
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
