//! Peer protocol message types.
//!
//! Every frame on a peer connection carries exactly one [`Message`].

use serde::{Deserialize, Serialize};

use squeaknode_core::{Interest, OfferPacket, PeerAddress, SealedBox, Squeak, SqueakHash};

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Message size limits.
pub mod limits {
    /// Max interests in GetSqueaks / Subscribe.
    pub const MAX_INTERESTS: usize = 100;
    /// Max authors listed by one interest. Keeps a lookup well under
    /// SQLite's bound-parameter limit.
    pub const MAX_AUTHORS_PER_INTEREST: usize = 500;
    /// Max hashes in Inv / GetData / NotFound.
    pub const MAX_HASHES: usize = 1000;
    /// Max length of a user agent string.
    pub const MAX_USER_AGENT: usize = 256;
}

/// Sent first by both sides of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub protocol_version: u32,
    /// Random per-process value; detects self-connections and duplicate links.
    pub nonce: u64,
    pub user_agent: String,
    /// Where the sender accepts connections, if anywhere.
    pub listen_address: Option<PeerAddress>,
}

/// Peer protocol messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Handshake: introduce yourself.
    Version(VersionInfo),

    /// Handshake: the peer's version was accepted.
    Verack,

    /// Liveness probe.
    Ping { nonce: u64 },

    /// Reply to a ping with the same nonce.
    Pong { nonce: u64 },

    /// Ask for the hashes of squeaks matching any of these interests.
    GetSqueaks { interests: Vec<Interest> },

    /// Hashes the sender holds.
    Inv { hashes: Vec<SqueakHash> },

    /// Ask for these squeaks.
    GetData { hashes: Vec<SqueakHash> },

    /// One squeak, always in locked form.
    Squeak(Box<Squeak>),

    /// The sender does not have these squeaks (or will not sell them).
    NotFound { hashes: Vec<SqueakHash> },

    /// Ask for an offer on a squeak's decryption key.
    GetOffer {
        hash: SqueakHash,
        /// A proof sealed to the squeak's encryption key.
        challenge: SealedBox,
    },

    /// An offer answering a GetOffer.
    Offer(Box<OfferPacket>),

    /// Push new squeaks matching these interests to the sender.
    Subscribe { interests: Vec<Interest> },
}

impl Message {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::Ping { .. } => "ping",
            Message::Pong { .. } => "pong",
            Message::GetSqueaks { .. } => "getsqueaks",
            Message::Inv { .. } => "inv",
            Message::GetData { .. } => "getdata",
            Message::Squeak(_) => "squeak",
            Message::NotFound { .. } => "notfound",
            Message::GetOffer { .. } => "getoffer",
            Message::Offer(_) => "offer",
            Message::Subscribe { .. } => "subscribe",
        }
    }

    /// Check if this message respects size limits.
    pub fn validate_limits(&self) -> Result<(), &'static str> {
        match self {
            Message::Version(info) => {
                if info.user_agent.len() > limits::MAX_USER_AGENT {
                    return Err("user agent too long");
                }
            }
            Message::GetSqueaks { interests } | Message::Subscribe { interests } => {
                if interests.len() > limits::MAX_INTERESTS {
                    return Err("too many interests");
                }
                if interests
                    .iter()
                    .any(|i| i.authors.len() > limits::MAX_AUTHORS_PER_INTEREST)
                {
                    return Err("too many authors in interest");
                }
            }
            Message::Inv { hashes } | Message::GetData { hashes } | Message::NotFound { hashes } => {
                if hashes.len() > limits::MAX_HASHES {
                    return Err("too many hashes");
                }
            }
            Message::Squeak(squeak) => {
                if squeak.is_unlocked() {
                    return Err("squeak carries a decryption key");
                }
            }
            Message::Verack
            | Message::Ping { .. }
            | Message::Pong { .. }
            | Message::GetOffer { .. }
            | Message::Offer(_) => {}
        }
        Ok(())
    }
}
