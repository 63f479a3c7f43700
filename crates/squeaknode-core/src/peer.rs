//! Peer addresses and saved peers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// A network address of another node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for PeerAddress {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| CoreError::InvalidPeerAddress(s.to_string()))?;
        let port = port
            .parse()
            .map_err(|_| CoreError::InvalidPeerAddress(s.to_string()))?;
        if host.is_empty() {
            return Err(CoreError::InvalidPeerAddress(s.to_string()));
        }
        Ok(Self::new(host, port))
    }
}

/// A peer saved in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Store-assigned id (0 until inserted).
    pub id: i64,
    pub name: String,
    pub address: PeerAddress,
    /// Serve squeaks and offers to this peer.
    pub uploading: bool,
    /// Sync from this peer.
    pub downloading: bool,
    /// Dial this peer on startup.
    pub autoconnect: bool,
}

impl Peer {
    pub fn new(name: impl Into<String>, address: PeerAddress) -> Self {
        Self {
            id: 0,
            name: name.into(),
            address,
            uploading: true,
            downloading: true,
            autoconnect: false,
        }
    }
}
