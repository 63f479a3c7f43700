//! # Squeaknode Sync
//!
//! Peer connections and interest-driven sync.
//!
//! ## Overview
//!
//! Every connection starts with a version handshake and then carries
//! length-prefixed CBOR [`Message`]s. A single [`ConnectionManager`] holds
//! the live peers. The [`SyncController`] asks downloading peers for the
//! hashes they hold under our interests, fetches what we lack and asks for
//! offers on what we hold locked. The [`ActiveDownloadManager`] correlates
//! those requests with deliveries from any connection.
//!
//! ## Message Flow
//!
//! ```text
//! Node A                              Node B
//!   |-------- Version ---------------->|
//!   |<------- Version -----------------|
//!   |<------- Verack ------------------|
//!   |-------- Verack ----------------->|
//!   |-------- Subscribe -------------->|
//!   |-------- GetSqueaks ------------->|
//!   |<------- Inv ---------------------|
//!   |-------- GetData ---------------->|
//!   |<------- Squeak ------------------|
//!   |-------- GetOffer --------------->|
//!   |<------- Offer -------------------|
//! ```
//!
//! Squeaks always travel locked. A decryption key only moves inside an
//! offer, encrypted under a key the buyer learns by paying.

pub mod connection;
pub mod controller;
pub mod download;
pub mod error;
pub mod manager;
pub mod messages;
pub mod wire;

pub use connection::{PeerHandle, PeerInfo, PeerMessageHandler};
pub use controller::{SyncConfig, SyncController};
pub use download::{ActiveDownloadManager, DownloadResult, DownloadTarget};
pub use error::{Result, SyncError};
pub use manager::{ConnectionConfig, ConnectionManager, PeerEvent, PeerSubscription};
pub use messages::{Message, VersionInfo, PROTOCOL_VERSION};
