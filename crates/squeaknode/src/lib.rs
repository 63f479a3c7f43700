//! # squeaknode
//!
//! A node of the squeak network: short signed posts whose content is
//! encrypted, anchored to a block of a blockchain, and unlocked by paying
//! the node that holds the key.
//!
//! ## Overview
//!
//! - **Ingestion**: every squeak, local or from a peer, passes one gate that
//!   checks its signature, its anchor block, the whitelist, the per-author
//!   rate limit and the storage cap.
//! - **Offers**: a buyer sends a challenge; the seller answers with an
//!   invoice whose payment point unlocks the key.
//! - **Payments**: settled invoices are recorded exactly once.
//! - **Sync**: peers exchange interests, inventories, squeaks and offers.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use squeaknode::oracle::memory::MemoryChain;
//! use squeaknode::payments::lightning::memory::MemoryLightningNetwork;
//! use squeaknode::store::SqliteStore;
//! use squeaknode::{NodeConfig, NodeRuntime, SqueakNode};
//!
//! async fn example() -> anyhow::Result<()> {
//!     let store = Arc::new(SqliteStore::open("squeaks.db")?);
//!     let network = MemoryLightningNetwork::new();
//!     let lightning = Arc::new(network.create_node("me").await);
//!     let chain = Arc::new(MemoryChain::with_height(100));
//!
//!     let node = SqueakNode::new(NodeConfig::default(), store, lightning, chain);
//!     let runtime = NodeRuntime::start(&node).await?;
//!
//!     let me = node.create_signing_profile("me").await?;
//!     node.make_squeak(me, "hello", None).await?;
//!
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `squeaknode::core` - squeaks, keys, offers and payments
//! - `squeaknode::store` - storage trait, SQLite and in-memory stores
//! - `squeaknode::payments` - offer negotiation and the payment ledger
//! - `squeaknode::sync` - peer protocol and sync

pub mod config;
pub mod error;
pub mod handler;
pub mod ingest;
pub mod node;
pub mod oracle;
pub mod tasks;

// Re-export component crates
pub use squeaknode_core as core;
pub use squeaknode_payments as payments;
pub use squeaknode_store as store;
pub use squeaknode_sync as sync;

// Re-export main types for convenience
pub use config::NodeConfig;
pub use error::{NodeError, Result};
pub use handler::NodeMessageHandler;
pub use ingest::{IngestOutcome, RejectReason};
pub use node::SqueakNode;
pub use oracle::{BlockInfo, BlockchainOracle};
pub use tasks::NodeRuntime;

// Re-export commonly used core types
pub use squeaknode_core::{
    Address, BlockHash, Interest, Keypair, PeerAddress, Profile, Squeak, SqueakBuilder, SqueakHash,
};
