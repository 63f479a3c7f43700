//! # Squeaknode Store
//!
//! Storage abstraction for squeaknode. Provides a trait-based interface for
//! squeaks, profiles, peers, offers and payments with SQLite and in-memory
//! implementations.
//!
//! ## Key Types
//!
//! - [`Store`] - The async trait for all storage operations
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage for tests
//! - [`InsertResult`] - Result of an idempotent insert
//!
//! ## Usage
//!
//! ```rust,no_run
//! use squeaknode_store::{SqliteStore, Store};
//! use squeaknode_core::Interest;
//!
//! async fn example() {
//!     let store = SqliteStore::open("squeaknode.db").unwrap();
//!     let hashes = store.lookup_squeaks(&Interest::any()).await.unwrap();
//!     println!("{} squeaks", hashes.len());
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Idempotent inserts**: Inserting an existing squeak, offer or payment
//!   returns `AlreadyExists`
//! - **Locked storage**: Squeaks are stored in locked form with the
//!   decryption key in a separate column

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{InsertResult, PeerFlag, ProfileFlag, Store, StoreExt};
