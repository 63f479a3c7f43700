//! # squeaknode testkit
//!
//! Testing utilities for squeaknode.
//!
//! ## Overview
//!
//! - **Fixtures**: authors that sign anchored squeaks, and a [`TestNetwork`]
//!   of running nodes sharing one chain and one Lightning network
//! - **Generators**: proptest strategies for keys, squeaks and interests
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use squeaknode_testkit::generators::{squeak_from_params, SqueakParams};
//!
//! proptest! {
//!     #[test]
//!     fn hash_is_stable(params: SqueakParams) {
//!         let squeak = squeak_from_params(&params);
//!         prop_assert_eq!(squeak.compute_hash(), squeak.locked().compute_hash());
//!     }
//! }
//! ```
//!
//! ## Test Networks
//!
//! ```rust,no_run
//! use squeaknode_testkit::TestNetwork;
//!
//! async fn example() -> anyhow::Result<()> {
//!     let network = TestNetwork::new(100);
//!     let seller = network.spawn_node("seller").await?;
//!     let buyer = network.spawn_node("buyer").await?;
//!     buyer.connect_to(&seller).await?;
//!     Ok(())
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{multi_party_fixtures, wait_until, RunningNode, SqueakFixture, TestNetwork, TestNode};
pub use generators::{squeak_from_params, SqueakParams};
