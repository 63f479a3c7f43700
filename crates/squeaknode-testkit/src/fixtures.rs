//! Test fixtures and helpers.
//!
//! Common setup code for integration tests.

use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Result};

use squeaknode::oracle::memory::{synthetic_hash, MemoryChain};
use squeaknode::{NodeConfig, NodeRuntime, SqueakNode};
use squeaknode_core::{Address, Keypair, PeerAddress, Squeak, SqueakBuilder, SqueakHash};
use squeaknode_payments::lightning::memory::{MemoryLightningNetwork, MemoryLightningNode};
use squeaknode_store::MemoryStore;

/// A node over in-memory components.
pub type TestNode = SqueakNode<MemoryStore, MemoryLightningNode, MemoryChain>;

/// Block time of synthetic blocks, matching [`MemoryChain`].
fn block_time(height: u64) -> i64 {
    1_600_000_000 + height as i64 * 600
}

/// An author that signs squeaks anchored to a [`MemoryChain`].
pub struct SqueakFixture {
    pub keypair: Keypair,
}

impl SqueakFixture {
    pub fn new() -> Self {
        Self {
            keypair: Keypair::generate(),
        }
    }

    pub fn with_seed(seed: [u8; 32]) -> Self {
        Self {
            keypair: Keypair::from_seed(&seed),
        }
    }

    pub fn address(&self) -> Address {
        self.keypair.address()
    }

    /// An unlocked squeak anchored at `height` on the main fork.
    pub fn make_squeak(&self, height: u64, text: &str) -> Squeak {
        self.builder(height, text)
            .sign(&self.keypair)
            .expect("fixture content fits")
    }

    pub fn make_reply(&self, height: u64, text: &str, parent: SqueakHash) -> Squeak {
        self.builder(height, text)
            .reply_to(parent)
            .sign(&self.keypair)
            .expect("fixture content fits")
    }

    fn builder(&self, height: u64, text: &str) -> SqueakBuilder {
        SqueakBuilder::new(height, synthetic_hash(height, 0))
            .block_time(block_time(height))
            .created_at(block_time(height) * 1000)
            .content(text)
    }
}

impl Default for SqueakFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Create multiple fixtures with distinct deterministic keys.
pub fn multi_party_fixtures(count: usize) -> Vec<SqueakFixture> {
    (0..count)
        .map(|i| {
            let mut seed = [0u8; 32];
            seed[..8].copy_from_slice(&(i as u64).to_le_bytes());
            SqueakFixture::with_seed(seed)
        })
        .collect()
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Nodes sharing one chain and one Lightning network.
pub struct TestNetwork {
    pub chain: Arc<MemoryChain>,
    pub lightning: Arc<MemoryLightningNetwork>,
}

impl TestNetwork {
    /// A network whose chain tip is at `tip`.
    pub fn new(tip: u64) -> Self {
        Self {
            chain: Arc::new(MemoryChain::with_height(tip)),
            lightning: MemoryLightningNetwork::new(),
        }
    }

    /// Loopback on an ephemeral port, with short sync timings.
    pub fn local_config() -> NodeConfig {
        let mut config = NodeConfig::default();
        config.sync.listen_host = "127.0.0.1".into();
        config.sync.listen_port = 0;
        config.sync.sync_interval_secs = 1;
        config.sync.download_timeout_secs = 5;
        config.payments.settlement_retry_secs = 1;
        config
    }

    pub async fn spawn_node(&self, name: &str) -> Result<RunningNode> {
        self.spawn_node_with(name, Self::local_config()).await
    }

    pub async fn spawn_node_with(&self, name: &str, config: NodeConfig) -> Result<RunningNode> {
        let node = SqueakNode::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(self.lightning.create_node(name).await),
            Arc::clone(&self.chain),
        );
        let runtime = NodeRuntime::start(&node).await?;
        Ok(RunningNode { node, runtime })
    }
}

/// A node with its background tasks running.
pub struct RunningNode {
    pub node: Arc<TestNode>,
    runtime: NodeRuntime,
}

impl RunningNode {
    /// Where other nodes can dial this one.
    pub fn peer_address(&self) -> PeerAddress {
        PeerAddress::new("127.0.0.1", self.runtime.local_addr().port())
    }

    /// Dial `other` and wait until both sides list the connection.
    pub async fn connect_to(&self, other: &RunningNode) -> Result<()> {
        let before = other.connected_peers().len();
        self.node.connect_peer(&other.peer_address()).await?;
        let accepted = wait_until(Duration::from_secs(5), || async move {
            other.connected_peers().len() > before
        })
        .await;
        ensure!(accepted, "{} never registered the connection", other.peer_address());
        Ok(())
    }

    pub async fn shutdown(self) {
        self.runtime.shutdown().await;
    }
}

impl Deref for RunningNode {
    type Target = TestNode;

    fn deref(&self) -> &TestNode {
        &self.node
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use squeaknode_core::validate_squeak;

    #[test]
    fn test_fixture_squeaks_are_valid() {
        let fixture = SqueakFixture::new();
        let root = fixture.make_squeak(100, "root");
        let reply = fixture.make_reply(100, "reply", root.compute_hash());

        assert!(validate_squeak(&root).is_ok());
        assert!(validate_squeak(&reply.locked()).is_ok());
        assert_eq!(reply.reply_to(), Some(&root.compute_hash()));
        assert_eq!(root.address(), fixture.address());
    }

    #[test]
    fn test_multi_party() {
        let parties = multi_party_fixtures(3);
        let addresses: Vec<_> = parties.iter().map(|p| p.address()).collect();
        assert_ne!(addresses[0], addresses[1]);
        assert_ne!(addresses[1], addresses[2]);
        assert_ne!(addresses[0], addresses[2]);
    }

    #[tokio::test]
    async fn test_network_nodes_connect() {
        let network = TestNetwork::new(100);
        let a = network.spawn_node("a").await.unwrap();
        let b = network.spawn_node("b").await.unwrap();

        b.connect_to(&a).await.unwrap();
        assert_eq!(b.connected_peers().len(), 1);

        b.shutdown().await;
        a.shutdown().await;
    }

    #[tokio::test]
    async fn test_wait_until_times_out() {
        assert!(!wait_until(Duration::from_millis(50), || async { false }).await);
        assert!(wait_until(Duration::from_millis(50), || async { true }).await);
    }
}
