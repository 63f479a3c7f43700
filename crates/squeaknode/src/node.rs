//! The node: one object behind both RPC surfaces.
//!
//! [`SqueakNode`] wires the store, the ingestion gate, the offer negotiator,
//! the payment ledger and the sync layer together. Peers reach it through
//! [`crate::handler::NodeMessageHandler`]; local callers use the methods
//! below directly.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};

use squeaknode_core::{
    now_millis, Address, Interest, Keypair, OfferPacket, Peer, PeerAddress, Profile,
    ReceivedOffer, ReceivedPayment, SealedBox, SentPayment, Squeak, SqueakBuilder, SqueakHash,
};
use squeaknode_payments::{OfferNegotiator, PaymentClient, PaymentLedger};
use squeaknode_store::{PeerFlag, ProfileFlag, Store, StoreError};
use squeaknode_sync::{
    ActiveDownloadManager, ConnectionManager, DownloadResult, PeerHandle, PeerInfo, SyncController,
};

use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use crate::handler::NodeMessageHandler;
use crate::ingest::{GatePolicy, IngestOutcome, IngestionGate};
use crate::oracle::BlockchainOracle;

/// A squeak node.
pub struct SqueakNode<S: Store, P: PaymentClient, O: BlockchainOracle> {
    config: NodeConfig,
    store: Arc<S>,
    oracle: Arc<O>,
    gate: IngestionGate<S, O>,
    negotiator: OfferNegotiator<S, P>,
    ledger: PaymentLedger<S, P>,
    sync: Arc<SyncController<S>>,
    best_height: watch::Sender<u64>,
}

impl<S, P, O> SqueakNode<S, P, O>
where
    S: Store + 'static,
    P: PaymentClient + 'static,
    O: BlockchainOracle + 'static,
{
    /// Create a node. Nothing runs until [`crate::tasks::NodeRuntime::start`].
    pub fn new(config: NodeConfig, store: Arc<S>, payments: Arc<P>, oracle: Arc<O>) -> Arc<Self> {
        let gate = IngestionGate::new(
            Arc::clone(&store),
            Arc::clone(&oracle),
            GatePolicy::from(&config.node),
        );
        let negotiator =
            OfferNegotiator::new(Arc::clone(&store), Arc::clone(&payments), config.offer_config());
        let ledger = PaymentLedger::new(Arc::clone(&store), payments, config.ledger_config());
        let sync = Arc::new(SyncController::new(
            Arc::clone(&store),
            ConnectionManager::new(config.connection_config()),
            Arc::new(ActiveDownloadManager::new()),
            config.sync_config(),
        ));
        let (best_height, _) = watch::channel(0);

        Arc::new(Self {
            config,
            store,
            oracle,
            gate,
            negotiator,
            ledger,
            sync,
            best_height,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn oracle(&self) -> &Arc<O> {
        &self.oracle
    }

    pub fn sync(&self) -> &Arc<SyncController<S>> {
        &self.sync
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        self.sync.connections()
    }

    pub fn negotiator(&self) -> &OfferNegotiator<S, P> {
        &self.negotiator
    }

    pub fn ledger(&self) -> &PaymentLedger<S, P> {
        &self.ledger
    }

    /// Last best height seen from the oracle.
    pub fn best_height(&self) -> u64 {
        *self.best_height.borrow()
    }

    pub fn watch_best_height(&self) -> watch::Receiver<u64> {
        self.best_height.subscribe()
    }

    /// Ask the oracle for the tip and publish it.
    pub async fn refresh_best_height(&self) -> Result<u64> {
        let height = self.oracle.best_block_height().await?;
        self.best_height.send_if_modified(|current| {
            let changed = *current != height;
            *current = height;
            changed
        });
        Ok(height)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Public RPC
    // ─────────────────────────────────────────────────────────────────────────

    /// Gate and store a squeak, then announce it to subscribed peers.
    pub async fn post_squeak(&self, squeak: &Squeak) -> Result<IngestOutcome> {
        let outcome = self.gate.ingest(squeak).await?;
        if outcome.is_accepted() {
            let announced = self.sync.announce_squeak(squeak);
            tracing::debug!(squeak_hash = %squeak.compute_hash(), announced, "announced squeak");
        }
        Ok(outcome)
    }

    /// A stored squeak, always without its decryption key.
    pub async fn get_squeak(&self, hash: &SqueakHash) -> Result<Option<Squeak>> {
        Ok(self.store.get_squeak(hash).await?.map(|s| s.locked()))
    }

    pub async fn lookup_squeaks(
        &self,
        addresses: Vec<Address>,
        min_block: Option<u64>,
        max_block: Option<u64>,
        reply_to: Option<SqueakHash>,
    ) -> Result<Vec<SqueakHash>> {
        let interest = Interest {
            authors: addresses,
            min_block,
            max_block,
            reply_to,
        };
        Ok(self.store.lookup_squeaks(&interest).await?)
    }

    /// Answer a buy request. `None` when the squeak is unknown, locked
    /// here, or sharing is off.
    pub async fn buy_squeak(
        &self,
        hash: &SqueakHash,
        challenge: &SealedBox,
        counterparty: &PeerAddress,
    ) -> Result<Option<OfferPacket>> {
        if !self.config.node.sharing_enabled {
            return Ok(None);
        }
        Ok(self
            .negotiator
            .create_offer(hash, challenge, counterparty)
            .await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Profiles
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn create_signing_profile(&self, name: &str) -> Result<i64> {
        self.insert_profile(Profile::signing(name, Keypair::generate()))
            .await
    }

    /// A signing profile from a known seed.
    pub async fn import_signing_profile(&self, name: &str, seed: &[u8; 32]) -> Result<i64> {
        self.insert_profile(Profile::signing(name, Keypair::from_seed(seed)))
            .await
    }

    pub async fn create_contact_profile(&self, name: &str, address: Address) -> Result<i64> {
        self.insert_profile(Profile::contact(name, address)).await
    }

    async fn insert_profile(&self, profile: Profile) -> Result<i64> {
        if profile.name.trim().is_empty() {
            return Err(NodeError::Profile("profile name is empty".into()));
        }
        match self.store.insert_profile(&profile).await {
            Ok(id) => {
                tracing::info!(profile_id = id, name = %profile.name, address = %profile.address, "created profile");
                Ok(id)
            }
            Err(StoreError::Duplicate(what)) => Err(NodeError::Profile(format!("duplicate {}", what))),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_profile(&self, id: i64) -> Result<Option<Profile>> {
        Ok(self.store.get_profile(id).await?)
    }

    pub async fn get_profile_by_name(&self, name: &str) -> Result<Option<Profile>> {
        Ok(self.store.get_profile_by_name(name).await?)
    }

    pub async fn list_profiles(&self) -> Result<Vec<Profile>> {
        Ok(self.store.list_profiles().await?)
    }

    pub async fn delete_profile(&self, id: i64) -> Result<bool> {
        Ok(self.store.delete_profile(id).await?)
    }

    pub async fn set_profile_following(&self, id: i64, following: bool) -> Result<()> {
        self.set_profile_flag(id, ProfileFlag::Following, following)
            .await
    }

    pub async fn set_profile_sharing(&self, id: i64, sharing: bool) -> Result<()> {
        self.set_profile_flag(id, ProfileFlag::Sharing, sharing).await
    }

    pub async fn set_profile_whitelisted(&self, id: i64, whitelisted: bool) -> Result<()> {
        self.set_profile_flag(id, ProfileFlag::Whitelisted, whitelisted)
            .await
    }

    async fn set_profile_flag(&self, id: i64, flag: ProfileFlag, value: bool) -> Result<()> {
        if !self.store.set_profile_flag(id, flag, value).await? {
            return Err(NodeError::Profile(format!("no profile with id {}", id)));
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Peers
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn add_peer(&self, name: &str, address: PeerAddress) -> Result<i64> {
        match self.store.insert_peer(&Peer::new(name, address)).await {
            Ok(id) => Ok(id),
            Err(StoreError::Duplicate(what)) => {
                Err(NodeError::InvalidOperation(format!("duplicate {}", what)))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list_peers(&self) -> Result<Vec<Peer>> {
        Ok(self.store.list_peers().await?)
    }

    pub async fn delete_peer(&self, id: i64) -> Result<bool> {
        Ok(self.store.delete_peer(id).await?)
    }

    pub async fn set_peer_uploading(&self, id: i64, value: bool) -> Result<()> {
        self.set_peer_flag(id, PeerFlag::Uploading, value).await
    }

    pub async fn set_peer_downloading(&self, id: i64, value: bool) -> Result<()> {
        self.set_peer_flag(id, PeerFlag::Downloading, value).await
    }

    pub async fn set_peer_autoconnect(&self, id: i64, value: bool) -> Result<()> {
        self.set_peer_flag(id, PeerFlag::Autoconnect, value).await
    }

    async fn set_peer_flag(&self, id: i64, flag: PeerFlag, value: bool) -> Result<()> {
        if !self.store.set_peer_flag(id, flag, value).await? {
            return Err(NodeError::InvalidOperation(format!("no peer with id {}", id)));
        }
        Ok(())
    }

    /// Whether we serve squeaks and offers to `address`. Unknown peers are
    /// served.
    pub async fn is_uploading_to(&self, address: &PeerAddress) -> Result<bool> {
        Ok(self
            .store
            .get_peer_by_address(address)
            .await?
            .map_or(true, |peer| peer.uploading))
    }

    /// Dial a peer.
    pub async fn connect_peer(self: &Arc<Self>, address: &PeerAddress) -> Result<PeerHandle> {
        let handler = Arc::new(NodeMessageHandler::new(Arc::clone(self)));
        Ok(self.connections().connect(address, handler).await?)
    }

    pub fn disconnect_peer(&self, address: &PeerAddress) -> bool {
        self.connections().remove_peer(address).is_some()
    }

    pub fn connected_peers(&self) -> Vec<PeerInfo> {
        self.connections()
            .peers()
            .iter()
            .map(|peer| peer.info().clone())
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Authoring
    // ─────────────────────────────────────────────────────────────────────────

    /// Author a squeak as a signing profile, anchored at the oracle's tip.
    pub async fn make_squeak(
        &self,
        profile_id: i64,
        content: &str,
        reply_to: Option<SqueakHash>,
    ) -> Result<SqueakHash> {
        let profile = self
            .store
            .get_profile(profile_id)
            .await?
            .ok_or_else(|| NodeError::Profile(format!("no profile with id {}", profile_id)))?;
        let keypair = profile
            .keypair()
            .ok_or_else(|| NodeError::Profile(format!("{} cannot sign", profile.name)))?;

        let tip = self.oracle.best_block().await?;
        let mut builder = SqueakBuilder::new(tip.height, tip.hash)
            .block_time(tip.time)
            .created_at(now_millis())
            .content(content);
        if let Some(parent) = reply_to {
            builder = builder.reply_to(parent);
        }
        let squeak = builder.sign(keypair)?;
        let hash = squeak.compute_hash();

        match self.post_squeak(&squeak).await? {
            IngestOutcome::Accepted(_) | IngestOutcome::Duplicate => Ok(hash),
            IngestOutcome::Rejected(reason) => Err(NodeError::InvalidOperation(format!(
                "squeak rejected: {}",
                reason
            ))),
        }
    }

    /// Decrypted content of a stored squeak, if we hold its key.
    pub async fn get_squeak_content(&self, hash: &SqueakHash) -> Result<Option<String>> {
        match self.store.get_squeak(hash).await? {
            Some(squeak) if squeak.is_unlocked() => Ok(Some(squeak.decrypt_content()?)),
            _ => Ok(None),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Buying and payments
    // ─────────────────────────────────────────────────────────────────────────

    /// Fetch a squeak from peers, then gather offers for it.
    pub async fn download_squeak(&self, hash: SqueakHash) -> Result<DownloadResult> {
        Ok(self.sync.download_squeak(hash).await?)
    }

    /// Gather offers for a locally held, locked squeak.
    pub async fn download_offers(&self, hash: SqueakHash) -> Result<DownloadResult> {
        Ok(self.sync.download_offers(hash).await?)
    }

    /// Run one sync round now.
    pub async fn sync_now(&self) -> Result<usize> {
        let height = self.refresh_best_height().await?;
        Ok(self.sync.sync_once(height).await?)
    }

    pub async fn list_received_offers(&self, hash: Option<&SqueakHash>) -> Result<Vec<ReceivedOffer>> {
        Ok(self.store.list_received_offers(hash).await?)
    }

    /// Pay a received offer and unlock its squeak.
    pub async fn pay_offer(&self, offer_id: i64) -> Result<SentPayment> {
        Ok(self.negotiator.pay_offer(offer_id).await?)
    }

    pub async fn list_sent_payments(&self) -> Result<Vec<SentPayment>> {
        Ok(self.ledger.sent_payments().await?)
    }

    pub async fn list_received_payments(&self) -> Result<Vec<ReceivedPayment>> {
        Ok(self.ledger.received_payments().await?)
    }

    /// Sum of all received payments in msat.
    pub async fn total_received(&self) -> Result<u64> {
        Ok(self.ledger.total_received().await?)
    }

    /// Every newly recorded received payment.
    pub fn subscribe_payments(&self) -> broadcast::Receiver<ReceivedPayment> {
        self.ledger.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::memory::MemoryChain;
    use squeaknode_payments::lightning::memory::{MemoryLightningNetwork, MemoryLightningNode};
    use squeaknode_store::MemoryStore;

    type TestNode = SqueakNode<MemoryStore, MemoryLightningNode, MemoryChain>;

    async fn node(config: NodeConfig) -> Arc<TestNode> {
        let network = MemoryLightningNetwork::new();
        SqueakNode::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(network.create_node("node").await),
            Arc::new(MemoryChain::with_height(100)),
        )
    }

    #[tokio::test]
    async fn test_make_squeak_anchors_at_tip() {
        let node = node(NodeConfig::default()).await;
        let author = node.create_signing_profile("alice").await.unwrap();

        let hash = node.make_squeak(author, "hello", None).await.unwrap();
        let stored = node.get_squeak(&hash).await.unwrap().unwrap();
        assert_eq!(stored.block_height(), 100);
        assert!(!stored.is_unlocked());
        assert_eq!(node.get_squeak_content(&hash).await.unwrap().as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_contact_profile_cannot_author() {
        let node = node(NodeConfig::default()).await;
        let contact = node
            .create_contact_profile("bob", Keypair::generate().address())
            .await
            .unwrap();
        assert!(matches!(
            node.make_squeak(contact, "nope", None).await,
            Err(NodeError::Profile(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_profile_name() {
        let node = node(NodeConfig::default()).await;
        node.create_signing_profile("alice").await.unwrap();
        assert!(matches!(
            node.create_signing_profile("alice").await,
            Err(NodeError::Profile(_))
        ));
        assert!(matches!(
            node.set_profile_following(999, true).await,
            Err(NodeError::Profile(_))
        ));
    }

    #[tokio::test]
    async fn test_lookup_by_author_and_reply() {
        let node = node(NodeConfig::default()).await;
        let alice = node.create_signing_profile("alice").await.unwrap();
        let address = node.get_profile(alice).await.unwrap().unwrap().address;

        let root = node.make_squeak(alice, "root", None).await.unwrap();
        let reply = node.make_squeak(alice, "reply", Some(root)).await.unwrap();

        let all = node
            .lookup_squeaks(vec![address], None, None, None)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        let replies = node
            .lookup_squeaks(vec![address], None, None, Some(root))
            .await
            .unwrap();
        assert_eq!(replies, vec![reply]);
        assert!(node
            .lookup_squeaks(vec![address], Some(101), None, None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_rate_limit_through_authoring() {
        let mut config = NodeConfig::default();
        config.node.max_squeaks_per_author_per_block = 2;
        let node = node(config).await;
        let alice = node.create_signing_profile("alice").await.unwrap();

        node.make_squeak(alice, "one", None).await.unwrap();
        node.make_squeak(alice, "two", None).await.unwrap();
        let third = node.make_squeak(alice, "three", None).await;
        assert!(matches!(third, Err(NodeError::InvalidOperation(_))));

        // The limit is per height: a fresh block admits more.
        node.oracle.mine().await;
        assert!(node.make_squeak(alice, "three", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_buy_squeak_respects_sharing() {
        let mut config = NodeConfig::default();
        config.node.sharing_enabled = false;
        let node = node(config).await;
        let alice = node.create_signing_profile("alice").await.unwrap();
        let hash = node.make_squeak(alice, "private", None).await.unwrap();
        let squeak = node.get_squeak(&hash).await.unwrap().unwrap();

        let (challenge, _) = node.negotiator().create_challenge(&squeak).unwrap();
        let offer = node
            .buy_squeak(&hash, &challenge, &PeerAddress::new("buyer", 1))
            .await
            .unwrap();
        assert!(offer.is_none());
    }

    #[tokio::test]
    async fn test_peer_flags() {
        let node = node(NodeConfig::default()).await;
        let address = PeerAddress::new("10.0.0.2", 8555);
        assert!(node.is_uploading_to(&address).await.unwrap());

        let id = node.add_peer("friend", address.clone()).await.unwrap();
        node.set_peer_uploading(id, false).await.unwrap();
        assert!(!node.is_uploading_to(&address).await.unwrap());
        assert!(matches!(
            node.add_peer("again", address).await,
            Err(NodeError::InvalidOperation(_))
        ));
        assert!(node.delete_peer(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_sqlite_backed_node_survives_reopen() {
        use squeaknode_store::SqliteStore;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.db");
        let network = MemoryLightningNetwork::new();
        let chain = Arc::new(MemoryChain::with_height(100));

        let hash = {
            let node = SqueakNode::new(
                NodeConfig::default(),
                Arc::new(SqliteStore::open(&path).unwrap()),
                Arc::new(network.create_node("first").await),
                Arc::clone(&chain),
            );
            let alice = node.create_signing_profile("alice").await.unwrap();
            node.make_squeak(alice, "persisted", None).await.unwrap()
        };

        let node = SqueakNode::new(
            NodeConfig::default(),
            Arc::new(SqliteStore::open(&path).unwrap()),
            Arc::new(network.create_node("second").await),
            chain,
        );
        assert_eq!(
            node.get_squeak_content(&hash).await.unwrap().as_deref(),
            Some("persisted")
        );
        assert!(node.get_profile_by_name("alice").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_refresh_best_height_publishes() {
        let node = node(NodeConfig::default()).await;
        let rx = node.watch_best_height();
        assert_eq!(node.refresh_best_height().await.unwrap(), 100);
        assert_eq!(*rx.borrow(), 100);
        assert_eq!(node.best_height(), 100);
    }
}
