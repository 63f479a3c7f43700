//! Interest-driven sync with connected peers.
//!
//! The controller asks downloading peers for the hashes they hold under our
//! interests, fetches what we lack, and asks for offers on what we hold
//! locked. Replies come back through the node's message handler, which calls
//! [`SyncController::handle_inventory`] for `Inv` and feeds squeaks and
//! offers to the [`ActiveDownloadManager`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::watch;

use squeaknode_core::{Interest, PeerAddress, Proof, Squeak, SqueakHash};
use squeaknode_payments::crypto::create_challenge;
use squeaknode_store::Store;

use crate::connection::PeerHandle;
use crate::download::{ActiveDownloadManager, DownloadResult, DownloadTarget};
use crate::error::Result;
use crate::manager::{ConnectionManager, PeerEvent};
use crate::messages::{limits, Message};

/// Sync settings.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How many blocks below the best height our interests reach.
    pub block_range: u64,
    /// Bound on every download wait, and lifetime of an unanswered offer
    /// request.
    pub download_timeout: Duration,
    pub sync_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            block_range: 2016,
            download_timeout: Duration::from_secs(10),
            sync_interval: Duration::from_secs(10),
        }
    }
}

struct OfferRequest {
    proof: Proof,
    sent_at: Instant,
}

/// Drives sync for one node.
pub struct SyncController<S: Store> {
    store: Arc<S>,
    connections: Arc<ConnectionManager>,
    downloads: Arc<ActiveDownloadManager>,
    config: SyncConfig,
    offer_requests: Mutex<HashMap<(SqueakHash, PeerAddress), OfferRequest>>,
    remote_interests: Mutex<HashMap<PeerAddress, Vec<Interest>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<S: Store + 'static> SyncController<S> {
    pub fn new(
        store: Arc<S>,
        connections: Arc<ConnectionManager>,
        downloads: Arc<ActiveDownloadManager>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            connections,
            downloads,
            config,
            offer_requests: Mutex::new(HashMap::new()),
            remote_interests: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn downloads(&self) -> &Arc<ActiveDownloadManager> {
        &self.downloads
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Interests and peers
    // ─────────────────────────────────────────────────────────────────────────

    /// One interest per followed author, reaching `block_range` blocks
    /// below `best_height`.
    pub async fn interests(&self, best_height: u64) -> Result<Vec<Interest>> {
        let min_block = best_height.saturating_sub(self.config.block_range);
        let followed = self.store.followed_addresses().await?;
        Ok(followed
            .chunks(limits::MAX_AUTHORS_PER_INTEREST)
            .map(|authors| Interest {
                authors: authors.to_vec(),
                min_block: Some(min_block),
                ..Interest::default()
            })
            .collect())
    }

    /// Live peers we sync from. Peers without a stored record count as
    /// downloading.
    pub async fn downloading_peers(&self) -> Result<Vec<PeerHandle>> {
        let mut downloading = Vec::new();
        for peer in self.connections.peers() {
            let allowed = self
                .store
                .get_peer_by_address(peer.address())
                .await?
                .map_or(true, |stored| stored.downloading);
            if allowed {
                downloading.push(peer);
            }
        }
        Ok(downloading)
    }

    /// Remember what a peer subscribed to.
    pub fn set_remote_interests(&self, peer: &PeerAddress, interests: Vec<Interest>) {
        lock(&self.remote_interests).insert(peer.clone(), interests);
    }

    /// Tell subscribed peers about a newly stored squeak. Returns how many
    /// were told.
    pub fn announce_squeak(&self, squeak: &Squeak) -> usize {
        let targets: Vec<PeerAddress> = lock(&self.remote_interests)
            .iter()
            .filter(|(_, interests)| interests.iter().any(|i| i.matches(squeak)))
            .map(|(address, _)| address.clone())
            .collect();

        let hash = squeak.compute_hash();
        targets
            .iter()
            .filter_map(|address| self.connections.get_peer(address))
            .filter(|peer| peer.try_send(Message::Inv { hashes: vec![hash] }).is_ok())
            .count()
    }

    fn forget_peer(&self, peer: &PeerAddress) {
        lock(&self.remote_interests).remove(peer);
        lock(&self.offer_requests).retain(|(_, address), _| address != peer);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sync rounds
    // ─────────────────────────────────────────────────────────────────────────

    /// Ask every downloading peer for hashes under our interests. Returns
    /// how many peers were asked.
    pub async fn sync_once(&self, best_height: u64) -> Result<usize> {
        self.expire_offer_requests();
        let interests = self.interests(best_height).await?;
        if interests.is_empty() {
            return Ok(0);
        }

        let mut asked = 0;
        for peer in self.downloading_peers().await? {
            match peer.try_send(Message::GetSqueaks {
                interests: interests.clone(),
            }) {
                Ok(()) => asked += 1,
                Err(e) => tracing::debug!(peer = %peer.address(), error = %e, "sync request not sent"),
            }
        }
        tracing::debug!(asked, interests = interests.len(), "sync round");
        Ok(asked)
    }

    /// Diff a peer's inventory against the store: fetch what is missing and
    /// ask for offers on what is held locked.
    pub async fn handle_inventory(&self, peer: &PeerHandle, hashes: Vec<SqueakHash>) -> Result<()> {
        let mut missing = Vec::new();
        for hash in hashes {
            match self.store.get_squeak(&hash).await? {
                None => missing.push(hash),
                Some(squeak) if !squeak.is_unlocked() => {
                    self.request_offer(peer, &squeak)?;
                }
                Some(_) => {}
            }
        }

        if !missing.is_empty() {
            tracing::debug!(peer = %peer.address(), count = missing.len(), "requesting squeaks");
            peer.send(Message::GetData { hashes: missing }).await?;
        }
        Ok(())
    }

    /// Send a challenge for `squeak` to `peer` unless one is outstanding.
    ///
    /// Returns whether a request was sent.
    pub fn request_offer(&self, peer: &PeerHandle, squeak: &Squeak) -> Result<bool> {
        let hash = squeak.compute_hash();
        let key = (hash, peer.address().clone());
        let challenge = {
            let mut requests = lock(&self.offer_requests);
            if requests
                .get(&key)
                .is_some_and(|r| r.sent_at.elapsed() < self.config.download_timeout)
            {
                return Ok(false);
            }
            let (challenge, proof) = create_challenge(&squeak.header.encryption_key)?;
            requests.insert(
                key.clone(),
                OfferRequest {
                    proof,
                    sent_at: Instant::now(),
                },
            );
            challenge
        };

        if let Err(e) = peer.try_send(Message::GetOffer { hash, challenge }) {
            lock(&self.offer_requests).remove(&key);
            return Err(e);
        }
        tracing::debug!(squeak_hash = %hash, peer = %peer.address(), "offer requested");
        Ok(true)
    }

    /// Claim the proof for an offer that just arrived. `None` if we never
    /// asked this peer, or asked too long ago.
    pub fn take_offer_proof(&self, hash: &SqueakHash, peer: &PeerAddress) -> Option<Proof> {
        let request = lock(&self.offer_requests).remove(&(*hash, peer.clone()))?;
        (request.sent_at.elapsed() < self.config.download_timeout).then_some(request.proof)
    }

    /// The peer will not answer this request.
    pub fn clear_offer_request(&self, hash: &SqueakHash, peer: &PeerAddress) {
        lock(&self.offer_requests).remove(&(*hash, peer.clone()));
    }

    fn expire_offer_requests(&self) {
        let timeout = self.config.download_timeout;
        lock(&self.offer_requests).retain(|_, r| r.sent_at.elapsed() < timeout);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // On-demand downloads
    // ─────────────────────────────────────────────────────────────────────────

    /// Fetch one squeak from downloading peers, then ask for offers on it.
    pub async fn download_squeak(&self, hash: SqueakHash) -> Result<DownloadResult> {
        let peers = &self.downloading_peers().await?;
        let result = self
            .downloads
            .download(DownloadTarget::Hash(hash), 1, self.config.download_timeout, move || async move {
                for peer in peers {
                    let _ = peer.try_send(Message::GetData { hashes: vec![hash] });
                }
            })
            .await;
        tracing::info!(squeak_hash = %hash, received = result.received, "squeak download finished");

        if result.is_complete() {
            self.download_offers(hash).await?;
        }
        Ok(result)
    }

    /// Ask every downloading peer for an offer on a locally held, locked
    /// squeak.
    pub async fn download_offers(&self, hash: SqueakHash) -> Result<DownloadResult> {
        let squeak = match self.store.get_squeak(&hash).await? {
            Some(squeak) if !squeak.is_unlocked() => squeak,
            _ => {
                return Ok(DownloadResult {
                    requested: 0,
                    received: 0,
                    elapsed: Duration::ZERO,
                })
            }
        };

        let peers = &self.downloading_peers().await?;
        let squeak = &squeak;
        let result = self
            .downloads
            .download(
                DownloadTarget::Offer(hash),
                peers.len(),
                self.config.download_timeout,
                move || async move {
                    for peer in peers {
                        if let Err(e) = self.request_offer(peer, squeak) {
                            tracing::debug!(peer = %peer.address(), error = %e, "offer request not sent");
                        }
                    }
                },
            )
            .await;
        tracing::info!(squeak_hash = %hash, offers = result.received, "offer download finished");
        Ok(result)
    }

    /// Fetch up to `expected` squeaks matching `interest`.
    pub async fn download_squeaks(&self, interest: Interest, expected: usize) -> Result<DownloadResult> {
        let peers = &self.downloading_peers().await?;
        let request = &Message::GetSqueaks {
            interests: vec![interest.clone()],
        };
        Ok(self
            .downloads
            .download(
                DownloadTarget::Interest(interest),
                expected,
                self.config.download_timeout,
                move || async move {
                    for peer in peers {
                        let _ = peer.try_send(request.clone());
                    }
                },
            )
            .await)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Background loop
    // ─────────────────────────────────────────────────────────────────────────

    /// Sync every `sync_interval` and greet new peers, until `shutdown`
    /// flips.
    pub async fn run(self: Arc<Self>, best_height: watch::Receiver<u64>, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.connections.subscribe();
        let mut ticker = tokio::time::interval(self.config.sync_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut advertised: Vec<Interest> = Vec::new();

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let height = *best_height.borrow();
                    if let Err(e) = self.readvertise(height, &mut advertised).await {
                        tracing::warn!(error = %e, "interest refresh failed");
                    }
                    if let Err(e) = self.sync_once(height).await {
                        tracing::warn!(error = %e, "sync round failed");
                    }
                }
                event = events.recv() => match event {
                    Some(PeerEvent::Connected(address)) => {
                        let height = *best_height.borrow();
                        if let Err(e) = self.greet(&address, height).await {
                            tracing::debug!(peer = %address, error = %e, "greeting failed");
                        }
                    }
                    Some(PeerEvent::Disconnected(address)) => self.forget_peer(&address),
                    None => break,
                },
            }
        }
        tracing::debug!("sync loop stopped");
    }

    async fn greet(&self, address: &PeerAddress, best_height: u64) -> Result<()> {
        let Some(peer) = self.connections.get_peer(address) else {
            return Ok(());
        };
        let downloading = self
            .store
            .get_peer_by_address(address)
            .await?
            .map_or(true, |stored| stored.downloading);
        if !downloading {
            return Ok(());
        }

        let interests = self.interests(best_height).await?;
        peer.try_send(Message::Subscribe {
            interests: interests.clone(),
        })?;
        if !interests.is_empty() {
            peer.try_send(Message::GetSqueaks { interests })?;
        }
        Ok(())
    }

    async fn readvertise(&self, best_height: u64, advertised: &mut Vec<Interest>) -> Result<()> {
        let authors = |interests: &[Interest]| -> Vec<_> {
            interests.iter().flat_map(|i| i.authors.clone()).collect()
        };
        let interests = self.interests(best_height).await?;
        if authors(&interests) == authors(advertised.as_slice()) {
            return Ok(());
        }
        for peer in self.downloading_peers().await? {
            let _ = peer.try_send(Message::Subscribe {
                interests: interests.clone(),
            });
        }
        *advertised = interests;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests_support::fake_handle;
    use crate::manager::ConnectionConfig;
    use squeaknode_core::{BlockHash, Keypair, Peer, Profile, SqueakBuilder};
    use squeaknode_store::{MemoryStore, PeerFlag, ProfileFlag};

    fn controller(store: Arc<MemoryStore>) -> SyncController<MemoryStore> {
        SyncController::new(
            store,
            ConnectionManager::new(ConnectionConfig::default()),
            Arc::new(ActiveDownloadManager::new()),
            SyncConfig {
                download_timeout: Duration::from_millis(200),
                ..SyncConfig::default()
            },
        )
    }

    fn squeak(keypair: &Keypair, text: &str) -> Squeak {
        SqueakBuilder::new(3000, BlockHash::from_bytes([9; 32]))
            .content(text)
            .sign(keypair)
            .unwrap()
    }

    async fn follow(store: &MemoryStore, keypair: &Keypair) {
        let id = store
            .insert_profile(&Profile::contact("friend", keypair.address()))
            .await
            .unwrap();
        store
            .set_profile_flag(id, ProfileFlag::Following, true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_interests_follow_profiles() {
        let store = Arc::new(MemoryStore::new());
        let friend = Keypair::generate();
        follow(&store, &friend).await;

        let sync = controller(store);
        let interests = sync.interests(3000).await.unwrap();
        assert_eq!(
            interests,
            vec![Interest::author(friend.address()).with_min_block(984)]
        );
        assert_eq!(sync.interests(10).await.unwrap()[0].min_block, Some(0));
    }

    #[tokio::test]
    async fn test_interests_split_large_follow_lists() {
        let store = Arc::new(MemoryStore::new());
        let count = limits::MAX_AUTHORS_PER_INTEREST + 1;
        for i in 0..count {
            let id = store
                .insert_profile(&Profile::contact(format!("friend-{}", i), Keypair::generate().address()))
                .await
                .unwrap();
            store
                .set_profile_flag(id, ProfileFlag::Following, true)
                .await
                .unwrap();
        }

        let interests = controller(store).interests(3000).await.unwrap();
        assert_eq!(interests.len(), 2);
        assert_eq!(interests.iter().map(|i| i.authors.len()).sum::<usize>(), count);
        assert!(Message::GetSqueaks { interests }.validate_limits().is_ok());
    }

    #[tokio::test]
    async fn test_sync_once_skips_non_downloading_peers() {
        let store = Arc::new(MemoryStore::new());
        follow(&store, &Keypair::generate()).await;
        let muted = store
            .insert_peer(&Peer::new("muted", PeerAddress::new("b", 1)))
            .await
            .unwrap();
        store
            .set_peer_flag(muted, PeerFlag::Downloading, false)
            .await
            .unwrap();

        let sync = controller(store);
        let (a, mut rx_a) = fake_handle("a", 1, 1);
        let (b, mut rx_b) = fake_handle("b", 1, 2);
        sync.connections().add_peer(a).unwrap();
        sync.connections().add_peer(b).unwrap();

        assert_eq!(sync.sync_once(3000).await.unwrap(), 1);
        assert!(matches!(rx_a.try_recv(), Ok(Message::GetSqueaks { .. })));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sync_once_without_interests_is_idle() {
        let sync = controller(Arc::new(MemoryStore::new()));
        let (a, mut rx) = fake_handle("a", 1, 1);
        sync.connections().add_peer(a).unwrap();
        assert_eq!(sync.sync_once(3000).await.unwrap(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_inventory_fetches_missing_and_requests_offers() {
        let store = Arc::new(MemoryStore::new());
        let author = Keypair::generate();
        let locked = squeak(&author, "locked").locked();
        let unlocked = squeak(&author, "unlocked");
        let missing = squeak(&author, "missing").compute_hash();
        store.insert_squeak(&locked).await.unwrap();
        store.insert_squeak(&unlocked).await.unwrap();

        let sync = controller(store);
        let (peer, mut rx) = fake_handle("a", 1, 1);
        let inventory = vec![missing, locked.compute_hash(), unlocked.compute_hash()];
        sync.handle_inventory(&peer, inventory.clone()).await.unwrap();

        match rx.try_recv().unwrap() {
            Message::GetOffer { hash, .. } => assert_eq!(hash, locked.compute_hash()),
            other => panic!("unexpected {:?}", other),
        }
        match rx.try_recv().unwrap() {
            Message::GetData { hashes } => assert_eq!(hashes, vec![missing]),
            other => panic!("unexpected {:?}", other),
        }

        // One outstanding offer request per (squeak, peer).
        sync.handle_inventory(&peer, vec![locked.compute_hash()]).await.unwrap();
        assert!(rx.try_recv().is_err());

        assert!(sync.take_offer_proof(&locked.compute_hash(), peer.address()).is_some());
        assert!(sync.take_offer_proof(&locked.compute_hash(), peer.address()).is_none());
    }

    #[tokio::test]
    async fn test_offer_request_proof_matches_challenge() {
        let store = Arc::new(MemoryStore::new());
        let full = squeak(&Keypair::generate(), "paid");
        let sync = controller(store);
        let (peer, mut rx) = fake_handle("a", 1, 1);

        assert!(sync.request_offer(&peer, &full.locked()).unwrap());
        let challenge = match rx.try_recv().unwrap() {
            Message::GetOffer { challenge, .. } => challenge,
            other => panic!("unexpected {:?}", other),
        };
        let key = full.decryption_key.clone().unwrap();
        let answered = squeaknode_payments::crypto::solve_challenge(&challenge, &key).unwrap();
        assert_eq!(
            sync.take_offer_proof(&full.compute_hash(), peer.address()),
            Some(answered)
        );
    }

    #[tokio::test]
    async fn test_download_squeak_completes_on_delivery() {
        let store = Arc::new(MemoryStore::new());
        let target = squeak(&Keypair::generate(), "wanted").locked();
        let hash = target.compute_hash();
        let sync = Arc::new(controller(Arc::clone(&store)));
        let (peer, mut rx) = fake_handle("a", 1, 1);
        sync.connections().add_peer(peer).unwrap();

        let downloading = Arc::clone(&sync);
        let task = tokio::spawn(async move { downloading.download_squeak(hash).await });

        match rx.recv().await.unwrap() {
            Message::GetData { hashes } => assert_eq!(hashes, vec![hash]),
            other => panic!("unexpected {:?}", other),
        }
        store.insert_squeak(&target).await.unwrap();
        assert_eq!(sync.downloads().process_squeak(&target), 1);

        let result = task.await.unwrap().unwrap();
        assert_eq!(result.received, 1);
        // The locked squeak then gets an offer request.
        assert!(matches!(rx.recv().await, Some(Message::GetOffer { .. })));
    }

    #[tokio::test]
    async fn test_download_offers_for_unknown_squeak_is_empty() {
        let sync = controller(Arc::new(MemoryStore::new()));
        let result = sync.download_offers(SqueakHash::ZERO).await.unwrap();
        assert_eq!(result.requested, 0);
    }

    #[tokio::test]
    async fn test_announce_reaches_matching_subscribers() {
        let sync = controller(Arc::new(MemoryStore::new()));
        let author = Keypair::generate();
        let (a, mut rx_a) = fake_handle("a", 1, 1);
        let (b, mut rx_b) = fake_handle("b", 1, 2);
        sync.connections().add_peer(a).unwrap();
        sync.connections().add_peer(b).unwrap();
        sync.set_remote_interests(&PeerAddress::new("a", 1), vec![Interest::author(author.address())]);
        sync.set_remote_interests(&PeerAddress::new("b", 1), vec![Interest::any().with_min_block(5000)]);

        let posted = squeak(&author, "news").locked();
        assert_eq!(sync.announce_squeak(&posted), 1);
        assert!(matches!(rx_a.try_recv(), Ok(Message::Inv { .. })));
        assert!(rx_b.try_recv().is_err());

        sync.forget_peer(&PeerAddress::new("a", 1));
        assert_eq!(sync.announce_squeak(&posted), 0);
    }
}
