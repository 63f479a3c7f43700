//! The live-peer registry.
//!
//! One [`ConnectionManager`] per node, shared by `Arc` with every connection
//! task. The peer table sits behind a single lock that is never held across
//! an `.await`; change notifications go out after the lock is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use squeaknode_core::PeerAddress;

use crate::connection::{establish, PeerHandle, PeerMessageHandler};
use crate::error::{Result, SyncError};
use crate::messages::{Message, VersionInfo, PROTOCOL_VERSION};

/// Connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub handshake_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_peers: usize,
    /// Per-peer outbound queue length.
    pub send_queue_size: usize,
    /// Per-subscriber notification queue length.
    pub subscriber_capacity: usize,
    pub user_agent: String,
    /// Advertised in our version message.
    pub listen_address: Option<PeerAddress>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_peers: 10,
            send_queue_size: 256,
            subscriber_capacity: 16,
            user_agent: concat!("squeaknode/", env!("CARGO_PKG_VERSION")).to_string(),
            listen_address: None,
        }
    }
}

/// A change in the peer set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Connected(PeerAddress),
    Disconnected(PeerAddress),
}

/// Registry of live peers.
pub struct ConnectionManager {
    nonce: u64,
    config: ConnectionConfig,
    peers: Mutex<HashMap<PeerAddress, PeerHandle>>,
    subscribers: Mutex<Vec<(u64, mpsc::Sender<PeerEvent>)>>,
    next_subscriber: AtomicU64,
}

/// Receives peer events until dropped.
pub struct PeerSubscription {
    id: u64,
    rx: mpsc::Receiver<PeerEvent>,
    manager: Weak<ConnectionManager>,
}

impl PeerSubscription {
    pub async fn recv(&mut self) -> Option<PeerEvent> {
        self.rx.recv().await
    }
}

impl Drop for PeerSubscription {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.unsubscribe(self.id);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig) -> Arc<Self> {
        Arc::new(Self {
            nonce: rand::thread_rng().gen(),
            config,
            peers: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            next_subscriber: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Our connection nonce.
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn local_version(&self) -> VersionInfo {
        VersionInfo {
            protocol_version: PROTOCOL_VERSION,
            nonce: self.nonce,
            user_agent: self.config.user_agent.clone(),
            listen_address: self.config.listen_address.clone(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Registry
    // ─────────────────────────────────────────────────────────────────────────

    /// Register a peer that finished its handshake.
    pub fn add_peer(&self, handle: PeerHandle) -> Result<()> {
        let address = handle.address().clone();
        {
            let mut peers = lock(&self.peers);
            if handle.nonce() == self.nonce || peers.values().any(|p| p.nonce() == handle.nonce()) {
                return Err(SyncError::DuplicateNonce(handle.nonce()));
            }
            if peers.contains_key(&address) {
                return Err(SyncError::AlreadyConnected(address));
            }
            if peers.len() >= self.config.max_peers {
                return Err(SyncError::TooManyPeers(self.config.max_peers));
            }
            peers.insert(address.clone(), handle);
        }
        self.notify(PeerEvent::Connected(address));
        Ok(())
    }

    /// Remove and close a peer.
    pub fn remove_peer(&self, address: &PeerAddress) -> Option<PeerHandle> {
        let removed = lock(&self.peers).remove(address);
        if let Some(handle) = &removed {
            handle.close();
            self.notify(PeerEvent::Disconnected(address.clone()));
        }
        removed
    }

    /// Remove `handle` if it is still the registered connection for its
    /// address.
    pub(crate) fn unregister(&self, handle: &PeerHandle) {
        let removed = {
            let mut peers = lock(&self.peers);
            match peers.get(handle.address()) {
                Some(current) if current.nonce() == handle.nonce() => {
                    peers.remove(handle.address())
                }
                _ => None,
            }
        };
        if removed.is_some() {
            self.notify(PeerEvent::Disconnected(handle.address().clone()));
        }
    }

    pub fn get_peer(&self, address: &PeerAddress) -> Option<PeerHandle> {
        lock(&self.peers).get(address).cloned()
    }

    pub fn is_connected(&self, address: &PeerAddress) -> bool {
        lock(&self.peers).contains_key(address)
    }

    /// All live peers, ordered by address.
    pub fn peers(&self) -> Vec<PeerHandle> {
        let mut peers: Vec<_> = lock(&self.peers).values().cloned().collect();
        peers.sort_by(|a, b| a.address().cmp(b.address()));
        peers
    }

    /// Queue `message` to every live peer. Returns how many accepted it.
    pub fn broadcast(&self, message: &Message) -> usize {
        self.peers()
            .iter()
            .filter(|peer| match peer.try_send(message.clone()) {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!(peer = %peer.address(), error = %e, "broadcast skipped peer");
                    false
                }
            })
            .count()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Notifications
    // ─────────────────────────────────────────────────────────────────────────

    /// Subscribe to peer set changes.
    pub fn subscribe(self: &Arc<Self>) -> PeerSubscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.config.subscriber_capacity.max(1));
        lock(&self.subscribers).push((id, tx));
        PeerSubscription {
            id,
            rx,
            manager: Arc::downgrade(self),
        }
    }

    fn unsubscribe(&self, id: u64) {
        lock(&self.subscribers).retain(|(sub, _)| *sub != id);
    }

    fn notify(&self, event: PeerEvent) {
        let subscribers: Vec<_> = lock(&self.subscribers)
            .iter()
            .map(|(_, tx)| tx.clone())
            .collect();
        for tx in subscribers {
            if tx.try_send(event.clone()).is_err() {
                tracing::debug!(?event, "subscriber missed peer event");
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sockets
    // ─────────────────────────────────────────────────────────────────────────

    /// Dial `address` and run the outbound handshake.
    pub async fn connect(
        self: &Arc<Self>,
        address: &PeerAddress,
        handler: Arc<dyn PeerMessageHandler>,
    ) -> Result<PeerHandle> {
        if self.is_connected(address) {
            return Err(SyncError::AlreadyConnected(address.clone()));
        }
        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect((address.host.as_str(), address.port)),
        )
        .await
        .map_err(|_| SyncError::Timeout(format!("connecting to {}", address)))??;
        establish(stream, address.clone(), true, self, handler).await
    }

    /// Accept inbound connections until `shutdown` flips.
    pub async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        handler: Arc<dyn PeerMessageHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.changed() => return,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, remote)) => {
                    let address = PeerAddress::new(remote.ip().to_string(), remote.port());
                    let manager = Arc::clone(&self);
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        if let Err(e) = establish(stream, address.clone(), false, &manager, handler).await {
                            tracing::debug!(peer = %address, error = %e, "inbound connection failed");
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Close every connection.
    pub fn shutdown(&self) {
        let peers: Vec<_> = lock(&self.peers).drain().collect();
        for (address, handle) in peers {
            handle.close();
            self.notify(PeerEvent::Disconnected(address));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests_support::fake_handle;

    #[test]
    fn test_add_and_remove_peer() {
        let manager = ConnectionManager::new(ConnectionConfig::default());
        let (handle, _rx) = fake_handle("a", 1, 100);
        manager.add_peer(handle).unwrap();
        assert!(manager.is_connected(&PeerAddress::new("a", 1)));

        assert!(manager.remove_peer(&PeerAddress::new("a", 1)).is_some());
        assert!(manager.peers().is_empty());
    }

    #[test]
    fn test_second_connection_rejected() {
        let manager = ConnectionManager::new(ConnectionConfig::default());
        let (first, _rx1) = fake_handle("a", 1, 100);
        let (second, _rx2) = fake_handle("a", 1, 200);
        manager.add_peer(first).unwrap();
        assert!(matches!(
            manager.add_peer(second),
            Err(SyncError::AlreadyConnected(_))
        ));
    }

    #[test]
    fn test_duplicate_nonce_rejected() {
        let manager = ConnectionManager::new(ConnectionConfig::default());
        let (ours, _rx) = fake_handle("self", 1, manager.nonce());
        assert!(matches!(
            manager.add_peer(ours),
            Err(SyncError::DuplicateNonce(_))
        ));

        let (a, _rxa) = fake_handle("a", 1, 5);
        let (b, _rxb) = fake_handle("b", 1, 5);
        manager.add_peer(a).unwrap();
        assert!(matches!(manager.add_peer(b), Err(SyncError::DuplicateNonce(5))));
    }

    #[test]
    fn test_max_peers() {
        let manager = ConnectionManager::new(ConnectionConfig {
            max_peers: 1,
            ..ConnectionConfig::default()
        });
        let (a, _rxa) = fake_handle("a", 1, 1);
        let (b, _rxb) = fake_handle("b", 1, 2);
        manager.add_peer(a).unwrap();
        assert!(matches!(manager.add_peer(b), Err(SyncError::TooManyPeers(1))));
    }

    #[tokio::test]
    async fn test_subscription_events_and_unsubscribe() {
        let manager = ConnectionManager::new(ConnectionConfig::default());
        let mut sub = manager.subscribe();

        let (handle, _rx) = fake_handle("a", 1, 1);
        manager.add_peer(handle).unwrap();
        manager.remove_peer(&PeerAddress::new("a", 1));

        assert_eq!(
            sub.recv().await,
            Some(PeerEvent::Connected(PeerAddress::new("a", 1)))
        );
        assert_eq!(
            sub.recv().await,
            Some(PeerEvent::Disconnected(PeerAddress::new("a", 1)))
        );

        drop(sub);
        assert!(lock(&manager.subscribers).is_empty());
    }

    #[test]
    fn test_broadcast_counts_live_peers() {
        let manager = ConnectionManager::new(ConnectionConfig::default());
        let (a, mut rxa) = fake_handle("a", 1, 1);
        let (b, rxb) = fake_handle("b", 1, 2);
        manager.add_peer(a).unwrap();
        manager.add_peer(b).unwrap();
        drop(rxb);

        assert_eq!(manager.broadcast(&Message::Verack), 1);
        assert!(matches!(rxa.try_recv(), Ok(Message::Verack)));
    }
}
