//! Request/response correlation across peer connections.
//!
//! A caller registers what it is waiting for, broadcasts a request, and
//! waits. Every connection's reader feeds deliveries through
//! [`ActiveDownloadManager::process_squeak`] or
//! [`ActiveDownloadManager::process_offer`]; any delivery may satisfy any
//! registration. Matching, counting and the completion check for one
//! registration happen under the table lock, so concurrent deliveries never
//! overshoot the expected count.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use squeaknode_core::{Interest, PeerAddress, Squeak, SqueakHash};

/// What a download is waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadTarget {
    /// One squeak by hash.
    Hash(SqueakHash),
    /// Squeaks matching an interest.
    Interest(Interest),
    /// Offers for one squeak, counted once per seller.
    Offer(SqueakHash),
}

/// How a download went. Partial results after a timeout are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadResult {
    pub requested: usize,
    pub received: usize,
    pub elapsed: Duration,
}

impl DownloadResult {
    pub fn is_complete(&self) -> bool {
        self.received >= self.requested
    }
}

struct Registration {
    id: u64,
    target: DownloadTarget,
    expected: usize,
    counted: HashSet<(SqueakHash, Option<PeerAddress>)>,
    done: Option<oneshot::Sender<()>>,
}

impl Registration {
    fn matches_squeak(&self, hash: &SqueakHash, squeak: &Squeak) -> bool {
        match &self.target {
            DownloadTarget::Hash(wanted) => wanted == hash,
            DownloadTarget::Interest(interest) => interest.matches(squeak),
            DownloadTarget::Offer(_) => false,
        }
    }

    /// Count one delivery. Returns true if it was new.
    fn count(&mut self, key: (SqueakHash, Option<PeerAddress>)) -> bool {
        if self.counted.len() >= self.expected || !self.counted.insert(key) {
            return false;
        }
        if self.counted.len() == self.expected {
            if let Some(done) = self.done.take() {
                let _ = done.send(());
            }
        }
        true
    }
}

/// The live download table.
#[derive(Default)]
pub struct ActiveDownloadManager {
    registrations: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
}

/// Removes a registration if the waiting future is dropped early.
struct RegistrationGuard<'a> {
    manager: &'a ActiveDownloadManager,
    id: u64,
}

impl Drop for RegistrationGuard<'_> {
    fn drop(&mut self) {
        self.manager.remove(self.id);
    }
}

impl ActiveDownloadManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Registration>> {
        self.registrations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `target`, run `send`, and wait until `expected` deliveries
    /// arrive or `timeout` elapses.
    ///
    /// The registration exists before `send` runs, so replies that race
    /// the request are still counted.
    pub async fn download<F, Fut>(
        &self,
        target: DownloadTarget,
        expected: usize,
        timeout: Duration,
        send: F,
    ) -> DownloadResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        let started = Instant::now();
        if expected == 0 {
            return DownloadResult {
                requested: 0,
                received: 0,
                elapsed: started.elapsed(),
            };
        }

        let (done_tx, done_rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(id, ?target, expected, "download registered");
        self.lock().push(Registration {
            id,
            target,
            expected,
            counted: HashSet::new(),
            done: Some(done_tx),
        });
        let _guard = RegistrationGuard { manager: self, id };

        send().await;
        if tokio::time::timeout(timeout, done_rx).await.is_err() {
            tracing::debug!(id, "download timed out");
        }

        let received = self.remove(id).map_or(0, |r| r.counted.len());
        DownloadResult {
            requested: expected,
            received,
            elapsed: started.elapsed(),
        }
    }

    fn remove(&self, id: u64) -> Option<Registration> {
        let mut registrations = self.lock();
        let index = registrations.iter().position(|r| r.id == id)?;
        Some(registrations.remove(index))
    }

    /// Feed a received squeak to every registration, in registration order.
    ///
    /// Returns how many registrations counted it.
    pub fn process_squeak(&self, squeak: &Squeak) -> usize {
        let hash = squeak.compute_hash();
        let mut registrations = self.lock();
        let mut counted = 0;
        for registration in registrations.iter_mut() {
            if registration.matches_squeak(&hash, squeak) && registration.count((hash, None)) {
                counted += 1;
            }
        }
        counted
    }

    /// Whether an unfinished registration is waiting for this squeak.
    pub fn wants_squeak(&self, squeak: &Squeak) -> bool {
        let hash = squeak.compute_hash();
        self.lock().iter().any(|registration| {
            registration.counted.len() < registration.expected
                && registration.matches_squeak(&hash, squeak)
        })
    }

    /// Whether a download for exactly `hash` is registered.
    pub fn is_fetching(&self, hash: &SqueakHash) -> bool {
        self.lock()
            .iter()
            .any(|registration| matches!(&registration.target, DownloadTarget::Hash(wanted) if wanted == hash))
    }

    /// Feed a received offer for `hash` from `seller`.
    pub fn process_offer(&self, hash: &SqueakHash, seller: &PeerAddress) -> usize {
        let mut registrations = self.lock();
        let mut counted = 0;
        for registration in registrations.iter_mut() {
            let hit = matches!(&registration.target, DownloadTarget::Offer(wanted) if wanted == hash);
            if hit && registration.count((*hash, Some(seller.clone()))) {
                counted += 1;
            }
        }
        counted
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use squeaknode_core::{BlockHash, Keypair, SqueakBuilder};
    use std::sync::Arc;

    fn squeak_at(keypair: &Keypair, height: u64, text: &str) -> Squeak {
        SqueakBuilder::new(height, BlockHash::from_bytes([1; 32]))
            .content(text)
            .sign(keypair)
            .unwrap()
            .locked()
    }

    #[tokio::test]
    async fn test_single_hash_counts_first_delivery_only() {
        let manager = ActiveDownloadManager::new();
        let squeak = squeak_at(&Keypair::generate(), 5, "hi");
        let hash = squeak.compute_hash();
        let (m, s) = (&manager, &squeak);

        let result = manager
            .download(DownloadTarget::Hash(hash), 1, Duration::from_secs(5), move || async move {
                assert!(m.wants_squeak(s));
                assert!(m.is_fetching(&hash));
                assert_eq!(m.process_squeak(s), 1);
                assert!(!m.wants_squeak(s));
                assert_eq!(m.process_squeak(s), 0);
            })
            .await;

        assert_eq!(result.requested, 1);
        assert_eq!(result.received, 1);
        assert!(result.is_complete());
        assert!(!manager.is_fetching(&hash));
        assert!(manager.is_empty());
        assert_eq!(manager.process_squeak(&squeak), 0);
    }

    #[tokio::test]
    async fn test_interest_target_filters() {
        let manager = ActiveDownloadManager::new();
        let author = Keypair::generate();
        let other = Keypair::generate();
        let interest = Interest::author(author.address()).with_min_block(10);
        let deliveries = vec![
            squeak_at(&author, 12, "a"),
            squeak_at(&author, 3, "too old"),
            squeak_at(&other, 12, "stranger"),
            squeak_at(&author, 15, "b"),
        ];
        let m = &manager;

        let result = manager
            .download(DownloadTarget::Interest(interest), 5, Duration::from_millis(50), move || async move {
                for squeak in &deliveries {
                    m.process_squeak(squeak);
                }
            })
            .await;

        assert_eq!(result.requested, 5);
        assert_eq!(result.received, 2);
        assert!(!result.is_complete());
    }

    #[tokio::test]
    async fn test_offers_count_once_per_seller() {
        let manager = ActiveDownloadManager::new();
        let hash = SqueakHash::from_bytes([7; 32]);
        let a = PeerAddress::new("a", 1);
        let b = PeerAddress::new("b", 1);
        let m = &manager;

        let result = manager
            .download(DownloadTarget::Offer(hash), 2, Duration::from_secs(5), move || async move {
                m.process_offer(&hash, &a);
                m.process_offer(&hash, &a);
                m.process_offer(&SqueakHash::ZERO, &b);
                m.process_offer(&hash, &b);
            })
            .await;

        assert_eq!(result.received, 2);
    }

    #[tokio::test]
    async fn test_concurrent_deliveries_do_not_overshoot() {
        let manager = Arc::new(ActiveDownloadManager::new());
        let keypair = Keypair::generate();
        let squeaks: Vec<_> = (0..20).map(|i| squeak_at(&keypair, 1, &i.to_string())).collect();

        let feeder = Arc::clone(&manager);
        let result = manager
            .download(DownloadTarget::Interest(Interest::any()), 5, Duration::from_secs(5), move || async move {
                let tasks: Vec<_> = squeaks
                    .into_iter()
                    .map(|squeak| {
                        let feeder = Arc::clone(&feeder);
                        tokio::spawn(async move { feeder.process_squeak(&squeak) })
                    })
                    .collect();
                let mut counted = 0;
                for task in tasks {
                    counted += task.await.unwrap();
                }
                assert_eq!(counted, 5);
            })
            .await;

        assert_eq!(result.received, 5);
    }

    #[tokio::test]
    async fn test_zero_expected_returns_immediately() {
        let manager = ActiveDownloadManager::new();
        let result = manager
            .download(DownloadTarget::Hash(SqueakHash::ZERO), 0, Duration::from_secs(60), || async {
                panic!("nothing to request");
            })
            .await;
        assert_eq!(result.received, 0);
        assert!(result.is_complete());
    }

    #[tokio::test]
    async fn test_cancelled_download_unregisters() {
        let manager = Arc::new(ActiveDownloadManager::new());
        let waiter = Arc::clone(&manager);
        let task = tokio::spawn(async move {
            waiter
                .download(DownloadTarget::Hash(SqueakHash::ZERO), 1, Duration::from_secs(60), || async {})
                .await
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        task.abort();
        let _ = task.await;
        assert!(manager.is_empty());
    }

    proptest! {
        #[test]
        fn prop_received_never_exceeds_expected(expected in 1usize..6, deliveries in proptest::collection::vec(0u8..10, 0..30)) {
            let manager = ActiveDownloadManager::new();
            let (done_tx, _done_rx) = oneshot::channel();
            manager.lock().push(Registration {
                id: 0,
                target: DownloadTarget::Offer(SqueakHash::ZERO),
                expected,
                counted: HashSet::new(),
                done: Some(done_tx),
            });

            let mut total = 0;
            for seller in &deliveries {
                total += manager.process_offer(&SqueakHash::ZERO, &PeerAddress::new("p", u16::from(*seller)));
            }

            let distinct: HashSet<_> = deliveries.iter().collect();
            prop_assert_eq!(total, distinct.len().min(expected));
        }
    }
}
