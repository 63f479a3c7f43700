//! The ingestion gate every squeak passes before it is stored.
//!
//! Checks run in a fixed order and the first failure wins:
//!
//! 1. structure, signature and key integrity
//! 2. the anchor block matches the oracle's block at that height
//! 3. the author is whitelisted, when enforcement is on
//! 4. the author is below the per-(author, height) limit
//! 5. the store is below its squeak cap
//!
//! The per-height count is read from stored rows, so only accepted squeaks
//! count toward it. Check and insert run under one lock.

use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;

use squeaknode_core::{validate_squeak, Squeak, SqueakHash};
use squeaknode_store::{InsertResult, Store, StoreExt};

use crate::config::NodeSection;
use crate::error::Result;
use crate::oracle::BlockchainOracle;

/// Why a squeak was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Bad structure, signature or decryption key.
    Invalid,
    /// The anchor block is not on the best chain.
    InvalidBlock,
    NotWhitelisted,
    RateLimited,
    StorageFull,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Invalid => "invalid",
            RejectReason::InvalidBlock => "invalid-block",
            RejectReason::NotWhitelisted => "not-whitelisted",
            RejectReason::RateLimited => "rate-limited",
            RejectReason::StorageFull => "storage-full",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of ingesting a squeak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Squeak was accepted and stored.
    Accepted(SqueakHash),
    /// Squeak was already stored. An unlocked copy still attaches its key.
    Duplicate,
    /// Squeak was refused and nothing changed.
    Rejected(RejectReason),
}

impl IngestOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, IngestOutcome::Accepted(_))
    }
}

/// Ingestion limits.
#[derive(Debug, Clone)]
pub struct GatePolicy {
    pub max_squeaks: u64,
    pub max_squeaks_per_author_per_block: u64,
    pub whitelist_enforced: bool,
}

impl From<&NodeSection> for GatePolicy {
    fn from(section: &NodeSection) -> Self {
        Self {
            max_squeaks: section.max_squeaks,
            max_squeaks_per_author_per_block: section.max_squeaks_per_author_per_block,
            whitelist_enforced: section.whitelist_enforced,
        }
    }
}

pub struct IngestionGate<S: Store, O: BlockchainOracle> {
    store: Arc<S>,
    oracle: Arc<O>,
    policy: GatePolicy,
    lock: Mutex<()>,
}

impl<S: Store, O: BlockchainOracle> IngestionGate<S, O> {
    pub fn new(store: Arc<S>, oracle: Arc<O>, policy: GatePolicy) -> Self {
        Self {
            store,
            oracle,
            policy,
            lock: Mutex::new(()),
        }
    }

    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    /// Gate and store one squeak.
    ///
    /// Oracle failures are errors, not rejections: the squeak may be fine.
    pub async fn ingest(&self, squeak: &Squeak) -> Result<IngestOutcome> {
        let hash = squeak.compute_hash();
        if let Err(e) = validate_squeak(squeak) {
            tracing::warn!(squeak_hash = %hash, error = %e, "rejected invalid squeak");
            return Ok(IngestOutcome::Rejected(RejectReason::Invalid));
        }

        let _guard = self.lock.lock().await;

        if let Some(existing) = self.store.get_squeak(&hash).await? {
            if let (false, Some(key)) = (existing.is_unlocked(), &squeak.decryption_key) {
                self.store.set_decryption_key(&hash, key).await?;
                tracing::info!(squeak_hash = %hash, "attached decryption key");
            }
            return Ok(IngestOutcome::Duplicate);
        }

        if let Some(reason) = self.check_policy(squeak).await? {
            tracing::warn!(squeak_hash = %hash, reason = %reason, "rejected squeak");
            return Ok(IngestOutcome::Rejected(reason));
        }

        match self.store.insert_squeak(squeak).await? {
            InsertResult::Inserted { .. } => {
                tracing::info!(
                    squeak_hash = %hash,
                    author = %squeak.address(),
                    block_height = squeak.block_height(),
                    "accepted squeak"
                );
                Ok(IngestOutcome::Accepted(hash))
            }
            InsertResult::AlreadyExists => Ok(IngestOutcome::Duplicate),
        }
    }

    async fn check_policy(&self, squeak: &Squeak) -> Result<Option<RejectReason>> {
        let height = squeak.block_height();
        let anchored = self
            .oracle
            .get_block_info(height)
            .await?
            .is_some_and(|block| block.hash == squeak.header.block_hash);
        if !anchored {
            return Ok(Some(RejectReason::InvalidBlock));
        }

        let author = squeak.address();
        if self.policy.whitelist_enforced && !self.store.is_whitelisted(&author).await? {
            return Ok(Some(RejectReason::NotWhitelisted));
        }

        let posted = self
            .store
            .count_squeaks_by_author_at_height(&author, height)
            .await?;
        if posted >= self.policy.max_squeaks_per_author_per_block {
            return Ok(Some(RejectReason::RateLimited));
        }

        if self.store.count_squeaks().await? >= self.policy.max_squeaks {
            return Ok(Some(RejectReason::StorageFull));
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NodeError;
    use crate::oracle::memory::{synthetic_hash, MemoryChain};
    use squeaknode_core::{BlockHash, Keypair, Profile, SqueakBuilder};
    use squeaknode_store::{MemoryStore, ProfileFlag};

    fn policy() -> GatePolicy {
        GatePolicy {
            max_squeaks: 100,
            max_squeaks_per_author_per_block: 3,
            whitelist_enforced: false,
        }
    }

    fn gate(policy: GatePolicy) -> (IngestionGate<MemoryStore, MemoryChain>, Arc<MemoryStore>, Arc<MemoryChain>) {
        let store = Arc::new(MemoryStore::new());
        let chain = Arc::new(MemoryChain::with_height(100));
        (
            IngestionGate::new(Arc::clone(&store), Arc::clone(&chain), policy),
            store,
            chain,
        )
    }

    fn anchored(keypair: &Keypair, height: u64, text: &str) -> Squeak {
        SqueakBuilder::new(height, synthetic_hash(height, 0))
            .content(text)
            .sign(keypair)
            .unwrap()
    }

    #[tokio::test]
    async fn test_accept_then_duplicate() {
        let (gate, store, _) = gate(policy());
        let squeak = anchored(&Keypair::generate(), 100, "hello");

        let outcome = gate.ingest(&squeak).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Accepted(squeak.compute_hash()));
        assert_eq!(gate.ingest(&squeak).await.unwrap(), IngestOutcome::Duplicate);
        assert_eq!(store.count_squeaks().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_tampered_squeak_is_invalid() {
        let (gate, store, _) = gate(policy());
        let mut squeak = anchored(&Keypair::generate(), 100, "hello");
        squeak.header.created_at += 1;

        assert_eq!(
            gate.ingest(&squeak).await.unwrap(),
            IngestOutcome::Rejected(RejectReason::Invalid)
        );
        assert_eq!(store.count_squeaks().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_anchor_must_match_chain() {
        let (gate, _, chain) = gate(policy());
        let keypair = Keypair::generate();

        let wrong_hash = SqueakBuilder::new(50, BlockHash::from_bytes([0xee; 32]))
            .content("x")
            .sign(&keypair)
            .unwrap();
        assert_eq!(
            gate.ingest(&wrong_hash).await.unwrap(),
            IngestOutcome::Rejected(RejectReason::InvalidBlock)
        );

        let future = anchored(&keypair, 101, "too early");
        assert_eq!(
            gate.ingest(&future).await.unwrap(),
            IngestOutcome::Rejected(RejectReason::InvalidBlock)
        );

        chain.mine().await;
        assert!(gate.ingest(&future).await.unwrap().is_accepted());
    }

    #[tokio::test]
    async fn test_whitelist_enforced() {
        let (gate, store, _) = gate(GatePolicy {
            whitelist_enforced: true,
            ..policy()
        });
        let author = Keypair::generate();
        let squeak = anchored(&author, 100, "hi");

        assert_eq!(
            gate.ingest(&squeak).await.unwrap(),
            IngestOutcome::Rejected(RejectReason::NotWhitelisted)
        );

        let id = store
            .insert_profile(&Profile::contact("author", author.address()))
            .await
            .unwrap();
        store
            .set_profile_flag(id, ProfileFlag::Whitelisted, true)
            .await
            .unwrap();
        assert!(gate.ingest(&squeak).await.unwrap().is_accepted());
    }

    #[tokio::test]
    async fn test_rate_limit_per_author_and_height() {
        let (gate, store, _) = gate(policy());
        let author = Keypair::generate();

        for i in 0..3 {
            let squeak = anchored(&author, 100, &format!("post {}", i));
            assert!(gate.ingest(&squeak).await.unwrap().is_accepted());
        }
        let extra = anchored(&author, 100, "one too many");
        assert_eq!(
            gate.ingest(&extra).await.unwrap(),
            IngestOutcome::Rejected(RejectReason::RateLimited)
        );
        assert_eq!(
            store
                .count_squeaks_by_author_at_height(&author.address(), 100)
                .await
                .unwrap(),
            3
        );

        // Another height, or another author, is unaffected.
        assert!(gate.ingest(&anchored(&author, 99, "earlier")).await.unwrap().is_accepted());
        assert!(gate
            .ingest(&anchored(&Keypair::generate(), 100, "someone else"))
            .await
            .unwrap()
            .is_accepted());
    }

    #[tokio::test]
    async fn test_storage_cap() {
        let (gate, _, _) = gate(GatePolicy {
            max_squeaks: 2,
            ..policy()
        });
        for i in 0..2 {
            let squeak = anchored(&Keypair::generate(), 100, &i.to_string());
            assert!(gate.ingest(&squeak).await.unwrap().is_accepted());
        }
        assert_eq!(
            gate.ingest(&anchored(&Keypair::generate(), 100, "full")).await.unwrap(),
            IngestOutcome::Rejected(RejectReason::StorageFull)
        );
    }

    #[tokio::test]
    async fn test_unlocked_copy_attaches_key() {
        let (gate, store, _) = gate(policy());
        let squeak = anchored(&Keypair::generate(), 100, "secret");
        let hash = squeak.compute_hash();

        assert!(gate.ingest(&squeak.locked()).await.unwrap().is_accepted());
        assert!(!store.get_squeak(&hash).await.unwrap().unwrap().is_unlocked());

        assert_eq!(gate.ingest(&squeak).await.unwrap(), IngestOutcome::Duplicate);
        let stored = store.get_squeak(&hash).await.unwrap().unwrap();
        assert_eq!(stored.decrypt_content().unwrap(), "secret");
    }

    #[tokio::test]
    async fn test_oracle_failure_is_error() {
        let (gate, _, chain) = gate(policy());
        chain.set_unreachable(true).await;
        let result = gate.ingest(&anchored(&Keypair::generate(), 100, "hi")).await;
        assert!(matches!(result, Err(NodeError::Oracle(_))));
    }
}
