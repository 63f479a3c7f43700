//! Store trait: the abstract interface for squeaknode persistence.
//!
//! This trait allows the node to be storage-agnostic. Implementations
//! include SQLite (primary) and in-memory (for tests).

use async_trait::async_trait;
use squeaknode_core::{
    Address, DecryptionKey, Interest, PaymentHash, Peer, PeerAddress, Profile, ReceivedOffer,
    ReceivedPayment, SentOffer, SentPayment, Squeak, SqueakHash,
};

use crate::error::Result;

/// Result of inserting a row that is unique on some key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    /// The row was inserted with this id.
    Inserted { id: i64 },
    /// A row with the same key already exists (idempotent - not an error).
    AlreadyExists,
}

impl InsertResult {
    pub fn is_inserted(&self) -> bool {
        matches!(self, InsertResult::Inserted { .. })
    }
}

/// A boolean column on a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileFlag {
    Following,
    Sharing,
    Whitelisted,
}

/// A boolean column on a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerFlag {
    Uploading,
    Downloading,
    Autoconnect,
}

/// The Store trait: async interface for node persistence.
///
/// All methods are async to support both sync (SQLite) and async backends.
/// For SQLite, we use `spawn_blocking` internally to avoid blocking the runtime.
///
/// # Uniqueness
///
/// - squeaks by hash
/// - profiles by name and by address
/// - peers by address
/// - sent offers by (squeak hash, counterparty), received offers by
///   (squeak hash, seller)
/// - sent and received payments by payment hash
#[async_trait]
pub trait Store: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Squeak Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert a squeak. The decryption key is stored if present.
    async fn insert_squeak(&self, squeak: &Squeak) -> Result<InsertResult>;

    /// Get a squeak by hash, with its decryption key if one is stored.
    async fn get_squeak(&self, hash: &SqueakHash) -> Result<Option<Squeak>>;

    async fn has_squeak(&self, hash: &SqueakHash) -> Result<bool>;

    /// Attach a decryption key to a stored squeak.
    ///
    /// Returns false if the squeak is unknown. The caller checks the key.
    async fn set_decryption_key(&self, hash: &SqueakHash, key: &DecryptionKey) -> Result<bool>;

    async fn count_squeaks(&self) -> Result<u64>;

    /// Number of stored squeaks by `author` anchored at `block_height`.
    async fn count_squeaks_by_author_at_height(
        &self,
        author: &Address,
        block_height: u64,
    ) -> Result<u64>;

    /// Hashes of stored squeaks matching the interest, ordered by block
    /// height then hash.
    async fn lookup_squeaks(&self, interest: &Interest) -> Result<Vec<SqueakHash>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Profile Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert a profile and return its id.
    ///
    /// Fails with `Duplicate` if the name or address is taken.
    async fn insert_profile(&self, profile: &Profile) -> Result<i64>;

    async fn get_profile(&self, id: i64) -> Result<Option<Profile>>;

    async fn get_profile_by_address(&self, address: &Address) -> Result<Option<Profile>>;

    async fn get_profile_by_name(&self, name: &str) -> Result<Option<Profile>>;

    async fn list_profiles(&self) -> Result<Vec<Profile>>;

    async fn delete_profile(&self, id: i64) -> Result<bool>;

    async fn set_profile_flag(&self, id: i64, flag: ProfileFlag, value: bool) -> Result<bool>;

    /// Addresses of every followed profile.
    async fn followed_addresses(&self) -> Result<Vec<Address>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Peer Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert a peer and return its id. Fails with `Duplicate` on address.
    async fn insert_peer(&self, peer: &Peer) -> Result<i64>;

    async fn get_peer(&self, id: i64) -> Result<Option<Peer>>;

    async fn get_peer_by_address(&self, address: &PeerAddress) -> Result<Option<Peer>>;

    async fn list_peers(&self) -> Result<Vec<Peer>>;

    async fn delete_peer(&self, id: i64) -> Result<bool>;

    async fn set_peer_flag(&self, id: i64, flag: PeerFlag, value: bool) -> Result<bool>;

    // ─────────────────────────────────────────────────────────────────────────
    // Offer Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert a sent offer. The payment hash is unique, and a (squeak, peer)
    /// pair holds at most one live offer: insertion is refused while an
    /// earlier offer for the pair has not expired at the new invoice
    /// timestamp. Expired offers stay until swept.
    async fn insert_sent_offer(&self, offer: &SentOffer) -> Result<InsertResult>;

    /// The newest offer sent for `squeak_hash` to `counterparty`.
    async fn get_sent_offer(
        &self,
        squeak_hash: &SqueakHash,
        counterparty: &PeerAddress,
    ) -> Result<Option<SentOffer>>;

    async fn get_sent_offer_by_payment_hash(
        &self,
        payment_hash: &PaymentHash,
    ) -> Result<Option<SentOffer>>;

    /// Delete sent offers that expired before `now_secs`. Returns the count.
    async fn delete_expired_sent_offers(&self, now_secs: i64) -> Result<u64>;

    /// Insert or refresh a received offer and return its id.
    ///
    /// An existing unpaid offer for the same (squeak, seller) is replaced
    /// in place; a paid one is left untouched.
    async fn upsert_received_offer(&self, offer: &ReceivedOffer) -> Result<i64>;

    async fn get_received_offer(&self, id: i64) -> Result<Option<ReceivedOffer>>;

    /// Received offers, optionally only for one squeak.
    async fn list_received_offers(
        &self,
        squeak_hash: Option<&SqueakHash>,
    ) -> Result<Vec<ReceivedOffer>>;

    async fn mark_received_offer_paid(&self, id: i64) -> Result<bool>;

    /// Delete unpaid received offers that expired before `now_secs`.
    async fn delete_expired_received_offers(&self, now_secs: i64) -> Result<u64>;

    // ─────────────────────────────────────────────────────────────────────────
    // Payment Operations
    // ─────────────────────────────────────────────────────────────────────────

    async fn insert_sent_payment(&self, payment: &SentPayment) -> Result<InsertResult>;

    async fn get_sent_payment(&self, payment_hash: &PaymentHash) -> Result<Option<SentPayment>>;

    async fn set_sent_payment_valid(&self, payment_hash: &PaymentHash, valid: bool)
        -> Result<bool>;

    async fn list_sent_payments(&self) -> Result<Vec<SentPayment>>;

    async fn insert_received_payment(&self, payment: &ReceivedPayment) -> Result<InsertResult>;

    async fn list_received_payments(&self) -> Result<Vec<ReceivedPayment>>;

    /// Highest settle index recorded, or 0.
    async fn latest_settle_index(&self) -> Result<u64>;

    /// Sum of all received payments in msat.
    async fn total_received_msat(&self) -> Result<u64>;
}

/// Extension trait for common store patterns.
pub trait StoreExt: Store {
    /// Union of `lookup_squeaks` over several interests, without repeats.
    fn lookup_squeaks_any(
        &self,
        interests: &[Interest],
    ) -> impl std::future::Future<Output = Result<Vec<SqueakHash>>> + Send;

    /// Whether the author of `address` is whitelisted.
    fn is_whitelisted(
        &self,
        address: &Address,
    ) -> impl std::future::Future<Output = Result<bool>> + Send;
}

impl<S: Store + ?Sized> StoreExt for S {
    async fn lookup_squeaks_any(&self, interests: &[Interest]) -> Result<Vec<SqueakHash>> {
        let mut seen = std::collections::HashSet::new();
        let mut hashes = Vec::new();
        for interest in interests {
            for hash in self.lookup_squeaks(interest).await? {
                if seen.insert(hash) {
                    hashes.push(hash);
                }
            }
        }
        Ok(hashes)
    }

    async fn is_whitelisted(&self, address: &Address) -> Result<bool> {
        Ok(self
            .get_profile_by_address(address)
            .await?
            .is_some_and(|profile| profile.whitelisted))
    }
}
