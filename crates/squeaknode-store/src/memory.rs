//! In-memory implementation of the Store trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use squeaknode_core::{
    Address, DecryptionKey, Interest, PaymentHash, Peer, PeerAddress, Profile, ReceivedOffer,
    ReceivedPayment, SentOffer, SentPayment, Squeak, SqueakHash,
};

use crate::error::{Result, StoreError};
use crate::traits::{InsertResult, PeerFlag, ProfileFlag, Store};

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    squeaks: HashMap<SqueakHash, Squeak>,
    profiles: BTreeMap<i64, Profile>,
    peers: BTreeMap<i64, Peer>,
    sent_offers: BTreeMap<i64, SentOffer>,
    received_offers: BTreeMap<i64, ReceivedOffer>,
    sent_payments: BTreeMap<i64, SentPayment>,
    received_payments: BTreeMap<i64, ReceivedPayment>,
    /// Shared id sequence, like SQLite rowids.
    last_id: i64,
}

impl MemoryStoreInner {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryStoreInner::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStoreInner>> {
        self.inner
            .read()
            .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {}", e)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStoreInner>> {
        self.inner
            .write()
            .map_err(|e| StoreError::Unavailable(format!("lock poisoned: {}", e)))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    // ─────────────────────────────────────────────────────────────────────────
    // Squeaks
    // ─────────────────────────────────────────────────────────────────────────

    async fn insert_squeak(&self, squeak: &Squeak) -> Result<InsertResult> {
        let mut inner = self.write()?;
        let hash = squeak.compute_hash();
        if inner.squeaks.contains_key(&hash) {
            return Ok(InsertResult::AlreadyExists);
        }
        let id = inner.next_id();
        inner.squeaks.insert(hash, squeak.clone());
        Ok(InsertResult::Inserted { id })
    }

    async fn get_squeak(&self, hash: &SqueakHash) -> Result<Option<Squeak>> {
        Ok(self.read()?.squeaks.get(hash).cloned())
    }

    async fn has_squeak(&self, hash: &SqueakHash) -> Result<bool> {
        Ok(self.read()?.squeaks.contains_key(hash))
    }

    async fn set_decryption_key(&self, hash: &SqueakHash, key: &DecryptionKey) -> Result<bool> {
        let mut inner = self.write()?;
        match inner.squeaks.get_mut(hash) {
            Some(squeak) => {
                squeak.decryption_key = Some(key.clone());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn count_squeaks(&self) -> Result<u64> {
        Ok(self.read()?.squeaks.len() as u64)
    }

    async fn count_squeaks_by_author_at_height(
        &self,
        author: &Address,
        block_height: u64,
    ) -> Result<u64> {
        let inner = self.read()?;
        Ok(inner
            .squeaks
            .values()
            .filter(|s| s.block_height() == block_height && s.address() == *author)
            .count() as u64)
    }

    async fn lookup_squeaks(&self, interest: &Interest) -> Result<Vec<SqueakHash>> {
        let inner = self.read()?;
        let mut matches: Vec<(u64, SqueakHash)> = inner
            .squeaks
            .iter()
            .filter(|(_, squeak)| interest.matches(squeak))
            .map(|(hash, squeak)| (squeak.block_height(), *hash))
            .collect();
        matches.sort();
        Ok(matches.into_iter().map(|(_, hash)| hash).collect())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Profiles
    // ─────────────────────────────────────────────────────────────────────────

    async fn insert_profile(&self, profile: &Profile) -> Result<i64> {
        let mut inner = self.write()?;
        if inner
            .profiles
            .values()
            .any(|p| p.name == profile.name || p.address == profile.address)
        {
            return Err(StoreError::Duplicate("profile name or address".into()));
        }
        let id = inner.next_id();
        let mut stored = profile.clone();
        stored.id = id;
        inner.profiles.insert(id, stored);
        Ok(id)
    }

    async fn get_profile(&self, id: i64) -> Result<Option<Profile>> {
        Ok(self.read()?.profiles.get(&id).cloned())
    }

    async fn get_profile_by_address(&self, address: &Address) -> Result<Option<Profile>> {
        let inner = self.read()?;
        Ok(inner.profiles.values().find(|p| p.address == *address).cloned())
    }

    async fn get_profile_by_name(&self, name: &str) -> Result<Option<Profile>> {
        let inner = self.read()?;
        Ok(inner.profiles.values().find(|p| p.name == name).cloned())
    }

    async fn list_profiles(&self) -> Result<Vec<Profile>> {
        Ok(self.read()?.profiles.values().cloned().collect())
    }

    async fn delete_profile(&self, id: i64) -> Result<bool> {
        Ok(self.write()?.profiles.remove(&id).is_some())
    }

    async fn set_profile_flag(&self, id: i64, flag: ProfileFlag, value: bool) -> Result<bool> {
        let mut inner = self.write()?;
        let Some(profile) = inner.profiles.get_mut(&id) else {
            return Ok(false);
        };
        match flag {
            ProfileFlag::Following => profile.following = value,
            ProfileFlag::Sharing => profile.sharing = value,
            ProfileFlag::Whitelisted => profile.whitelisted = value,
        }
        Ok(true)
    }

    async fn followed_addresses(&self) -> Result<Vec<Address>> {
        let inner = self.read()?;
        Ok(inner
            .profiles
            .values()
            .filter(|p| p.following)
            .map(|p| p.address)
            .collect())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Peers
    // ─────────────────────────────────────────────────────────────────────────

    async fn insert_peer(&self, peer: &Peer) -> Result<i64> {
        let mut inner = self.write()?;
        if inner.peers.values().any(|p| p.address == peer.address) {
            return Err(StoreError::Duplicate("peer address".into()));
        }
        let id = inner.next_id();
        let mut stored = peer.clone();
        stored.id = id;
        inner.peers.insert(id, stored);
        Ok(id)
    }

    async fn get_peer(&self, id: i64) -> Result<Option<Peer>> {
        Ok(self.read()?.peers.get(&id).cloned())
    }

    async fn get_peer_by_address(&self, address: &PeerAddress) -> Result<Option<Peer>> {
        let inner = self.read()?;
        Ok(inner.peers.values().find(|p| p.address == *address).cloned())
    }

    async fn list_peers(&self) -> Result<Vec<Peer>> {
        Ok(self.read()?.peers.values().cloned().collect())
    }

    async fn delete_peer(&self, id: i64) -> Result<bool> {
        Ok(self.write()?.peers.remove(&id).is_some())
    }

    async fn set_peer_flag(&self, id: i64, flag: PeerFlag, value: bool) -> Result<bool> {
        let mut inner = self.write()?;
        let Some(peer) = inner.peers.get_mut(&id) else {
            return Ok(false);
        };
        match flag {
            PeerFlag::Uploading => peer.uploading = value,
            PeerFlag::Downloading => peer.downloading = value,
            PeerFlag::Autoconnect => peer.autoconnect = value,
        }
        Ok(true)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Offers
    // ─────────────────────────────────────────────────────────────────────────

    async fn insert_sent_offer(&self, offer: &SentOffer) -> Result<InsertResult> {
        let mut inner = self.write()?;
        let exists = inner.sent_offers.values().any(|o| {
            o.payment_hash == offer.payment_hash
                || (o.squeak_hash == offer.squeak_hash
                    && o.counterparty == offer.counterparty
                    && !o.is_expired(offer.invoice_timestamp))
        });
        if exists {
            return Ok(InsertResult::AlreadyExists);
        }
        let id = inner.next_id();
        let mut stored = offer.clone();
        stored.id = id;
        inner.sent_offers.insert(id, stored);
        Ok(InsertResult::Inserted { id })
    }

    async fn get_sent_offer(
        &self,
        squeak_hash: &SqueakHash,
        counterparty: &PeerAddress,
    ) -> Result<Option<SentOffer>> {
        let inner = self.read()?;
        Ok(inner
            .sent_offers
            .values()
            .filter(|o| o.squeak_hash == *squeak_hash && o.counterparty == *counterparty)
            .max_by_key(|o| o.id)
            .cloned())
    }

    async fn get_sent_offer_by_payment_hash(
        &self,
        payment_hash: &PaymentHash,
    ) -> Result<Option<SentOffer>> {
        let inner = self.read()?;
        Ok(inner
            .sent_offers
            .values()
            .find(|o| o.payment_hash == *payment_hash)
            .cloned())
    }

    async fn delete_expired_sent_offers(&self, now_secs: i64) -> Result<u64> {
        let mut inner = self.write()?;
        let before = inner.sent_offers.len();
        inner.sent_offers.retain(|_, o| !o.is_expired(now_secs));
        Ok((before - inner.sent_offers.len()) as u64)
    }

    async fn upsert_received_offer(&self, offer: &ReceivedOffer) -> Result<i64> {
        let mut inner = self.write()?;
        let existing = inner
            .received_offers
            .values_mut()
            .find(|o| o.squeak_hash == offer.squeak_hash && o.seller == offer.seller);
        if let Some(existing) = existing {
            if !existing.paid {
                let id = existing.id;
                *existing = ReceivedOffer {
                    id,
                    paid: false,
                    ..offer.clone()
                };
            }
            return Ok(existing.id);
        }
        let id = inner.next_id();
        let mut stored = offer.clone();
        stored.id = id;
        stored.paid = false;
        inner.received_offers.insert(id, stored);
        Ok(id)
    }

    async fn get_received_offer(&self, id: i64) -> Result<Option<ReceivedOffer>> {
        Ok(self.read()?.received_offers.get(&id).cloned())
    }

    async fn list_received_offers(
        &self,
        squeak_hash: Option<&SqueakHash>,
    ) -> Result<Vec<ReceivedOffer>> {
        let inner = self.read()?;
        Ok(inner
            .received_offers
            .values()
            .filter(|o| squeak_hash.map_or(true, |h| o.squeak_hash == *h))
            .cloned()
            .collect())
    }

    async fn mark_received_offer_paid(&self, id: i64) -> Result<bool> {
        let mut inner = self.write()?;
        match inner.received_offers.get_mut(&id) {
            Some(offer) if !offer.paid => {
                offer.paid = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_expired_received_offers(&self, now_secs: i64) -> Result<u64> {
        let mut inner = self.write()?;
        let before = inner.received_offers.len();
        inner
            .received_offers
            .retain(|_, o| o.paid || !o.is_expired(now_secs));
        Ok((before - inner.received_offers.len()) as u64)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Payments
    // ─────────────────────────────────────────────────────────────────────────

    async fn insert_sent_payment(&self, payment: &SentPayment) -> Result<InsertResult> {
        let mut inner = self.write()?;
        if inner
            .sent_payments
            .values()
            .any(|p| p.payment_hash == payment.payment_hash)
        {
            return Ok(InsertResult::AlreadyExists);
        }
        let id = inner.next_id();
        let mut stored = payment.clone();
        stored.id = id;
        inner.sent_payments.insert(id, stored);
        Ok(InsertResult::Inserted { id })
    }

    async fn get_sent_payment(&self, payment_hash: &PaymentHash) -> Result<Option<SentPayment>> {
        let inner = self.read()?;
        Ok(inner
            .sent_payments
            .values()
            .find(|p| p.payment_hash == *payment_hash)
            .cloned())
    }

    async fn set_sent_payment_valid(
        &self,
        payment_hash: &PaymentHash,
        valid: bool,
    ) -> Result<bool> {
        let mut inner = self.write()?;
        match inner
            .sent_payments
            .values_mut()
            .find(|p| p.payment_hash == *payment_hash)
        {
            Some(payment) => {
                payment.valid = valid;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_sent_payments(&self) -> Result<Vec<SentPayment>> {
        Ok(self.read()?.sent_payments.values().cloned().collect())
    }

    async fn insert_received_payment(&self, payment: &ReceivedPayment) -> Result<InsertResult> {
        let mut inner = self.write()?;
        if inner
            .received_payments
            .values()
            .any(|p| p.payment_hash == payment.payment_hash)
        {
            return Ok(InsertResult::AlreadyExists);
        }
        let id = inner.next_id();
        let mut stored = payment.clone();
        stored.id = id;
        inner.received_payments.insert(id, stored);
        Ok(InsertResult::Inserted { id })
    }

    async fn list_received_payments(&self) -> Result<Vec<ReceivedPayment>> {
        let mut payments: Vec<_> = self.read()?.received_payments.values().cloned().collect();
        payments.sort_by_key(|p| p.settle_index);
        Ok(payments)
    }

    async fn latest_settle_index(&self) -> Result<u64> {
        let inner = self.read()?;
        Ok(inner
            .received_payments
            .values()
            .map(|p| p.settle_index)
            .max()
            .unwrap_or(0))
    }

    async fn total_received_msat(&self) -> Result<u64> {
        let inner = self.read()?;
        Ok(inner.received_payments.values().map(|p| p.price_msat).sum())
    }
}
