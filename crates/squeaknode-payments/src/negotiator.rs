//! Offer negotiation: selling and buying decryption keys.
//!
//! Seller side: [`OfferNegotiator::create_offer`] answers a buy request with
//! an offer whose encrypted key only opens with the invoice preimage.
//!
//! Buyer side: [`OfferNegotiator::create_challenge`] before asking,
//! [`OfferNegotiator::accept_offer`] when an offer arrives, and
//! [`OfferNegotiator::pay_offer`] to pay and unlock.

use std::sync::Arc;

use squeaknode_core::{
    now_millis, now_secs, EncryptionNonce, OfferPacket, PeerAddress, Preimage, Proof,
    ReceivedOffer, SealedBox, SentOffer, SentPayment, Squeak, SqueakHash,
};
use squeaknode_store::{InsertResult, Store};

use crate::crypto;
use crate::error::{PaymentError, Result};
use crate::lightning::PaymentClient;

/// Seller-side offer settings.
#[derive(Debug, Clone)]
pub struct OfferConfig {
    /// Price of every squeak.
    pub price_msat: u64,
    /// Invoice lifetime in seconds.
    pub invoice_expiry_secs: i64,
    /// How long a sent offer outlives its invoice before it is swept, so a
    /// settlement delivered late still finds it.
    pub sent_offer_retention_secs: i64,
    /// Address advertised to buyers in offers.
    pub seller_address: PeerAddress,
}

impl Default for OfferConfig {
    fn default() -> Self {
        Self {
            price_msat: 1000,
            invoice_expiry_secs: 3600,
            sent_offer_retention_secs: 86_400,
            seller_address: PeerAddress::new("127.0.0.1", 8555),
        }
    }
}

/// Rows removed by one expiry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub sent: u64,
    pub received: u64,
}

/// Creates, accepts and pays offers.
pub struct OfferNegotiator<S: Store, P: PaymentClient> {
    store: Arc<S>,
    client: Arc<P>,
    config: OfferConfig,
}

impl<S: Store, P: PaymentClient> OfferNegotiator<S, P> {
    pub fn new(store: Arc<S>, client: Arc<P>, config: OfferConfig) -> Self {
        Self {
            store,
            client,
            config,
        }
    }

    pub fn config(&self) -> &OfferConfig {
        &self.config
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Seller
    // ─────────────────────────────────────────────────────────────────────────

    /// Answer a buy request for `squeak_hash` from `counterparty`.
    ///
    /// Returns `None` if the squeak is unknown or locked here. A live offer
    /// for the same counterparty is reused; an expired one is left for the
    /// sweeper and a fresh offer is issued. The proof always answers the
    /// current challenge.
    pub async fn create_offer(
        &self,
        squeak_hash: &SqueakHash,
        challenge: &SealedBox,
        counterparty: &PeerAddress,
    ) -> Result<Option<OfferPacket>> {
        let Some(squeak) = self.store.get_squeak(squeak_hash).await? else {
            return Ok(None);
        };
        let Some(key) = squeak.decryption_key.as_ref() else {
            tracing::debug!(squeak_hash = %squeak_hash, "no key to sell");
            return Ok(None);
        };

        let proof = crypto::solve_challenge(challenge, key)?;

        let offer = match self.store.get_sent_offer(squeak_hash, counterparty).await? {
            Some(existing) if !existing.is_expired(now_secs()) => existing,
            _ => self.issue_offer(&squeak, counterparty).await?,
        };

        Ok(Some(OfferPacket {
            squeak_hash: offer.squeak_hash,
            nonce: offer.nonce,
            encrypted_decryption_key: offer.encrypted_decryption_key,
            proof,
            payment_request: offer.payment_request,
            price_msat: offer.price_msat,
            invoice_timestamp: offer.invoice_timestamp,
            invoice_expiry: offer.invoice_expiry,
            seller: self.config.seller_address.clone(),
        }))
    }

    async fn issue_offer(&self, squeak: &Squeak, counterparty: &PeerAddress) -> Result<SentOffer> {
        let squeak_hash = squeak.compute_hash();
        let key = squeak
            .decryption_key
            .as_ref()
            .ok_or(PaymentError::MissingDecryptionKey(squeak_hash))?;

        let preimage = Preimage::generate();
        let nonce = EncryptionNonce::generate();
        let encrypted_decryption_key = crypto::encrypt_decryption_key(key, &preimage, &nonce)?;
        let invoice = self
            .client
            .create_invoice(&preimage, self.config.price_msat, self.config.invoice_expiry_secs)
            .await?;

        let mut offer = SentOffer {
            id: 0,
            squeak_hash,
            payment_hash: invoice.payment_hash,
            nonce,
            encrypted_decryption_key,
            price_msat: invoice.amount_msat,
            payment_request: invoice.payment_request,
            invoice_timestamp: invoice.timestamp,
            invoice_expiry: invoice.expiry,
            counterparty: counterparty.clone(),
        };

        match self.store.insert_sent_offer(&offer).await? {
            InsertResult::Inserted { id } => {
                offer.id = id;
                tracing::info!(
                    squeak_hash = %squeak_hash,
                    peer = %counterparty,
                    price_msat = offer.price_msat,
                    "created offer"
                );
                Ok(offer)
            }
            // A concurrent request for the same pair won.
            InsertResult::AlreadyExists => self
                .store
                .get_sent_offer(&squeak_hash, counterparty)
                .await?
                .ok_or(PaymentError::SqueakNotFound(squeak_hash)),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Buyer
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a challenge for a locally held squeak.
    ///
    /// Send the challenge with the buy request and keep the proof for
    /// [`accept_offer`](Self::accept_offer).
    pub fn create_challenge(&self, squeak: &Squeak) -> Result<(SealedBox, Proof)> {
        Ok(crypto::create_challenge(&squeak.header.encryption_key)?)
    }

    /// Check and store an offer received from `seller`.
    pub async fn accept_offer(
        &self,
        packet: &OfferPacket,
        expected_proof: &Proof,
        seller: &PeerAddress,
    ) -> Result<ReceivedOffer> {
        let squeak_hash = packet.squeak_hash;
        if packet.proof != *expected_proof {
            tracing::warn!(squeak_hash = %squeak_hash, peer = %seller, "offer proof mismatch");
            return Err(PaymentError::ProofMismatch(squeak_hash));
        }
        if !self.store.has_squeak(&squeak_hash).await? {
            return Err(PaymentError::SqueakNotFound(squeak_hash));
        }

        let decoded = self
            .client
            .decode_payment_request(&packet.payment_request)
            .await?;
        if decoded.amount_msat != packet.price_msat {
            return Err(PaymentError::InvalidOffer(format!(
                "price {} does not match invoice amount {}",
                packet.price_msat, decoded.amount_msat
            )));
        }

        let offer = ReceivedOffer {
            id: 0,
            squeak_hash,
            payment_hash: decoded.payment_hash,
            nonce: packet.nonce,
            encrypted_decryption_key: packet.encrypted_decryption_key.clone(),
            price_msat: decoded.amount_msat,
            payment_request: packet.payment_request.clone(),
            invoice_timestamp: decoded.timestamp,
            invoice_expiry: decoded.expiry,
            seller: seller.clone(),
            proof: packet.proof,
            paid: false,
        };
        if offer.is_expired(now_secs()) {
            return Err(PaymentError::OfferExpired(squeak_hash));
        }

        let id = self.store.upsert_received_offer(&offer).await?;
        tracing::debug!(squeak_hash = %squeak_hash, peer = %seller, offer_id = id, "accepted offer");
        self.store
            .get_received_offer(id)
            .await?
            .ok_or(PaymentError::OfferNotFound(id))
    }

    /// Pay a received offer and unlock its squeak.
    ///
    /// The sent payment is recorded as soon as the payment client reports
    /// success. If the revealed key does not open the content the payment
    /// is marked invalid and `IntegrityFailure` is returned.
    pub async fn pay_offer(&self, offer_id: i64) -> Result<SentPayment> {
        let offer = self
            .store
            .get_received_offer(offer_id)
            .await?
            .ok_or(PaymentError::OfferNotFound(offer_id))?;
        if offer.paid || self.store.get_sent_payment(&offer.payment_hash).await?.is_some() {
            return Err(PaymentError::AlreadyPaid(offer_id));
        }
        if offer.is_expired(now_secs()) {
            return Err(PaymentError::OfferExpired(offer.squeak_hash));
        }
        let squeak = self
            .store
            .get_squeak(&offer.squeak_hash)
            .await?
            .ok_or(PaymentError::SqueakNotFound(offer.squeak_hash))?;

        let preimage = self.client.pay_invoice(&offer.payment_request).await?;

        let mut payment = SentPayment {
            id: 0,
            squeak_hash: offer.squeak_hash,
            payment_hash: offer.payment_hash,
            preimage,
            price_msat: offer.price_msat,
            seller: offer.seller.clone(),
            created_at: now_millis(),
            valid: true,
        };
        if let InsertResult::Inserted { id } = self.store.insert_sent_payment(&payment).await? {
            payment.id = id;
        }
        self.store.mark_received_offer_paid(offer_id).await?;
        tracing::info!(
            squeak_hash = %offer.squeak_hash,
            peer = %offer.seller,
            price_msat = offer.price_msat,
            "paid offer"
        );

        let unlocked = (preimage.payment_hash() == offer.payment_hash)
            .then(|| {
                crypto::decrypt_decryption_key(
                    &offer.encrypted_decryption_key,
                    &preimage,
                    &offer.nonce,
                )
                .ok()
            })
            .flatten()
            .and_then(|key| squeak.unlock(key).ok());

        let Some(unlocked) = unlocked else {
            self.store
                .set_sent_payment_valid(&offer.payment_hash, false)
                .await?;
            payment.valid = false;
            tracing::error!(
                squeak_hash = %offer.squeak_hash,
                payment_hash = %offer.payment_hash,
                peer = %offer.seller,
                "paid offer did not unlock squeak"
            );
            return Err(PaymentError::IntegrityFailure {
                squeak_hash: offer.squeak_hash,
                payment_hash: offer.payment_hash,
            });
        };

        if let Some(key) = unlocked.decryption_key.as_ref() {
            self.store.set_decryption_key(&offer.squeak_hash, key).await?;
        }
        Ok(payment)
    }

    /// Delete expired offers.
    ///
    /// Unpaid received offers go as soon as their invoice expires. Sent
    /// offers stay for `sent_offer_retention_secs` past expiry.
    pub async fn sweep_expired_offers(&self, now_secs: i64) -> Result<SweepReport> {
        let sent_cutoff = now_secs.saturating_sub(self.config.sent_offer_retention_secs.max(0));
        let report = SweepReport {
            sent: self.store.delete_expired_sent_offers(sent_cutoff).await?,
            received: self.store.delete_expired_received_offers(now_secs).await?,
        };
        if report.sent + report.received > 0 {
            tracing::debug!(sent = report.sent, received = report.received, "swept expired offers");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lightning::memory::{MemoryLightningNetwork, MemoryLightningNode};
    use squeaknode_core::{BlockHash, DecryptionKey, Keypair, SqueakBuilder};
    use squeaknode_store::MemoryStore;

    struct Market {
        network: Arc<MemoryLightningNetwork>,
        seller: OfferNegotiator<MemoryStore, MemoryLightningNode>,
        seller_store: Arc<MemoryStore>,
        seller_client: Arc<MemoryLightningNode>,
        buyer: OfferNegotiator<MemoryStore, MemoryLightningNode>,
        buyer_store: Arc<MemoryStore>,
        squeak: Squeak,
    }

    fn buyer_address() -> PeerAddress {
        PeerAddress::new("buyer", 1)
    }

    fn seller_address() -> PeerAddress {
        PeerAddress::new("seller", 2)
    }

    async fn market() -> Market {
        let network = MemoryLightningNetwork::new();
        let seller_store = Arc::new(MemoryStore::new());
        let buyer_store = Arc::new(MemoryStore::new());

        let squeak = SqueakBuilder::new(100, BlockHash::from_bytes([1; 32]))
            .content("hello")
            .sign(&Keypair::generate())
            .unwrap();
        seller_store.insert_squeak(&squeak).await.unwrap();
        buyer_store.insert_squeak(&squeak.locked()).await.unwrap();

        let config = OfferConfig {
            seller_address: seller_address(),
            ..OfferConfig::default()
        };
        let seller_client = Arc::new(network.create_node("seller").await);
        let seller = OfferNegotiator::new(seller_store.clone(), seller_client.clone(), config.clone());
        let buyer = OfferNegotiator::new(
            buyer_store.clone(),
            Arc::new(network.create_node("buyer").await),
            config,
        );
        Market {
            network,
            seller,
            seller_store,
            seller_client,
            buyer,
            buyer_store,
            squeak,
        }
    }

    #[tokio::test]
    async fn test_buy_unlocks_squeak() {
        let m = market().await;
        let hash = m.squeak.compute_hash();

        let (challenge, proof) = m.buyer.create_challenge(&m.squeak.locked()).unwrap();
        let packet = m
            .seller
            .create_offer(&hash, &challenge, &buyer_address())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet.proof, proof);
        assert_eq!(packet.seller, seller_address());

        let offer = m
            .buyer
            .accept_offer(&packet, &proof, &seller_address())
            .await
            .unwrap();
        let payment = m.buyer.pay_offer(offer.id).await.unwrap();
        assert!(payment.valid);
        assert_eq!(payment.price_msat, 1000);

        let unlocked = m.buyer_store.get_squeak(&hash).await.unwrap().unwrap();
        assert_eq!(unlocked.decrypt_content().unwrap(), "hello");
        assert!(matches!(
            m.buyer.pay_offer(offer.id).await,
            Err(PaymentError::AlreadyPaid(_))
        ));
    }

    #[tokio::test]
    async fn test_offer_reused_per_counterparty() {
        let m = market().await;
        let hash = m.squeak.compute_hash();

        let (c1, p1) = m.buyer.create_challenge(&m.squeak).unwrap();
        let (c2, p2) = m.buyer.create_challenge(&m.squeak).unwrap();
        let first = m
            .seller
            .create_offer(&hash, &c1, &buyer_address())
            .await
            .unwrap()
            .unwrap();
        let second = m
            .seller
            .create_offer(&hash, &c2, &buyer_address())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(first.payment_request, second.payment_request);
        assert_eq!(first.proof, p1);
        assert_eq!(second.proof, p2);

        let other = m
            .seller
            .create_offer(&hash, &c1, &PeerAddress::new("other", 3))
            .await
            .unwrap()
            .unwrap();
        assert_ne!(other.payment_request, first.payment_request);
    }

    #[tokio::test]
    async fn test_unknown_or_locked_squeak_has_no_offer() {
        let m = market().await;
        let (challenge, _) = m.buyer.create_challenge(&m.squeak).unwrap();

        let unknown = m
            .seller
            .create_offer(&SqueakHash::from_bytes([9; 32]), &challenge, &buyer_address())
            .await
            .unwrap();
        assert!(unknown.is_none());

        // The buyer only holds the locked copy.
        let locked = m
            .buyer
            .create_offer(&m.squeak.compute_hash(), &challenge, &seller_address())
            .await
            .unwrap();
        assert!(locked.is_none());
    }

    #[tokio::test]
    async fn test_proof_mismatch_is_not_stored() {
        let m = market().await;
        let hash = m.squeak.compute_hash();
        let (challenge, _) = m.buyer.create_challenge(&m.squeak).unwrap();
        let packet = m
            .seller
            .create_offer(&hash, &challenge, &buyer_address())
            .await
            .unwrap()
            .unwrap();

        let result = m
            .buyer
            .accept_offer(&packet, &Proof::generate(), &seller_address())
            .await;
        assert!(matches!(result, Err(PaymentError::ProofMismatch(_))));
        assert!(m.buyer_store.list_received_offers(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_payment_failure_leaves_offer_payable() {
        let m = market().await;
        let hash = m.squeak.compute_hash();
        let (challenge, proof) = m.buyer.create_challenge(&m.squeak).unwrap();
        let packet = m
            .seller
            .create_offer(&hash, &challenge, &buyer_address())
            .await
            .unwrap()
            .unwrap();
        let offer = m
            .buyer
            .accept_offer(&packet, &proof, &seller_address())
            .await
            .unwrap();

        m.network.set_failing(true).await;
        assert!(matches!(
            m.buyer.pay_offer(offer.id).await,
            Err(PaymentError::PaymentFailed(_))
        ));
        assert!(!m.buyer_store.get_received_offer(offer.id).await.unwrap().unwrap().paid);

        m.network.set_failing(false).await;
        assert!(m.buyer.pay_offer(offer.id).await.unwrap().valid);
    }

    #[tokio::test]
    async fn test_integrity_failure_marks_payment_invalid() {
        let m = market().await;
        let hash = m.squeak.compute_hash();

        // A seller that encrypts the wrong key under a real invoice.
        let preimage = Preimage::generate();
        let nonce = EncryptionNonce::generate();
        let wrong_key = DecryptionKey::generate();
        let seller_client = m.network.create_node("cheater").await;
        let invoice = seller_client
            .create_invoice(&preimage, 1000, 3600)
            .await
            .unwrap();
        let (_, proof) = m.buyer.create_challenge(&m.squeak).unwrap();
        let packet = OfferPacket {
            squeak_hash: hash,
            nonce,
            encrypted_decryption_key: crypto::encrypt_decryption_key(&wrong_key, &preimage, &nonce)
                .unwrap(),
            proof,
            payment_request: invoice.payment_request,
            price_msat: 1000,
            invoice_timestamp: invoice.timestamp,
            invoice_expiry: invoice.expiry,
            seller: PeerAddress::new("cheater", 4),
        };

        let offer = m
            .buyer
            .accept_offer(&packet, &proof, &PeerAddress::new("cheater", 4))
            .await
            .unwrap();
        let result = m.buyer.pay_offer(offer.id).await;
        assert!(matches!(result, Err(PaymentError::IntegrityFailure { .. })));

        let payment = m
            .buyer_store
            .get_sent_payment(&invoice.payment_hash)
            .await
            .unwrap()
            .unwrap();
        assert!(!payment.valid);
        assert!(!m.buyer_store.get_squeak(&hash).await.unwrap().unwrap().is_unlocked());
    }

    #[tokio::test]
    async fn test_sweep_expired_offers() {
        let m = market().await;
        let hash = m.squeak.compute_hash();
        let (challenge, proof) = m.buyer.create_challenge(&m.squeak).unwrap();
        let packet = m
            .seller
            .create_offer(&hash, &challenge, &buyer_address())
            .await
            .unwrap()
            .unwrap();
        m.buyer
            .accept_offer(&packet, &proof, &seller_address())
            .await
            .unwrap();

        let now = now_secs();
        assert_eq!(m.seller.sweep_expired_offers(now).await.unwrap(), SweepReport::default());

        let later = now + 3600 + 10;
        assert_eq!(
            m.seller.sweep_expired_offers(later).await.unwrap(),
            SweepReport::default()
        );
        assert_eq!(
            m.buyer.sweep_expired_offers(later).await.unwrap(),
            SweepReport { sent: 0, received: 1 }
        );

        let retained = later + m.seller.config().sent_offer_retention_secs;
        assert_eq!(
            m.seller.sweep_expired_offers(retained).await.unwrap(),
            SweepReport { sent: 1, received: 0 }
        );
        assert!(m
            .seller_store
            .get_sent_offer(&hash, &buyer_address())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_settlement_after_expiry_sweep_is_recorded() {
        let m = market().await;
        let hash = m.squeak.compute_hash();
        let (challenge, proof) = m.buyer.create_challenge(&m.squeak.locked()).unwrap();
        let packet = m
            .seller
            .create_offer(&hash, &challenge, &buyer_address())
            .await
            .unwrap()
            .unwrap();
        let offer = m
            .buyer
            .accept_offer(&packet, &proof, &seller_address())
            .await
            .unwrap();
        m.buyer.pay_offer(offer.id).await.unwrap();

        // The settlement stream was down while the invoice expired.
        let swept = m
            .seller
            .sweep_expired_offers(now_secs() + 7200)
            .await
            .unwrap();
        assert_eq!(swept.sent, 0);

        let ledger = crate::PaymentLedger::new(
            m.seller_store.clone(),
            m.seller_client.clone(),
            crate::LedgerConfig::default(),
        );
        let from = m.seller_store.latest_settle_index().await.unwrap();
        let mut stream = m.seller_client.subscribe_settlements(from).await.unwrap();
        let settled = stream.recv().await.unwrap().unwrap();

        match ledger.process_settlement(&settled).await.unwrap() {
            crate::LedgerOutcome::Recorded(payment) => {
                assert_eq!(payment.squeak_hash, hash);
                assert_eq!(payment.buyer, buyer_address());
            }
            other => panic!("settlement not recorded: {:?}", other),
        }
        assert_eq!(ledger.total_received().await.unwrap(), 1000);
    }
}
