//! Serving and consuming peer messages.

use std::sync::Arc;

use async_trait::async_trait;

use squeaknode_core::{OfferPacket, SealedBox, Squeak, SqueakHash};
use squeaknode_payments::{PaymentClient, PaymentError};
use squeaknode_store::{Store, StoreExt};
use squeaknode_sync::messages::limits::MAX_HASHES;
use squeaknode_sync::{Message, PeerHandle, PeerMessageHandler, SyncError};

use crate::error::{NodeError, Result};
use crate::ingest::IngestOutcome;
use crate::node::SqueakNode;
use crate::oracle::BlockchainOracle;

/// Routes peer messages into a [`SqueakNode`].
pub struct NodeMessageHandler<S: Store, P: PaymentClient, O: BlockchainOracle> {
    node: Arc<SqueakNode<S, P, O>>,
}

impl<S, P, O> NodeMessageHandler<S, P, O>
where
    S: Store + 'static,
    P: PaymentClient + 'static,
    O: BlockchainOracle + 'static,
{
    pub fn new(node: Arc<SqueakNode<S, P, O>>) -> Self {
        Self { node }
    }

    async fn dispatch(&self, peer: &PeerHandle, message: Message) -> Result<()> {
        match message {
            Message::GetSqueaks { interests } => {
                if !self.node.is_uploading_to(peer.address()).await? {
                    return Ok(());
                }
                let mut hashes = self.node.store().lookup_squeaks_any(&interests).await?;
                hashes.truncate(MAX_HASHES);
                if !hashes.is_empty() {
                    peer.send(Message::Inv { hashes }).await?;
                }
            }
            Message::Subscribe { interests } => {
                if self.node.is_uploading_to(peer.address()).await? {
                    self.node.sync().set_remote_interests(peer.address(), interests);
                }
            }
            Message::Inv { hashes } => {
                self.node.sync().handle_inventory(peer, hashes).await?;
            }
            Message::GetData { hashes } => self.serve_squeaks(peer, hashes).await?,
            Message::Squeak(squeak) => self.receive_squeak(peer, *squeak).await?,
            Message::NotFound { hashes } => {
                for hash in &hashes {
                    self.node.sync().clear_offer_request(hash, peer.address());
                }
            }
            Message::GetOffer { hash, challenge } => self.serve_offer(peer, hash, challenge).await?,
            Message::Offer(packet) => self.receive_offer(peer, *packet).await?,
            other => {
                tracing::debug!(peer = %peer.address(), kind = other.kind(), "ignored message");
            }
        }
        Ok(())
    }

    async fn serve_squeaks(&self, peer: &PeerHandle, hashes: Vec<SqueakHash>) -> Result<()> {
        if !self.node.is_uploading_to(peer.address()).await? {
            return Ok(peer.send(Message::NotFound { hashes }).await?);
        }
        let mut missing = Vec::new();
        for hash in hashes {
            match self.node.get_squeak(&hash).await? {
                Some(squeak) => peer.send(Message::Squeak(Box::new(squeak))).await?,
                None => missing.push(hash),
            }
        }
        if !missing.is_empty() {
            peer.send(Message::NotFound { hashes: missing }).await?;
        }
        Ok(())
    }

    async fn receive_squeak(&self, peer: &PeerHandle, squeak: Squeak) -> Result<()> {
        let hash = squeak.compute_hash();
        if !self.is_wanted(&squeak).await? {
            tracing::debug!(squeak_hash = %hash, peer = %peer.address(), "unrequested squeak dropped");
            return Ok(());
        }

        // A download for this exact hash asks for offers once it completes.
        let fetched = self.node.sync().downloads().is_fetching(&hash);

        let outcome = self.node.post_squeak(&squeak).await?;
        if matches!(outcome, IngestOutcome::Rejected(_)) {
            return Ok(());
        }
        // Stored now, so a completed download can read it back.
        self.node.sync().downloads().process_squeak(&squeak);

        if outcome.is_accepted() && !fetched {
            self.node.sync().request_offer(peer, &squeak)?;
        }
        Ok(())
    }

    /// A squeak is wanted if a download waits for it or it matches our
    /// interests.
    async fn is_wanted(&self, squeak: &Squeak) -> Result<bool> {
        if self.node.sync().downloads().wants_squeak(squeak) {
            return Ok(true);
        }
        let interests = self.node.sync().interests(self.node.best_height()).await?;
        Ok(interests.iter().any(|interest| interest.matches(squeak)))
    }

    async fn serve_offer(&self, peer: &PeerHandle, hash: SqueakHash, challenge: SealedBox) -> Result<()> {
        let offer = if self.node.is_uploading_to(peer.address()).await? {
            // Any failure still answers, so the buyer is not left waiting.
            match self.node.buy_squeak(&hash, &challenge, peer.address()).await {
                Ok(offer) => offer,
                Err(e) => {
                    tracing::warn!(squeak_hash = %hash, peer = %peer.address(), error = %e, "offer not created");
                    None
                }
            }
        } else {
            None
        };
        match offer {
            Some(packet) => {
                tracing::debug!(squeak_hash = %hash, peer = %peer.address(), "sent offer");
                peer.send(Message::Offer(Box::new(packet))).await?;
            }
            None => peer.send(Message::NotFound { hashes: vec![hash] }).await?,
        }
        Ok(())
    }

    async fn receive_offer(&self, peer: &PeerHandle, packet: OfferPacket) -> Result<()> {
        let hash = packet.squeak_hash;
        let Some(proof) = self.node.sync().take_offer_proof(&hash, peer.address()) else {
            tracing::debug!(squeak_hash = %hash, peer = %peer.address(), "unrequested offer dropped");
            return Ok(());
        };

        match self.node.negotiator().accept_offer(&packet, &proof, peer.address()).await {
            Ok(offer) => {
                tracing::info!(
                    squeak_hash = %hash,
                    peer = %peer.address(),
                    offer_id = offer.id,
                    price_msat = offer.price_msat,
                    "received offer"
                );
                self.node.sync().downloads().process_offer(&hash, peer.address());
                Ok(())
            }
            Err(PaymentError::ProofMismatch(_)) => Err(SyncError::InvalidMessage(format!(
                "offer for {} failed its proof",
                hash
            ))
            .into()),
            Err(e) => {
                tracing::warn!(squeak_hash = %hash, peer = %peer.address(), error = %e, "offer refused");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl<S, P, O> PeerMessageHandler for NodeMessageHandler<S, P, O>
where
    S: Store + 'static,
    P: PaymentClient + 'static,
    O: BlockchainOracle + 'static,
{
    async fn handle_message(&self, peer: &PeerHandle, message: Message) -> squeaknode_sync::Result<()> {
        let kind = message.kind();
        match self.dispatch(peer, message).await {
            Ok(()) => Ok(()),
            Err(NodeError::Sync(e)) => Err(e),
            Err(e) => {
                tracing::warn!(peer = %peer.address(), kind, error = %e, "failed to handle message");
                Ok(())
            }
        }
    }
}
