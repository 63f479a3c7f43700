//! Payment ledger: bookkeeping for received payments.
//!
//! Received payments are recorded only from the payment client's settlement
//! stream. The stream is resumed from the highest stored settle index, so a
//! restart neither skips nor double-counts a settlement, and the unique
//! payment hash absorbs any redelivery.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};

use squeaknode_core::{now_millis, ReceivedPayment, SentPayment};
use squeaknode_store::{InsertResult, Store};

use crate::error::Result;
use crate::lightning::{PaymentClient, SettledInvoice};

/// Ledger settings.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Wait before re-subscribing after the settlement stream fails.
    pub retry_backoff: Duration,
    /// Capacity of the new-payment notification channel.
    pub notification_capacity: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            retry_backoff: Duration::from_secs(10),
            notification_capacity: 64,
        }
    }
}

/// What happened to one settlement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerOutcome {
    /// A new received payment was stored.
    Recorded(ReceivedPayment),
    /// The payment hash was already recorded.
    Duplicate,
    /// The invoice does not belong to any offer of ours.
    Unrelated,
}

/// Records received payments and serves payment listings.
pub struct PaymentLedger<S: Store, P: PaymentClient> {
    store: Arc<S>,
    client: Arc<P>,
    config: LedgerConfig,
    notifications: broadcast::Sender<ReceivedPayment>,
}

impl<S: Store, P: PaymentClient> PaymentLedger<S, P> {
    pub fn new(store: Arc<S>, client: Arc<P>, config: LedgerConfig) -> Self {
        let (notifications, _) = broadcast::channel(config.notification_capacity.max(1));
        Self {
            store,
            client,
            config,
            notifications,
        }
    }

    /// Receive every newly recorded payment.
    pub fn subscribe(&self) -> broadcast::Receiver<ReceivedPayment> {
        self.notifications.subscribe()
    }

    /// Record one settled invoice.
    pub async fn process_settlement(&self, settled: &SettledInvoice) -> Result<LedgerOutcome> {
        let Some(offer) = self
            .store
            .get_sent_offer_by_payment_hash(&settled.payment_hash)
            .await?
        else {
            tracing::debug!(payment_hash = %settled.payment_hash, "settlement for unknown offer");
            return Ok(LedgerOutcome::Unrelated);
        };

        let mut payment = ReceivedPayment {
            id: 0,
            squeak_hash: offer.squeak_hash,
            payment_hash: settled.payment_hash,
            price_msat: offer.price_msat,
            settle_index: settled.settle_index,
            buyer: offer.counterparty,
            created_at: now_millis(),
        };

        match self.store.insert_received_payment(&payment).await? {
            InsertResult::Inserted { id } => {
                payment.id = id;
                tracing::info!(
                    squeak_hash = %payment.squeak_hash,
                    peer = %payment.buyer,
                    price_msat = payment.price_msat,
                    settle_index = payment.settle_index,
                    "received payment"
                );
                let _ = self.notifications.send(payment.clone());
                Ok(LedgerOutcome::Recorded(payment))
            }
            InsertResult::AlreadyExists => {
                tracing::debug!(payment_hash = %settled.payment_hash, "duplicate settlement");
                Ok(LedgerOutcome::Duplicate)
            }
        }
    }

    /// Follow the settlement stream until `shutdown` flips.
    ///
    /// Each (re)subscription starts after the highest stored settle index.
    pub async fn run_settlement_subscription(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            if let Err(e) = self.follow_stream(&mut shutdown).await {
                tracing::warn!(error = %e, "settlement stream failed");
            }
            if *shutdown.borrow() {
                return;
            }
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(self.config.retry_backoff) => {}
            }
        }
    }

    /// Process one subscription until it ends. `Ok` means the stream closed
    /// or shutdown was requested.
    async fn follow_stream(&self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        let mut last_index = self.store.latest_settle_index().await?;
        let mut stream = self.client.subscribe_settlements(last_index).await?;
        tracing::debug!(from_index = last_index, "subscribed to settlements");

        loop {
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                item = stream.recv() => match item {
                    Some(Ok(settled)) => {
                        if settled.settle_index <= last_index {
                            continue;
                        }
                        self.process_settlement(&settled).await?;
                        last_index = settled.settle_index;
                    }
                    Some(Err(e)) => return Err(e),
                    None => {
                        tracing::warn!(last_index, "settlement stream closed");
                        return Ok(());
                    }
                }
            }
        }
    }

    pub async fn total_received(&self) -> Result<u64> {
        Ok(self.store.total_received_msat().await?)
    }

    pub async fn received_payments(&self) -> Result<Vec<ReceivedPayment>> {
        Ok(self.store.list_received_payments().await?)
    }

    pub async fn sent_payments(&self) -> Result<Vec<SentPayment>> {
        Ok(self.store.list_sent_payments().await?)
    }
}
