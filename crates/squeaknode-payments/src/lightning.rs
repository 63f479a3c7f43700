//! Payment client abstraction.
//!
//! The node never talks to a payment channel network directly. It goes
//! through [`PaymentClient`], which a Lightning daemon adapter implements
//! in production and [`memory::MemoryLightningNode`] implements in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use squeaknode_core::{PaymentHash, Preimage};

use crate::error::Result;

/// An invoice created for an offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub payment_request: String,
    pub payment_hash: PaymentHash,
    pub amount_msat: u64,
    /// Creation time (Unix seconds).
    pub timestamp: i64,
    /// Lifetime in seconds.
    pub expiry: i64,
}

/// A settled invoice, as delivered by the settlement stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettledInvoice {
    pub payment_hash: PaymentHash,
    pub amount_msat: u64,
    /// Monotonic per receiving node.
    pub settle_index: u64,
}

/// What a payment request says about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedPaymentRequest {
    pub payment_hash: PaymentHash,
    pub amount_msat: u64,
    pub timestamp: i64,
    pub expiry: i64,
    pub destination: String,
}

/// Interface to a payment channel node.
#[async_trait]
pub trait PaymentClient: Send + Sync {
    /// Create an invoice that settles on `preimage`.
    async fn create_invoice(
        &self,
        preimage: &Preimage,
        amount_msat: u64,
        expiry_secs: i64,
    ) -> Result<Invoice>;

    /// Pay an invoice and return its preimage.
    ///
    /// Blocks until the payment succeeds or fails.
    async fn pay_invoice(&self, payment_request: &str) -> Result<Preimage>;

    /// Decode a payment request without paying it.
    async fn decode_payment_request(&self, payment_request: &str) -> Result<DecodedPaymentRequest>;

    /// Stream settled invoices with `settle_index > from_index`, in order.
    ///
    /// The stream ends (or yields an error) when the connection drops; the
    /// caller re-subscribes.
    async fn subscribe_settlements(
        &self,
        from_index: u64,
    ) -> Result<mpsc::Receiver<Result<SettledInvoice>>>;
}

/// A simple in-memory payment network for testing.
///
/// Every node created from one [`memory::MemoryLightningNetwork`] can pay
/// invoices created by any other node on it.
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::RwLock;

    use squeaknode_core::now_secs;

    use crate::error::PaymentError;

    const PAYMENT_REQUEST_PREFIX: &str = "lnmem1";

    struct InvoiceEntry {
        payee: String,
        preimage: Preimage,
        amount_msat: u64,
        timestamp: i64,
        expiry: i64,
        settled: bool,
    }

    #[derive(Default)]
    struct NodeState {
        settlements: Vec<SettledInvoice>,
        subscribers: Vec<mpsc::Sender<Result<SettledInvoice>>>,
    }

    #[derive(Default)]
    struct NetworkState {
        invoices: HashMap<String, InvoiceEntry>,
        nodes: HashMap<String, NodeState>,
        failing: bool,
    }

    /// Shared state for the memory payment network.
    #[derive(Default)]
    pub struct MemoryLightningNetwork {
        state: RwLock<NetworkState>,
    }

    impl MemoryLightningNetwork {
        /// Create a new memory network.
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Create a node connected to this network.
        pub async fn create_node(self: &Arc<Self>, name: impl Into<String>) -> MemoryLightningNode {
            let name = name.into();
            self.state
                .write()
                .await
                .nodes
                .entry(name.clone())
                .or_default();
            MemoryLightningNode {
                name,
                network: Arc::clone(self),
            }
        }

        /// Make every payment fail until reset.
        pub async fn set_failing(&self, failing: bool) {
            self.state.write().await.failing = failing;
        }

        /// Drop every open settlement stream of `node`.
        pub async fn drop_subscriptions(&self, node: &str) {
            if let Some(node) = self.state.write().await.nodes.get_mut(node) {
                node.subscribers.clear();
            }
        }
    }

    /// In-memory payment client for one node.
    pub struct MemoryLightningNode {
        name: String,
        network: Arc<MemoryLightningNetwork>,
    }

    impl MemoryLightningNode {
        pub fn name(&self) -> &str {
            &self.name
        }
    }

    fn payment_request_for(hash: &PaymentHash) -> String {
        format!("{}{}", PAYMENT_REQUEST_PREFIX, hash.to_hex())
    }

    #[async_trait]
    impl PaymentClient for MemoryLightningNode {
        async fn create_invoice(
            &self,
            preimage: &Preimage,
            amount_msat: u64,
            expiry_secs: i64,
        ) -> Result<Invoice> {
            let payment_hash = preimage.payment_hash();
            let payment_request = payment_request_for(&payment_hash);
            let timestamp = now_secs();

            let mut state = self.network.state.write().await;
            if state.invoices.contains_key(&payment_request) {
                return Err(PaymentError::Client("duplicate invoice".into()));
            }
            state.invoices.insert(
                payment_request.clone(),
                InvoiceEntry {
                    payee: self.name.clone(),
                    preimage: *preimage,
                    amount_msat,
                    timestamp,
                    expiry: expiry_secs,
                    settled: false,
                },
            );

            Ok(Invoice {
                payment_request,
                payment_hash,
                amount_msat,
                timestamp,
                expiry: expiry_secs,
            })
        }

        async fn pay_invoice(&self, payment_request: &str) -> Result<Preimage> {
            let mut state = self.network.state.write().await;
            if state.failing {
                return Err(PaymentError::PaymentFailed("no route".into()));
            }

            let entry = state
                .invoices
                .get_mut(payment_request)
                .ok_or_else(|| PaymentError::PaymentFailed("unknown invoice".into()))?;
            if entry.settled {
                return Err(PaymentError::PaymentFailed("invoice already paid".into()));
            }
            if now_secs() > entry.timestamp.saturating_add(entry.expiry) {
                return Err(PaymentError::PaymentFailed("invoice expired".into()));
            }
            entry.settled = true;

            let preimage = entry.preimage;
            let payee = entry.payee.clone();
            let amount_msat = entry.amount_msat;

            let node = state.nodes.entry(payee).or_default();
            let settled = SettledInvoice {
                payment_hash: preimage.payment_hash(),
                amount_msat,
                settle_index: node.settlements.len() as u64 + 1,
            };
            node.settlements.push(settled.clone());
            node.subscribers
                .retain(|tx| tx.try_send(Ok(settled.clone())).is_ok());

            Ok(preimage)
        }

        async fn decode_payment_request(
            &self,
            payment_request: &str,
        ) -> Result<DecodedPaymentRequest> {
            let state = self.network.state.read().await;
            let entry = state
                .invoices
                .get(payment_request)
                .ok_or_else(|| PaymentError::Client("undecodable payment request".into()))?;
            Ok(DecodedPaymentRequest {
                payment_hash: entry.preimage.payment_hash(),
                amount_msat: entry.amount_msat,
                timestamp: entry.timestamp,
                expiry: entry.expiry,
                destination: entry.payee.clone(),
            })
        }

        async fn subscribe_settlements(
            &self,
            from_index: u64,
        ) -> Result<mpsc::Receiver<Result<SettledInvoice>>> {
            let mut state = self.network.state.write().await;
            let node = state.nodes.entry(self.name.clone()).or_default();

            let backlog: Vec<_> = node
                .settlements
                .iter()
                .filter(|s| s.settle_index > from_index)
                .cloned()
                .collect();
            let (tx, rx) = mpsc::channel(backlog.len() + 64);
            for settled in backlog {
                tx.try_send(Ok(settled))
                    .map_err(|e| PaymentError::Client(e.to_string()))?;
            }
            node.subscribers.push(tx);
            Ok(rx)
        }
    }
}
