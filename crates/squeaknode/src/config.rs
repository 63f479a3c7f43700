//! Node configuration.
//!
//! Every field has a default, so a partial JSON document (or none at all)
//! yields a usable config. Loading the document from disk is the embedding
//! binary's job.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use squeaknode_core::PeerAddress;
use squeaknode_payments::{LedgerConfig, OfferConfig};
use squeaknode_sync::{ConnectionConfig, SyncConfig};

/// Top-level node configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node: NodeSection,
    pub offers: OffersSection,
    pub sync: SyncSection,
    pub payments: PaymentsSection,
}

/// Ingestion and pricing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Price asked for every squeak key.
    pub price_msat: u64,
    /// Hard cap on stored squeaks.
    pub max_squeaks: u64,
    /// Squeaks accepted per author anchored at one block height.
    pub max_squeaks_per_author_per_block: u64,
    /// Only accept squeaks from whitelisted profiles.
    pub whitelist_enforced: bool,
    /// Sell keys to peers.
    pub sharing_enabled: bool,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            price_msat: 1000,
            max_squeaks: 10_000,
            max_squeaks_per_author_per_block: 100,
            whitelist_enforced: false,
            sharing_enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OffersSection {
    pub invoice_expiry_secs: i64,
    /// Sent offers are kept this long past invoice expiry.
    pub sent_offer_retention_secs: i64,
    pub sweep_interval_secs: u64,
}

impl Default for OffersSection {
    fn default() -> Self {
        Self {
            invoice_expiry_secs: 3600,
            sent_offer_retention_secs: 86_400,
            sweep_interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    pub listen_host: String,
    pub listen_port: u16,
    /// Host advertised to peers and buyers; `listen_host` if unset.
    pub external_host: Option<String>,
    pub sync_interval_secs: u64,
    pub block_range: u64,
    pub download_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    pub max_peers: usize,
    pub user_agent: String,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 8555,
            external_host: None,
            sync_interval_secs: 10,
            block_range: 2016,
            download_timeout_secs: 10,
            handshake_timeout_secs: 30,
            max_peers: 10,
            user_agent: concat!("squeaknode/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaymentsSection {
    pub settlement_retry_secs: u64,
}

impl Default for PaymentsSection {
    fn default() -> Self {
        Self {
            settlement_retry_secs: 10,
        }
    }
}

impl NodeConfig {
    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn listen_address(&self) -> PeerAddress {
        PeerAddress::new(self.sync.listen_host.clone(), self.sync.listen_port)
    }

    /// Where peers and buyers should reach us.
    pub fn external_address(&self) -> PeerAddress {
        let host = self
            .sync
            .external_host
            .clone()
            .unwrap_or_else(|| self.sync.listen_host.clone());
        PeerAddress::new(host, self.sync.listen_port)
    }

    pub fn offer_config(&self) -> OfferConfig {
        OfferConfig {
            price_msat: self.node.price_msat,
            invoice_expiry_secs: self.offers.invoice_expiry_secs,
            sent_offer_retention_secs: self.offers.sent_offer_retention_secs,
            seller_address: self.external_address(),
        }
    }

    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            retry_backoff: Duration::from_secs(self.payments.settlement_retry_secs),
            ..LedgerConfig::default()
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            block_range: self.sync.block_range,
            download_timeout: Duration::from_secs(self.sync.download_timeout_secs),
            sync_interval: Duration::from_secs(self.sync.sync_interval_secs),
        }
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            handshake_timeout: Duration::from_secs(self.sync.handshake_timeout_secs),
            max_peers: self.sync.max_peers,
            user_agent: self.sync.user_agent.clone(),
            listen_address: Some(self.external_address()),
            ..ConnectionConfig::default()
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.offers.sweep_interval_secs)
    }
}
