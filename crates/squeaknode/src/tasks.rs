//! Background tasks of a running node.
//!
//! [`NodeRuntime::start`] binds the peer listener and spawns:
//!
//! - the inbound accept loop
//! - the sync loop (periodic sync, peer greetings)
//! - the settlement subscription
//! - the expired offer sweeper
//! - the oracle poller that publishes the best height
//!
//! All of them stop when [`NodeRuntime::shutdown`] flips the shared watch.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use squeaknode_core::now_secs;
use squeaknode_payments::PaymentClient;
use squeaknode_store::Store;
use squeaknode_sync::{ConnectionManager, PeerMessageHandler};

use crate::handler::NodeMessageHandler;
use crate::node::SqueakNode;
use crate::oracle::BlockchainOracle;

/// Handle on a started node's tasks.
pub struct NodeRuntime {
    local_addr: SocketAddr,
    connections: Arc<ConnectionManager>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeRuntime {
    pub async fn start<S, P, O>(node: &Arc<SqueakNode<S, P, O>>) -> Result<Self>
    where
        S: Store + 'static,
        P: PaymentClient + 'static,
        O: BlockchainOracle + 'static,
    {
        let listen = node.config().listen_address();
        let listener = TcpListener::bind((listen.host.as_str(), listen.port))
            .await
            .with_context(|| format!("binding peer listener on {}", listen))?;
        let local_addr = listener
            .local_addr()
            .context("reading peer listener address")?;

        let height = node
            .refresh_best_height()
            .await
            .context("querying best block height")?;
        tracing::info!(%local_addr, best_height = height, "starting node");

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handler: Arc<dyn PeerMessageHandler> = Arc::new(NodeMessageHandler::new(Arc::clone(node)));
        let connections = Arc::clone(node.connections());
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(Arc::clone(&connections).accept_loop(
            listener,
            Arc::clone(&handler),
            shutdown_rx.clone(),
        )));

        tasks.push(tokio::spawn(
            Arc::clone(node.sync()).run(node.watch_best_height(), shutdown_rx.clone()),
        ));

        {
            let node = Arc::clone(node);
            let shutdown_rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                node.ledger().run_settlement_subscription(shutdown_rx).await;
            }));
        }

        tasks.push(tokio::spawn(sweep_offers(Arc::clone(node), shutdown_rx.clone())));
        tasks.push(tokio::spawn(poll_oracle(Arc::clone(node), shutdown_rx)));

        autoconnect(node, &handler)
            .await
            .context("loading autoconnect peers")?;

        Ok(Self {
            local_addr,
            connections,
            shutdown,
            tasks,
        })
    }

    /// Address the peer listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop every task and close every connection.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "node task ended abnormally");
            }
        }
        self.connections.shutdown();
        tracing::info!(local_addr = %self.local_addr, "node stopped");
    }
}

/// Dial every stored peer marked autoconnect. Failures are logged, not fatal.
async fn autoconnect<S, P, O>(
    node: &Arc<SqueakNode<S, P, O>>,
    handler: &Arc<dyn PeerMessageHandler>,
) -> crate::error::Result<()>
where
    S: Store + 'static,
    P: PaymentClient + 'static,
    O: BlockchainOracle + 'static,
{
    for peer in node.list_peers().await?.into_iter().filter(|p| p.autoconnect) {
        let connections = Arc::clone(node.connections());
        let handler = Arc::clone(handler);
        tokio::spawn(async move {
            match connections.connect(&peer.address, handler).await {
                Ok(_) => tracing::info!(peer = %peer.address, name = %peer.name, "autoconnected"),
                Err(e) => tracing::warn!(peer = %peer.address, error = %e, "autoconnect failed"),
            }
        });
    }
    Ok(())
}

async fn sweep_offers<S, P, O>(node: Arc<SqueakNode<S, P, O>>, mut shutdown: watch::Receiver<bool>)
where
    S: Store + 'static,
    P: PaymentClient + 'static,
    O: BlockchainOracle + 'static,
{
    let mut ticker = tokio::time::interval(node.config().sweep_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = ticker.tick() => {}
        }
        match node.negotiator().sweep_expired_offers(now_secs()).await {
            Ok(report) if report.sent + report.received > 0 => {
                tracing::debug!(sent = report.sent, received = report.received, "swept expired offers");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "offer sweep failed"),
        }
    }
}

async fn poll_oracle<S, P, O>(node: Arc<SqueakNode<S, P, O>>, mut shutdown: watch::Receiver<bool>)
where
    S: Store + 'static,
    P: PaymentClient + 'static,
    O: BlockchainOracle + 'static,
{
    let mut ticker = tokio::time::interval(node.sync().config().sync_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = ticker.tick() => {}
        }
        if let Err(e) = node.refresh_best_height().await {
            tracing::warn!(error = %e, "oracle poll failed");
        }
    }
}
