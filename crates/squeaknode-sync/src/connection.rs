//! A single peer connection: handshake, reader and writer tasks.
//!
//! ```text
//! Outbound                            Inbound
//!   |-------- Version ---------------->|
//!   |<------- Version -----------------|
//!   |<------- Verack ------------------|
//!   |-------- Verack ----------------->|
//! ```
//!
//! A connection is live once both sides have seen the other's version and a
//! verack. After that a writer task drains the peer's send queue in order
//! and a reader task answers pings and hands every other message to the
//! [`PeerMessageHandler`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Notify};

use squeaknode_core::PeerAddress;

use crate::error::{Result, SyncError};
use crate::manager::ConnectionManager;
use crate::messages::{Message, VersionInfo, PROTOCOL_VERSION};
use crate::wire::{read_message, write_message};

/// Receives every non-handshake, non-ping message from live peers.
#[async_trait]
pub trait PeerMessageHandler: Send + Sync {
    /// Handle one message. Messages from a peer arrive in order.
    ///
    /// Returning `InvalidMessage` disconnects the peer; other errors are
    /// logged and the connection stays up.
    async fn handle_message(&self, peer: &PeerHandle, message: Message) -> Result<()>;
}

/// What we learned about a peer during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// The registry key: the dialed address for outbound connections, the
    /// socket's remote address for inbound ones.
    pub address: PeerAddress,
    pub outbound: bool,
    pub version: VersionInfo,
}

/// A cloneable handle to a live peer.
#[derive(Clone)]
pub struct PeerHandle {
    info: Arc<PeerInfo>,
    tx: mpsc::Sender<Message>,
    closed: Arc<Notify>,
}

impl PeerHandle {
    pub fn address(&self) -> &PeerAddress {
        &self.info.address
    }

    pub fn nonce(&self) -> u64 {
        self.info.version.nonce
    }

    pub fn info(&self) -> &PeerInfo {
        &self.info
    }

    /// Queue a message, waiting for space in the send queue.
    pub async fn send(&self, message: Message) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| SyncError::PeerNotConnected(self.info.address.clone()))
    }

    /// Queue a message without waiting. Fails if the queue is full.
    pub fn try_send(&self, message: Message) -> Result<()> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                SyncError::TransportError(format!("send queue full for {}", self.info.address))
            }
            mpsc::error::TrySendError::Closed(_) => {
                SyncError::PeerNotConnected(self.info.address.clone())
            }
        })
    }

    /// Ask the connection tasks to stop.
    pub fn close(&self) {
        self.closed.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl std::fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerHandle")
            .field("address", &self.info.address)
            .field("outbound", &self.info.outbound)
            .finish()
    }
}

/// Run the version handshake on a fresh stream.
///
/// Returns the peer's version. The whole exchange is bounded by `timeout`.
pub async fn handshake<S>(
    stream: &mut S,
    local: &VersionInfo,
    outbound: bool,
    timeout: Duration,
) -> Result<VersionInfo>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(timeout, exchange_versions(stream, local, outbound))
        .await
        .map_err(|_| SyncError::HandshakeTimeout)?
}

async fn exchange_versions<S>(stream: &mut S, local: &VersionInfo, outbound: bool) -> Result<VersionInfo>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if outbound {
        write_message(stream, &Message::Version(local.clone())).await?;
        let remote = expect_version(stream).await?;
        expect_verack(stream).await?;
        write_message(stream, &Message::Verack).await?;
        Ok(remote)
    } else {
        let remote = expect_version(stream).await?;
        write_message(stream, &Message::Version(local.clone())).await?;
        write_message(stream, &Message::Verack).await?;
        expect_verack(stream).await?;
        Ok(remote)
    }
}

async fn expect_version<S: AsyncRead + Unpin>(stream: &mut S) -> Result<VersionInfo> {
    match read_message(stream).await? {
        Some(Message::Version(info)) => {
            if info.protocol_version != PROTOCOL_VERSION {
                return Err(SyncError::VersionMismatch {
                    local: PROTOCOL_VERSION,
                    peer: info.protocol_version,
                });
            }
            Ok(info)
        }
        Some(other) => Err(SyncError::HandshakeFailed(format!(
            "expected version, got {}",
            other.kind()
        ))),
        None => Err(SyncError::HandshakeFailed("closed before version".into())),
    }
}

async fn expect_verack<S: AsyncRead + Unpin>(stream: &mut S) -> Result<()> {
    match read_message(stream).await? {
        Some(Message::Verack) => Ok(()),
        Some(other) => Err(SyncError::HandshakeFailed(format!(
            "expected verack, got {}",
            other.kind()
        ))),
        None => Err(SyncError::HandshakeFailed("closed before verack".into())),
    }
}

/// Handshake, register with `manager`, and start the connection tasks.
///
/// On any failure the stream is dropped and nothing is registered.
pub async fn establish<S>(
    mut stream: S,
    address: PeerAddress,
    outbound: bool,
    manager: &Arc<ConnectionManager>,
    handler: Arc<dyn PeerMessageHandler>,
) -> Result<PeerHandle>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let config = manager.config();
    let version = handshake(
        &mut stream,
        &manager.local_version(),
        outbound,
        config.handshake_timeout,
    )
    .await?;

    let (tx, rx) = mpsc::channel(config.send_queue_size);
    let handle = PeerHandle {
        info: Arc::new(PeerInfo {
            address: address.clone(),
            outbound,
            version,
        }),
        tx,
        closed: Arc::new(Notify::new()),
    };
    manager.add_peer(handle.clone())?;
    tracing::info!(peer = %address, outbound, "peer connected");

    let (reader, writer) = tokio::io::split(stream);
    tokio::spawn(write_loop(writer, rx, handle.closed.clone(), address.clone()));
    tokio::spawn(read_loop(reader, handle.clone(), Arc::clone(manager), handler));

    Ok(handle)
}

async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<Message>,
    closed: Arc<Notify>,
    address: PeerAddress,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        if let Err(e) = write_message(&mut writer, &message).await {
            tracing::debug!(peer = %address, error = %e, "write failed");
            closed.notify_one();
            break;
        }
    }
}

async fn read_loop<R>(
    mut reader: R,
    handle: PeerHandle,
    manager: Arc<ConnectionManager>,
    handler: Arc<dyn PeerMessageHandler>,
) where
    R: AsyncRead + Unpin,
{
    let address = handle.address().clone();
    loop {
        let message = tokio::select! {
            _ = handle.closed.notified() => break,
            read = read_message(&mut reader) => match read {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(peer = %address, error = %e, "dropping peer");
                    break;
                }
            },
        };

        tracing::trace!(peer = %address, kind = message.kind(), "received");
        match message {
            Message::Ping { nonce } => {
                if handle.try_send(Message::Pong { nonce }).is_err() {
                    break;
                }
            }
            Message::Pong { .. } => {}
            Message::Version(_) | Message::Verack => {
                tracing::warn!(peer = %address, "handshake message after handshake");
                break;
            }
            other => match handler.handle_message(&handle, other).await {
                Ok(()) => {}
                Err(SyncError::InvalidMessage(reason)) => {
                    tracing::warn!(peer = %address, reason = %reason, "invalid message");
                    break;
                }
                Err(e) => tracing::warn!(peer = %address, error = %e, "handler failed"),
            },
        }
    }

    manager.unregister(&handle);
    tracing::info!(peer = %address, "peer disconnected");
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    /// A registered-looking handle with no socket behind it. Messages sent to
    /// it land in the returned receiver.
    pub(crate) fn fake_handle(host: &str, port: u16, nonce: u64) -> (PeerHandle, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(16);
        let handle = PeerHandle {
            info: Arc::new(PeerInfo {
                address: PeerAddress::new(host, port),
                outbound: true,
                version: VersionInfo {
                    protocol_version: PROTOCOL_VERSION,
                    nonce,
                    user_agent: "fake".into(),
                    listen_address: None,
                },
            }),
            tx,
            closed: Arc::new(Notify::new()),
        };
        (handle, rx)
    }
}
