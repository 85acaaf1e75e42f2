//! Router-to-router transport.
//!
//! [`PeerTransport`] is the seam Federation sends through. Two
//! implementations ship with the crate: [`LoggingTransport`] only reports
//! what it would send, [`WsTransport`] delivers a [`PeerMessage`] frame over
//! a short-lived WebSocket connection. [`FederationListener`] is the
//! receiving side: it accepts WebSocket connections and feeds every decoded
//! announcement into [`Federation::receive_from_peer`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async};
use tracing::{debug, error, info, warn};

use crate::diagnostics::{Level, SharedSink, emit, tracing_sink};
use crate::endpoint::Announcement;
use crate::error::{Result, RouterError};
use crate::federation::Federation;
use crate::peer::PeerConnection;
use crate::wire::PeerMessage;

/// Delivers a batch of announcements to one peer router.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Send `announcements`, owned by router `from`, to `peer`.
    async fn send(
        &self,
        peer: &PeerConnection,
        from: &str,
        announcements: &[Announcement],
    ) -> Result<()>;
}

/// Records each propagation decision and sends nothing.
pub struct LoggingTransport {
    diagnostics: SharedSink,
}

impl LoggingTransport {
    pub fn new(diagnostics: SharedSink) -> Self {
        Self { diagnostics }
    }
}

impl Default for LoggingTransport {
    fn default() -> Self {
        Self::new(tracing_sink())
    }
}

#[async_trait]
impl PeerTransport for LoggingTransport {
    async fn send(
        &self,
        peer: &PeerConnection,
        _from: &str,
        announcements: &[Announcement],
    ) -> Result<()> {
        emit(
            &self.diagnostics,
            "federation",
            "propagate.peer",
            Level::Debug,
            serde_json::json!({
                "peerId": peer.peer_id,
                "url": peer.url,
                "endpointCount": announcements.len(),
            }),
        );
        Ok(())
    }
}

/// WebSocket client transport: one connection, one frame, then close.
/// The timeout bounds the whole exchange, handshake through close.
#[derive(Debug, Clone)]
pub struct WsTransport {
    timeout: Duration,
}

impl WsTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

#[async_trait]
impl PeerTransport for WsTransport {
    async fn send(
        &self,
        peer: &PeerConnection,
        from: &str,
        announcements: &[Announcement],
    ) -> Result<()> {
        let url = ws_url(&peer.url);
        let frame = PeerMessage::announce(from, announcements.to_vec()).to_json()?;

        let exchange = async {
            let (mut ws, _) = connect_async(url.as_str())
                .await
                .map_err(|e| RouterError::Transport(format!("Connect to {url} failed: {e}")))?;
            ws.send(Message::Text(frame.into()))
                .await
                .map_err(|e| RouterError::Transport(format!("Send to {url} failed: {e}")))?;
            let _ = ws.close(None).await;
            Ok::<(), RouterError>(())
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| RouterError::Timeout(self.timeout))??;

        debug!(
            "Sent {} announcement(s) to {} at {url}",
            announcements.len(),
            peer.peer_id
        );
        Ok(())
    }
}

/// Map a peer URL onto a WebSocket URL. `tcp://` becomes `ws://`; a bare
/// `host:port` gets a `ws://` prefix. A `hostId@` user part is dropped.
pub fn ws_url(url: &str) -> String {
    let (scheme, rest) = if let Some(rest) = url.strip_prefix("ws://") {
        ("ws", rest)
    } else if let Some(rest) = url.strip_prefix("wss://") {
        ("wss", rest)
    } else if let Some(rest) = url.strip_prefix("tcp://") {
        ("ws", rest)
    } else {
        ("ws", url)
    };

    let (authority, path) = match rest.find('/') {
        Some(i) => rest.split_at(i),
        None => (rest, ""),
    };
    let host = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
    format!("{scheme}://{host}{path}")
}

/// WebSocket server that accepts [`PeerMessage`] frames from peer routers.
pub struct FederationListener {
    listener: TcpListener,
    federation: Arc<Federation>,
}

impl FederationListener {
    /// Bind the listening socket. Use port 0 to let the OS choose.
    pub async fn bind(addr: SocketAddr, federation: Arc<Federation>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::from_listener(listener, federation))
    }

    /// Serve on an already bound socket.
    pub fn from_listener(listener: TcpListener, federation: Arc<Federation>) -> Self {
        Self {
            listener,
            federation,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let addr = self.local_addr()?;
        info!("Federation listener on {addr}");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Federation listener shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let federation = Arc::clone(&self.federation);
                        tokio::spawn(handle_connection(stream, peer_addr, federation));
                    }
                    Err(e) => error!("TCP accept failed: {e}"),
                },
            }
        }
        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, peer_addr: SocketAddr, federation: Arc<Federation>) {
    let mut ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake with {peer_addr} failed: {e}");
            return;
        }
    };

    while let Some(msg) = ws.next().await {
        match msg {
            Ok(Message::Text(text)) => match PeerMessage::from_json(&text) {
                Ok(message) => {
                    let applied = federation.receive_message(message);
                    debug!("Applied {applied} announcement(s) from {peer_addr}");
                }
                Err(e) => warn!("Dropping malformed frame from {peer_addr}: {e}"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Read error from {peer_addr}: {e}");
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
