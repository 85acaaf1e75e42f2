//! LAN peer discovery via UDP multicast beacons.
//!
//! [`BeaconPeerSource`] periodically multicasts this router's [`Beacon`] and
//! listens for beacons from other routers. Every valid beacon refreshes an
//! entry in a live peer table; entries older than their advertised TTL drop
//! out. The table is exposed to Federation through [`PeerSource`].

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use super::PeerSource;
use super::beacon::{Beacon, BeaconCodec, PeerInfo, Proto};
use crate::clock::{Clock, SystemClock};
use crate::diagnostics::{Level, SharedSink, emit, tracing_sink};
use crate::error::{Result, RouterError};

const COMPONENT: &str = "discovery";

/// Settings for the multicast beacon source.
#[derive(Debug, Clone)]
pub struct BeaconConfig {
    /// This router's identity; beacons carrying it are ignored.
    pub host_id: String,
    /// Address advertised to peers (`host:port`).
    pub addr: String,
    pub proto: Proto,
    pub supported_versions: Vec<u32>,
    pub namespaces: Option<Vec<String>>,
    pub caps: Option<Vec<String>>,
    pub multicast_addr: Ipv4Addr,
    pub port: u16,
    /// How often our own beacon is sent.
    pub interval: Duration,
    /// TTL advertised in our beacon.
    pub peer_ttl: Duration,
}

impl BeaconConfig {
    pub fn new(host_id: impl Into<String>, addr: impl Into<String>, proto: Proto) -> Self {
        Self {
            host_id: host_id.into(),
            addr: addr.into(),
            proto,
            supported_versions: vec![1],
            namespaces: None,
            caps: None,
            multicast_addr: Ipv4Addr::new(224, 0, 0, 251),
            port: 5353,
            interval: Duration::from_secs(5),
            peer_ttl: Duration::from_secs(30),
        }
    }

    /// The beacon this router broadcasts.
    pub fn beacon(&self) -> Beacon {
        Beacon {
            host_id: self.host_id.clone(),
            addr: self.addr.clone(),
            proto: self.proto,
            supported_versions: self.supported_versions.clone(),
            namespaces: self.namespaces.clone(),
            caps: self.caps.clone(),
            ttl: self.peer_ttl.as_millis() as u64,
        }
    }
}

/// Peer table shared between the listener task and readers.
struct BeaconTable {
    host_id: String,
    clock: Arc<dyn Clock>,
    diagnostics: SharedSink,
    peers: Mutex<HashMap<String, PeerInfo>>,
}

impl BeaconTable {
    fn observe(&self, beacon: Beacon) -> bool {
        if beacon.host_id == self.host_id {
            trace!("Ignoring own beacon");
            return false;
        }

        let now = self.clock.now();
        let mut peers = self.peers.lock();
        let discovered_at = peers.get(&beacon.host_id).map(|p| p.discovered_at);
        let mut info = BeaconCodec::to_peer_info(beacon, now);
        let event = match discovered_at {
            Some(first) => {
                info.discovered_at = first;
                "peer.updated"
            }
            None => "peer.discovered",
        };

        emit(
            &self.diagnostics,
            COMPONENT,
            event,
            Level::Debug,
            serde_json::json!({ "hostId": info.host_id, "addr": info.addr }),
        );
        peers.insert(info.host_id.clone(), info);
        true
    }

    /// Drop expired entries and return the live ones.
    fn live(&self) -> Vec<PeerInfo> {
        let now = self.clock.now();
        let mut peers = self.peers.lock();
        let expired: Vec<String> = peers
            .values()
            .filter(|p| !p.is_live(now))
            .map(|p| p.host_id.clone())
            .collect();
        for host_id in expired {
            peers.remove(&host_id);
            emit(
                &self.diagnostics,
                COMPONENT,
                "peer.removed",
                Level::Debug,
                serde_json::json!({ "hostId": host_id }),
            );
        }

        let mut live: Vec<PeerInfo> = peers.values().cloned().collect();
        live.sort_by(|a, b| a.host_id.cmp(&b.host_id));
        live
    }
}

/// Peer source backed by UDP multicast beacons.
pub struct BeaconPeerSource {
    config: BeaconConfig,
    table: Arc<BeaconTable>,
    shutdown_tx: Mutex<Option<broadcast::Sender<()>>>,
}

impl BeaconPeerSource {
    pub fn new(config: BeaconConfig) -> Self {
        Self::with_parts(config, Arc::new(SystemClock), tracing_sink())
    }

    pub fn with_parts(config: BeaconConfig, clock: Arc<dyn Clock>, diagnostics: SharedSink) -> Self {
        let table = Arc::new(BeaconTable {
            host_id: config.host_id.clone(),
            clock,
            diagnostics,
            peers: Mutex::new(HashMap::new()),
        });
        Self {
            config,
            table,
            shutdown_tx: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BeaconConfig {
        &self.config
    }

    /// Bind the multicast socket and spawn the broadcaster and listener.
    /// A no-op if already started.
    pub async fn start(&self) -> Result<()> {
        if self.shutdown_tx.lock().is_some() {
            return Ok(());
        }

        let socket = Arc::new(bind_multicast(self.config.multicast_addr, self.config.port)?);
        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        info!(
            "Beacon discovery listening on {}:{}",
            self.config.multicast_addr, self.config.port
        );

        // Broadcaster: first beacon immediately, then every interval.
        let beacon_bytes = BeaconCodec::encode(&self.config.beacon());
        let group = SocketAddr::V4(SocketAddrV4::new(self.config.multicast_addr, self.config.port));
        let period = self.config.interval.max(Duration::from_millis(1));
        let sender = Arc::clone(&socket);
        let mut shutdown_bcast = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_bcast.recv() => {
                        debug!("Beacon broadcaster shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        match sender.send_to(&beacon_bytes, group).await {
                            Ok(_) => trace!("Beacon sent"),
                            Err(e) => debug!("Beacon send failed: {e}"),
                        }
                    }
                }
            }
        });

        // Listener.
        let table = Arc::clone(&self.table);
        let mut shutdown_listen = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_listen.recv() => {
                        debug!("Beacon listener shutting down");
                        break;
                    }
                    result = socket.recv_from(&mut buf) => {
                        match result {
                            Ok((len, src)) => match BeaconCodec::decode(&buf[..len]) {
                                Some(beacon) => {
                                    table.observe(beacon);
                                }
                                None => trace!("Dropped malformed beacon from {src}"),
                            },
                            Err(e) => warn!("Beacon recv error: {e}"),
                        }
                    }
                }
            }
        });

        *self.shutdown_tx.lock() = Some(shutdown_tx);
        Ok(())
    }

    /// Stop both tasks and forget every peer. Safe to call repeatedly.
    pub fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
        self.table.peers.lock().clear();
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.lock().is_some()
    }

    /// Record a beacon as if it had arrived on the socket. Returns `false`
    /// when it was our own.
    pub fn observe(&self, beacon: Beacon) -> bool {
        self.table.observe(beacon)
    }

    /// Feed a raw datagram through the decoder. Malformed input is dropped.
    pub fn observe_datagram(&self, bytes: &[u8]) -> bool {
        match BeaconCodec::decode(bytes) {
            Some(beacon) => self.table.observe(beacon),
            None => false,
        }
    }

    /// Live peer entries, ordered by host id.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.table.live()
    }

    /// A single live peer entry.
    pub fn peer(&self, host_id: &str) -> Option<PeerInfo> {
        self.table.live().into_iter().find(|p| p.host_id == host_id)
    }
}

impl Drop for BeaconPeerSource {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.get_mut().take() {
            let _ = tx.send(());
        }
    }
}

#[async_trait]
impl PeerSource for BeaconPeerSource {
    async fn get_peers(&self) -> Result<Vec<String>> {
        Ok(self.table.live().iter().map(PeerInfo::url).collect())
    }
}

/// Create a reusable UDP socket joined to `group`.
fn bind_multicast(group: Ipv4Addr, port: u16) -> Result<UdpSocket> {
    let discovery = |what: &str, e: std::io::Error| RouterError::Discovery(format!("{what}: {e}"));

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| discovery("socket()", e))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| discovery("SO_REUSEADDR", e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| discovery("set_nonblocking", e))?;

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket
        .bind(&bind_addr.into())
        .map_err(|e| discovery("bind()", e))?;
    socket
        .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
        .map_err(|e| discovery("IP_ADD_MEMBERSHIP", e))?;
    socket
        .set_multicast_loop_v4(true)
        .map_err(|e| discovery("IP_MULTICAST_LOOP", e))?;

    UdpSocket::from_std(socket.into()).map_err(|e| discovery("tokio UdpSocket", e))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
