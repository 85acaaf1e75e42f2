//! RouterNode: one router process wired from a [`RouterConfig`].
//!
//! Owns the directory with its sweeper, the federation, the WebSocket
//! listener and, when enabled, beacon discovery.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::config::RouterConfig;
use crate::discovery::BeaconPeerSource;
use crate::error::Result;
use crate::federation::Federation;
use crate::routing::RoutingServer;
use crate::transport::FederationListener;

/// A running router.
pub struct RouterNode {
    config: RouterConfig,
    router: Arc<RoutingServer>,
    federation: Arc<Federation>,
    beacon: Option<Arc<BeaconPeerSource>>,
    listen_addr: SocketAddr,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl RouterNode {
    /// Bind the listener, start the sweeper, discovery and federation.
    ///
    /// A beacon socket that cannot be opened is logged and skipped; the node
    /// then runs on `known_peers` alone.
    pub async fn start(config: RouterConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let listen_addr = listener.local_addr()?;

        let router = RoutingServer::new(config.routing_config());
        router.start_sweeper()?;

        let beacon = if config.discovery.enabled {
            let mut beacon_config = config.beacon_config();
            if config.discovery.advertise_addr.is_none() {
                beacon_config.addr = listen_addr.to_string();
            }
            let beacon = Arc::new(BeaconPeerSource::new(beacon_config));
            match beacon.start().await {
                Ok(()) => Some(beacon),
                Err(e) => {
                    warn!("Beacon discovery start failed (non-fatal): {e}");
                    None
                }
            }
        } else {
            None
        };

        let federation = Federation::new(
            config.federation_config(),
            Arc::clone(&router),
            config.peer_source(beacon.clone()),
            Arc::new(config.transport()),
        );

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let listener = FederationListener::from_listener(listener, Arc::clone(&federation));
        tokio::spawn(async move {
            if let Err(e) = listener.run(shutdown_rx).await {
                error!("Federation listener error: {e}");
            }
        });

        federation.start().await?;
        info!("Router {} listening on {listen_addr}", config.router_id);

        Ok(Self {
            config,
            router,
            federation,
            beacon,
            listen_addr,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<RoutingServer> {
        &self.router
    }

    pub fn federation(&self) -> &Arc<Federation> {
        &self.federation
    }

    /// Beacon source, when discovery is enabled and its socket opened.
    pub fn beacon(&self) -> Option<&Arc<BeaconPeerSource>> {
        self.beacon.as_ref()
    }

    /// Address the listener actually bound (resolves port 0).
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    /// Stop every task the node started. Idempotent.
    pub fn stop(&mut self) {
        let Some(tx) = self.shutdown_tx.take() else {
            return;
        };
        self.federation.stop();
        if let Some(beacon) = &self.beacon {
            beacon.stop();
        }
        self.router.stop_sweeper();
        let _ = tx.send(());
        info!("Router {} stopped", self.config.router_id);
    }
}

impl Drop for RouterNode {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
