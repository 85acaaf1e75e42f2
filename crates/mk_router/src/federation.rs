//! Federation: router-to-router propagation of endpoint announcements.
//!
//! A [`Federation`] wraps one [`RoutingServer`]. It watches the directory to
//! learn which endpoints are owned locally, periodically pushes those to
//! every active peer through a [`PeerTransport`], and injects announcements
//! received from peers back into the directory tagged with
//! `federationSource`.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::diagnostics::{Level, SharedSink, emit, tracing_sink};
use crate::discovery::PeerSource;
use crate::endpoint::{Announcement, FEDERATION_SOURCE, Metadata, RouterEvent};
use crate::error::{Result, RouterError};
use crate::peer::{PeerConnection, PeerTable, extract_peer_id};
use crate::routing::{RoutingServer, Subscription};
use crate::transport::PeerTransport;
use crate::wire::PeerMessage;

const COMPONENT: &str = "federation";

/// Federation settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FederationConfig {
    /// This router's identity. Peers whose derived id equals it are skipped.
    pub router_id: String,
    /// Period of the propagation loop.
    pub propagate_interval: Duration,
}

impl FederationConfig {
    pub fn new(router_id: impl Into<String>) -> Self {
        Self {
            router_id: router_id.into(),
            propagate_interval: Duration::from_millis(5_000),
        }
    }
}

/// Monitoring snapshot returned by [`Federation::status`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FederationStatus {
    pub router_id: String,
    pub peer_count: usize,
    pub local_endpoint_count: usize,
    pub peers: Vec<PeerConnection>,
}

#[derive(Debug, Default)]
struct FederationState {
    peers: PeerTable,
    /// Ids of endpoints owned by this router.
    local: HashSet<String>,
}

/// Propagates local endpoints to peer routers and accepts theirs.
pub struct Federation {
    config: FederationConfig,
    router: Arc<RoutingServer>,
    peer_source: Arc<dyn PeerSource>,
    transport: Arc<dyn PeerTransport>,
    diagnostics: SharedSink,
    state: Arc<Mutex<FederationState>>,
    subscription: Mutex<Option<Subscription>>,
    shutdown_tx: Mutex<Option<broadcast::Sender<()>>>,
}

impl Federation {
    pub fn new(
        config: FederationConfig,
        router: Arc<RoutingServer>,
        peer_source: Arc<dyn PeerSource>,
        transport: Arc<dyn PeerTransport>,
    ) -> Arc<Self> {
        Self::with_diagnostics(config, router, peer_source, transport, tracing_sink())
    }

    pub fn with_diagnostics(
        config: FederationConfig,
        router: Arc<RoutingServer>,
        peer_source: Arc<dyn PeerSource>,
        transport: Arc<dyn PeerTransport>,
        diagnostics: SharedSink,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            router,
            peer_source,
            transport,
            diagnostics,
            state: Arc::new(Mutex::new(FederationState::default())),
            subscription: Mutex::new(None),
            shutdown_tx: Mutex::new(None),
        })
    }

    pub fn router_id(&self) -> &str {
        &self.config.router_id
    }

    pub fn router(&self) -> &Arc<RoutingServer> {
        &self.router
    }

    pub fn is_running(&self) -> bool {
        self.subscription.lock().is_some()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Subscribe to the directory, seed the peer table and start the
    /// propagation loop. Every tick re-polls the peer source before
    /// propagating, so peers that appear later (beacons) are picked up.
    /// The first tick runs right away. Calling it while running is a no-op.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut slot = self.subscription.lock();
            if slot.is_some() {
                return Ok(());
            }
            let state = Arc::clone(&self.state);
            let diagnostics = Arc::clone(&self.diagnostics);
            *slot = Some(
                self.router
                    .subscribe(move |event| track_local(&state, &diagnostics, event)),
            );
        }

        emit(
            &self.diagnostics,
            COMPONENT,
            "start",
            Level::Debug,
            serde_json::json!({ "routerId": self.config.router_id }),
        );

        self.discover_peers().await;
        self.spawn_propagation();

        emit(
            &self.diagnostics,
            COMPONENT,
            "started",
            Level::Info,
            serde_json::json!({
                "routerId": self.config.router_id,
                "peerCount": self.state.lock().peers.len(),
            }),
        );
        Ok(())
    }

    fn spawn_propagation(self: &Arc<Self>) {
        let mut slot = self.shutdown_tx.lock();
        if slot.is_some() {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let period = self.config.propagate_interval.max(Duration::from_millis(1));
        let federation: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => {
                        debug!("Propagation loop shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        let Some(federation) = federation.upgrade() else { break };
                        federation.discover_peers().await;
                        federation.propagate_once().await;
                    }
                }
            }
        });

        *slot = Some(shutdown_tx);
    }

    /// Unsubscribe, cancel the propagation loop and forget all peers and
    /// local ids. Idempotent, and safe to call from inside a tick.
    pub fn stop(&self) {
        emit(
            &self.diagnostics,
            COMPONENT,
            "stop",
            Level::Debug,
            serde_json::json!({ "routerId": self.config.router_id }),
        );

        if let Some(subscription) = self.subscription.lock().take() {
            subscription.unsubscribe();
        }
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
        {
            let mut state = self.state.lock();
            state.peers.clear();
            state.local.clear();
        }

        emit(
            &self.diagnostics,
            COMPONENT,
            "stopped",
            Level::Info,
            serde_json::json!({ "routerId": self.config.router_id }),
        );
    }

    // -----------------------------------------------------------------------
    // Peers
    // -----------------------------------------------------------------------

    /// Pull the current peer list and add peers not seen before. Failures are
    /// reported and otherwise ignored.
    pub async fn discover_peers(&self) {
        let urls = match self.peer_source.get_peers().await {
            Ok(urls) => urls,
            Err(e) => {
                emit(
                    &self.diagnostics,
                    COMPONENT,
                    "peer.discovery.error",
                    Level::Error,
                    serde_json::json!({ "error": e.to_string() }),
                );
                return;
            }
        };

        let now = self.router.clock().now();
        let mut state = self.state.lock();
        for url in urls {
            let peer_id = extract_peer_id(&url);
            if peer_id == self.config.router_id {
                emit(
                    &self.diagnostics,
                    COMPONENT,
                    "peer.skip-self",
                    Level::Debug,
                    serde_json::json!({ "url": url }),
                );
                continue;
            }
            if state.peers.insert_new(&peer_id, &url, now) {
                emit(
                    &self.diagnostics,
                    COMPONENT,
                    "peer.discovered",
                    Level::Info,
                    serde_json::json!({ "peerId": peer_id, "url": url }),
                );
            }
        }
    }

    /// Mark a peer active or inactive. Inactive peers are skipped by
    /// propagation.
    pub fn set_peer_active(&self, peer_id: &str, active: bool) {
        self.state.lock().peers.set_active(peer_id, active);
    }

    // -----------------------------------------------------------------------
    // Propagation
    // -----------------------------------------------------------------------

    /// Send every local endpoint to every active peer once. Returns the
    /// number of peers the batch was delivered to.
    pub async fn propagate_once(&self) -> usize {
        let endpoints = self.router.list();
        let (mut announcements, peers) = {
            let state = self.state.lock();
            let announcements: Vec<Announcement> = endpoints
                .iter()
                .filter(|ep| state.local.contains(&ep.id))
                .map(|ep| ep.to_announcement())
                .collect();
            (announcements, state.peers.list_active())
        };

        if announcements.is_empty() {
            emit(
                &self.diagnostics,
                COMPONENT,
                "propagate.skip",
                Level::Debug,
                serde_json::json!({ "reason": "no-local-endpoints" }),
            );
            return 0;
        }
        announcements.sort_by(|a, b| a.id.cmp(&b.id));

        emit(
            &self.diagnostics,
            COMPONENT,
            "propagate.start",
            Level::Debug,
            serde_json::json!({
                "endpointCount": announcements.len(),
                "peerCount": peers.len(),
            }),
        );

        let mut delivered = 0;
        for peer in &peers {
            match self
                .transport
                .send(peer, &self.config.router_id, &announcements)
                .await
            {
                Ok(()) => delivered += 1,
                Err(e) => emit(
                    &self.diagnostics,
                    COMPONENT,
                    "propagate.error",
                    Level::Warn,
                    serde_json::json!({
                        "peerId": peer.peer_id,
                        "url": peer.url,
                        "error": e.to_string(),
                    }),
                ),
            }
        }
        delivered
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Inject an announcement received from `peer_id` into the directory.
    /// `federationSource` is set to `peer_id`, overwriting any value the
    /// peer sent. Announcements claiming to come from this router are
    /// refused and leave the directory untouched.
    pub fn receive_from_peer(&self, peer_id: &str, mut announcement: Announcement) -> Result<()> {
        if peer_id == self.config.router_id {
            self.report_self_loop(&announcement.id);
            return Err(RouterError::SelfLoop(peer_id.to_string()));
        }

        announcement
            .metadata
            .get_or_insert_with(Metadata::new)
            .insert(FEDERATION_SOURCE.to_string(), peer_id.into());

        emit(
            &self.diagnostics,
            COMPONENT,
            "receive.peer",
            Level::Debug,
            serde_json::json!({
                "peerId": peer_id,
                "id": announcement.id,
                "type": announcement.kind,
            }),
        );

        self.router.announce(announcement)?;

        let now = self.router.clock().now();
        self.state.lock().peers.touch(peer_id, now);
        Ok(())
    }

    /// Apply every announcement in a wire message. Rejected announcements are
    /// reported and skipped. Returns how many were applied.
    pub fn receive_message(&self, message: PeerMessage) -> usize {
        let from = message.from;
        if from == self.config.router_id {
            for announcement in &message.announcements {
                self.report_self_loop(&announcement.id);
            }
            return 0;
        }

        let mut applied = 0;
        for announcement in message.announcements {
            let id = announcement.id.clone();
            match self.receive_from_peer(&from, announcement) {
                Ok(()) => applied += 1,
                Err(e) => emit(
                    &self.diagnostics,
                    COMPONENT,
                    "receive.rejected",
                    Level::Warn,
                    serde_json::json!({ "peerId": from, "id": id, "error": e.to_string() }),
                ),
            }
        }
        applied
    }

    fn report_self_loop(&self, id: &str) {
        emit(
            &self.diagnostics,
            COMPONENT,
            "receive.self",
            Level::Warn,
            serde_json::json!({ "routerId": self.config.router_id, "id": id }),
        );
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    pub fn status(&self) -> FederationStatus {
        let state = self.state.lock();
        FederationStatus {
            router_id: self.config.router_id.clone(),
            peer_count: state.peers.len(),
            local_endpoint_count: state.local.len(),
            peers: state.peers.list_all(),
        }
    }

    pub fn local_endpoint_count(&self) -> usize {
        self.state.lock().local.len()
    }

    /// When an announcement from `peer_id` was last received.
    pub fn peer_last_seen(&self, peer_id: &str) -> Option<DateTime<Utc>> {
        self.state.lock().peers.get(peer_id).map(|p| p.last_seen)
    }
}

impl Drop for Federation {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.get_mut().take() {
            let _ = tx.send(());
        }
        if let Some(subscription) = self.subscription.get_mut().take() {
            subscription.unsubscribe();
        }
    }
}

/// Keep the local-id set in step with directory events.
fn track_local(state: &Mutex<FederationState>, diagnostics: &SharedSink, event: &RouterEvent) {
    let endpoint = event.endpoint();
    match event {
        RouterEvent::Added { .. } | RouterEvent::Updated { .. } => {
            if endpoint.is_local() {
                state.lock().local.insert(endpoint.id.clone());
                emit(
                    diagnostics,
                    COMPONENT,
                    "local.change",
                    Level::Debug,
                    serde_json::json!({
                        "type": event.kind_str(),
                        "id": endpoint.id,
                        "coordinates": endpoint.coordinates,
                    }),
                );
            } else {
                // A local id re-announced by a peer is no longer ours.
                state.lock().local.remove(&endpoint.id);
            }
        }
        RouterEvent::Removed { .. } | RouterEvent::StaleExpired { .. } => {
            state.lock().local.remove(&endpoint.id);
            emit(
                diagnostics,
                COMPONENT,
                "local.removed",
                Level::Debug,
                serde_json::json!({ "id": endpoint.id }),
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::diagnostics::MemorySink;
    use crate::discovery::{BeaconConfig, BeaconPeerSource, Proto, StaticPeerSource};
    use crate::routing::RoutingConfig;
    use async_trait::async_trait;

    /// Records each send; fails for peer ids listed in `failing`.
    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(String, String, Vec<String>)>>,
        failing: Vec<String>,
    }

    impl RecordingTransport {
        fn failing(ids: &[&str]) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                failing: ids.iter().map(|s| s.to_string()).collect(),
            }
        }

        fn sent_to(&self) -> Vec<String> {
            self.sent.lock().iter().map(|(p, _, _)| p.clone()).collect()
        }
    }

    #[async_trait]
    impl PeerTransport for RecordingTransport {
        async fn send(
            &self,
            peer: &PeerConnection,
            from: &str,
            announcements: &[Announcement],
        ) -> Result<()> {
            if self.failing.contains(&peer.peer_id) {
                return Err(RouterError::Transport(format!("{} unreachable", peer.peer_id)));
            }
            self.sent.lock().push((
                peer.peer_id.clone(),
                from.to_string(),
                announcements.iter().map(|a| a.id.clone()).collect(),
            ));
            Ok(())
        }
    }

    struct FailingSource;

    #[async_trait]
    impl PeerSource for FailingSource {
        async fn get_peers(&self) -> Result<Vec<String>> {
            Err(RouterError::Discovery("source offline".into()))
        }
    }

    struct Fixture {
        router: Arc<RoutingServer>,
        federation: Arc<Federation>,
        transport: Arc<RecordingTransport>,
        sink: MemorySink,
        clock: ManualClock,
    }

    fn fixture_with(
        router_id: &str,
        source: Arc<dyn PeerSource>,
        transport: RecordingTransport,
    ) -> Fixture {
        let clock = ManualClock::starting_now();
        let sink = MemorySink::new();
        let router = RoutingServer::with_parts(
            RoutingConfig::default(),
            Arc::new(clock.clone()),
            Arc::new(sink.clone()),
        );
        let transport = Arc::new(transport);
        let mut config = FederationConfig::new(router_id);
        // Keep the background loop out of the way; tests drive propagation.
        config.propagate_interval = Duration::from_secs(3600);
        let federation = Federation::with_diagnostics(
            config,
            Arc::clone(&router),
            source,
            Arc::clone(&transport) as Arc<dyn PeerTransport>,
            Arc::new(sink.clone()),
        );
        Fixture {
            router,
            federation,
            transport,
            sink,
            clock,
        }
    }

    fn fixture(router_id: &str, peers: &[&str]) -> Fixture {
        fixture_with(
            router_id,
            Arc::new(StaticPeerSource::new(peers.iter().copied())),
            RecordingTransport::default(),
        )
    }

    #[tokio::test]
    async fn test_start_discovers_static_peers() {
        let f = fixture("router-1", &["tcp://router-2:30020"]);
        f.federation.start().await.unwrap();

        let status = f.federation.status();
        assert_eq!(status.router_id, "router-1");
        assert_eq!(status.peer_count, 1);
        assert_eq!(status.peers[0].peer_id, "router-2");
        assert_eq!(status.peers[0].url, "tcp://router-2:30020");
        assert!(status.peers[0].active);
        assert!(f.sink.contains("federation", "started"));
        f.federation.stop();
    }

    #[tokio::test]
    async fn test_multiple_peers_ordered() {
        let f = fixture(
            "router-1",
            &["tcp://router-3:30020", "tcp://router-2:30020", "tcp://router-4:30020"],
        );
        f.federation.start().await.unwrap();
        let ids: Vec<_> = f
            .federation
            .status()
            .peers
            .into_iter()
            .map(|p| p.peer_id)
            .collect();
        assert_eq!(ids, vec!["router-2", "router-3", "router-4"]);
        f.federation.stop();
    }

    #[tokio::test]
    async fn test_self_is_never_a_peer() {
        let f = fixture("router-1", &["tcp://router-1:30020", "tcp://router-2:30020"]);
        f.federation.start().await.unwrap();

        let status = f.federation.status();
        assert_eq!(status.peer_count, 1);
        assert_eq!(status.peers[0].peer_id, "router-2");
        assert!(f.sink.contains("federation", "peer.skip-self"));
        f.federation.stop();
    }

    #[tokio::test]
    async fn test_self_excluded_by_host_id_in_url() {
        let f = fixture(
            "router-1",
            &["tcp://router-1@10.0.0.1:30020", "tcp://router-2@10.0.0.2:30020"],
        );
        f.federation.start().await.unwrap();

        let status = f.federation.status();
        assert_eq!(status.peer_count, 1);
        assert_eq!(status.peers[0].peer_id, "router-2");
        assert!(f.sink.contains("federation", "peer.skip-self"));
        f.federation.stop();
    }

    #[tokio::test]
    async fn test_duplicate_urls_keep_first_entry() {
        let f = fixture("router-1", &["tcp://router-2:30020", "ws://router-2:9000"]);
        f.federation.start().await.unwrap();
        let status = f.federation.status();
        assert_eq!(status.peer_count, 1);
        assert_eq!(status.peers[0].url, "tcp://router-2:30020");
        f.federation.stop();
    }

    #[tokio::test]
    async fn test_discovery_error_is_not_fatal() {
        let f = fixture_with("router-1", Arc::new(FailingSource), RecordingTransport::default());
        f.federation.start().await.unwrap();

        assert!(f.federation.is_running());
        assert_eq!(f.federation.status().peer_count, 0);
        let errors: Vec<_> = f
            .sink
            .events()
            .into_iter()
            .filter(|d| d.event == "peer.discovery.error")
            .collect();
        assert!(!errors.is_empty());
        assert!(errors.iter().all(|d| d.level == Level::Error));
        f.federation.stop();
    }

    #[tokio::test]
    async fn test_local_and_peer_endpoints_classified() {
        let f = fixture("router-1", &["tcp://router-2:30020"]);
        f.federation.start().await.unwrap();

        f.router
            .announce(Announcement::new("local-ep-1", "inproc", "node:service-a"))
            .unwrap();
        f.federation
            .receive_from_peer("router-2", Announcement::new("remote-ep-1", "inproc", "node:service-b"))
            .unwrap();

        assert_eq!(f.federation.local_endpoint_count(), 1);
        assert_eq!(f.router.endpoint_count(), 2);
        assert!(f.router.get("local-ep-1").unwrap().is_local());
        assert_eq!(
            f.router.get("remote-ep-1").unwrap().federation_source(),
            Some("router-2")
        );
        f.federation.stop();
    }

    #[tokio::test]
    async fn test_withdraw_and_expiry_leave_local_set() {
        let f = fixture("router-1", &[]);
        f.federation.start().await.unwrap();

        f.router.announce(Announcement::new("a", "tcp", "node:a")).unwrap();
        f.router.announce(Announcement::new("b", "tcp", "node:b")).unwrap();
        assert_eq!(f.federation.local_endpoint_count(), 2);

        f.router.withdraw("a");
        assert_eq!(f.federation.local_endpoint_count(), 1);

        f.clock.advance(f.router.ttl() + Duration::from_millis(1));
        assert_eq!(f.router.sweep(), 1);
        assert_eq!(f.federation.local_endpoint_count(), 0);
        assert_eq!(f.sink.count("federation", "local.removed"), 2);
        f.federation.stop();
    }

    #[tokio::test]
    async fn test_receive_overwrites_federation_source() {
        let f = fixture("router-1", &[]);
        f.federation.start().await.unwrap();

        let spoofed =
            Announcement::new("x", "tcp", "node:x").with_metadata(FEDERATION_SOURCE, "router-9");
        f.federation.receive_from_peer("router-2", spoofed).unwrap();

        assert_eq!(f.router.get("x").unwrap().federation_source(), Some("router-2"));
        assert_eq!(f.federation.local_endpoint_count(), 0);
        f.federation.stop();
    }

    #[tokio::test]
    async fn test_receive_rejects_missing_id() {
        let f = fixture("router-1", &[]);
        let result = f.federation.receive_from_peer("router-2", Announcement::new("", "tcp", "c"));
        assert!(matches!(result, Err(RouterError::MissingId)));
        assert_eq!(f.router.endpoint_count(), 0);
    }

    #[tokio::test]
    async fn test_receive_refreshes_peer_last_seen() {
        let f = fixture("router-1", &["tcp://router-2:30020"]);
        f.federation.start().await.unwrap();
        let before = f.federation.peer_last_seen("router-2").unwrap();

        f.clock.advance(Duration::from_secs(3));
        f.federation
            .receive_from_peer("router-2", Announcement::new("r", "tcp", "node:r"))
            .unwrap();
        let after = f.federation.peer_last_seen("router-2").unwrap();
        assert!(after > before);

        // Unknown peers are accepted but not added to the table.
        f.federation
            .receive_from_peer("router-7", Announcement::new("s", "tcp", "node:s"))
            .unwrap();
        assert!(f.federation.peer_last_seen("router-7").is_none());
        f.federation.stop();
    }

    #[tokio::test]
    async fn test_propagate_skips_without_local_endpoints() {
        let f = fixture("router-1", &["tcp://router-2:30020"]);
        f.federation.start().await.unwrap();
        f.federation
            .receive_from_peer("router-2", Announcement::new("remote", "tcp", "node:r"))
            .unwrap();

        assert_eq!(f.federation.propagate_once().await, 0);
        assert!(f.transport.sent_to().is_empty());
        assert!(f.sink.contains("federation", "propagate.skip"));
        f.federation.stop();
    }

    #[tokio::test]
    async fn test_propagate_sends_only_local_endpoints() {
        let f = fixture("router-1", &["tcp://router-2:30020"]);
        f.federation.start().await.unwrap();

        f.router.announce(Announcement::new("b-local", "tcp", "node:b")).unwrap();
        f.router.announce(Announcement::new("a-local", "tcp", "node:a")).unwrap();
        f.federation
            .receive_from_peer("router-2", Announcement::new("remote", "tcp", "node:r"))
            .unwrap();

        assert_eq!(f.federation.propagate_once().await, 1);
        let sent = f.transport.sent.lock().clone();
        let (peer, from, ids) = sent.last().unwrap();
        assert_eq!(peer, "router-2");
        assert_eq!(from, "router-1");
        assert_eq!(ids, &vec!["a-local".to_string(), "b-local".to_string()]);
        f.federation.stop();
    }

    #[tokio::test]
    async fn test_peer_failure_does_not_stop_others() {
        let f = fixture_with(
            "router-1",
            Arc::new(StaticPeerSource::new([
                "tcp://router-2:30020",
                "tcp://router-3:30020",
                "tcp://router-4:30020",
            ])),
            RecordingTransport::failing(&["router-3"]),
        );
        f.federation.start().await.unwrap();
        f.router.announce(Announcement::new("a", "tcp", "node:a")).unwrap();

        assert_eq!(f.federation.propagate_once().await, 2);
        let mut sent = f.transport.sent_to();
        sent.dedup();
        assert!(sent.contains(&"router-2".to_string()));
        assert!(sent.contains(&"router-4".to_string()));
        assert!(!sent.contains(&"router-3".to_string()));
        assert!(f.sink.contains("federation", "propagate.error"));
        f.federation.stop();
    }

    #[tokio::test]
    async fn test_inactive_peers_skipped() {
        let f = fixture("router-1", &["tcp://router-2:30020", "tcp://router-3:30020"]);
        f.federation.start().await.unwrap();
        f.router.announce(Announcement::new("a", "tcp", "node:a")).unwrap();
        f.federation.set_peer_active("router-3", false);

        assert_eq!(f.federation.propagate_once().await, 1);
        assert_eq!(f.transport.sent_to().last().unwrap(), "router-2");
        f.federation.stop();
    }

    #[tokio::test]
    async fn test_propagation_loop_runs() {
        let transport = Arc::new(RecordingTransport::default());
        let router = RoutingServer::new(RoutingConfig::default());
        let mut config = FederationConfig::new("router-1");
        config.propagate_interval = Duration::from_millis(20);
        let federation = Federation::new(
            config,
            Arc::clone(&router),
            Arc::new(StaticPeerSource::new(["tcp://router-2:30020"])),
            Arc::clone(&transport) as Arc<dyn PeerTransport>,
        );

        federation.start().await.unwrap();
        router.announce(Announcement::new("a", "tcp", "node:a")).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!transport.sent_to().is_empty());

        federation.stop();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let after_stop = transport.sent_to().len();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.sent_to().len(), after_stop);
    }

    #[tokio::test]
    async fn test_stop_clears_and_is_idempotent() {
        let f = fixture("router-1", &["tcp://router-2:30020"]);
        f.federation.start().await.unwrap();
        f.router.announce(Announcement::new("a", "tcp", "node:a")).unwrap();
        assert_eq!(f.router.subscriber_count(), 1);

        f.federation.stop();
        f.federation.stop();

        let status = f.federation.status();
        assert_eq!(status.peer_count, 0);
        assert_eq!(status.local_endpoint_count, 0);
        assert!(!f.federation.is_running());
        assert_eq!(f.router.subscriber_count(), 0);

        // No longer tracking.
        f.router.announce(Announcement::new("b", "tcp", "node:b")).unwrap();
        assert_eq!(f.federation.local_endpoint_count(), 0);
    }

    #[tokio::test]
    async fn test_start_twice_is_noop() {
        let f = fixture("router-1", &["tcp://router-2:30020"]);
        f.federation.start().await.unwrap();
        f.federation.start().await.unwrap();
        assert_eq!(f.router.subscriber_count(), 1);
        assert_eq!(f.sink.count("federation", "started"), 1);
        f.federation.stop();
    }

    #[tokio::test]
    async fn test_receive_message_skips_rejected() {
        let f = fixture("router-1", &[]);
        let message = PeerMessage::announce(
            "router-2",
            vec![
                Announcement::new("ok", "tcp", "node:ok"),
                Announcement::new("", "tcp", "node:bad"),
            ],
        );
        assert_eq!(f.federation.receive_message(message), 1);
        assert!(f.sink.contains("federation", "receive.rejected"));
        assert_eq!(f.router.get("ok").unwrap().federation_source(), Some("router-2"));
    }

    #[tokio::test]
    async fn test_receive_from_self_is_refused() {
        let f = fixture("router-1", &[]);
        f.federation.start().await.unwrap();

        let result = f
            .federation
            .receive_from_peer("router-1", Announcement::new("looped", "tcp", "node:l"));
        assert!(matches!(result, Err(RouterError::SelfLoop(ref id)) if id == "router-1"));
        assert!(f.router.get("looped").is_none());

        let message = PeerMessage::announce(
            "router-1",
            vec![
                Announcement::new("echo-a", "tcp", "node:a"),
                Announcement::new("echo-b", "tcp", "node:b"),
            ],
        );
        assert_eq!(f.federation.receive_message(message), 0);
        assert_eq!(f.router.endpoint_count(), 0);
        assert_eq!(f.federation.local_endpoint_count(), 0);
        assert_eq!(f.sink.count("federation", "receive.self"), 3);
        assert!(!f.sink.contains("federation", "receive.rejected"));
        f.federation.stop();
    }

    #[tokio::test]
    async fn test_beacon_peers_join_after_start() {
        let clock = ManualClock::starting_now();
        let sink = MemorySink::new();
        let router = RoutingServer::with_parts(
            RoutingConfig::default(),
            Arc::new(clock.clone()),
            Arc::new(sink.clone()),
        );
        let beacons = Arc::new(BeaconPeerSource::with_parts(
            BeaconConfig::new("router-1", "10.0.0.1:30020", Proto::Tcp),
            Arc::new(clock.clone()),
            Arc::new(sink.clone()),
        ));
        let transport = Arc::new(RecordingTransport::default());
        let mut config = FederationConfig::new("router-1");
        config.propagate_interval = Duration::from_millis(20);
        let federation = Federation::with_diagnostics(
            config,
            Arc::clone(&router),
            Arc::clone(&beacons) as Arc<dyn PeerSource>,
            Arc::clone(&transport) as Arc<dyn PeerTransport>,
            Arc::new(sink.clone()),
        );

        federation.start().await.unwrap();
        router.announce(Announcement::new("a", "tcp", "node:a")).unwrap();
        assert_eq!(federation.status().peer_count, 0);

        // A neighbour shows up only after the federation is running.
        beacons.observe(BeaconConfig::new("router-2", "10.0.0.2:30020", Proto::Tcp).beacon());

        let mut joined = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if transport.sent_to().iter().any(|p| p == "router-2") {
                joined = true;
                break;
            }
        }
        assert!(joined, "beacon peer should receive propagation");

        let status = federation.status();
        assert_eq!(status.peer_count, 1);
        assert_eq!(status.peers[0].peer_id, "router-2");
        assert_eq!(status.peers[0].url, "tcp://router-2@10.0.0.2:30020");
        federation.stop();
    }

    #[tokio::test]
    async fn test_beacon_peer_last_seen_refreshed_by_host_id() {
        let clock = ManualClock::starting_now();
        let sink = MemorySink::new();
        let router = RoutingServer::with_parts(
            RoutingConfig::default(),
            Arc::new(clock.clone()),
            Arc::new(sink.clone()),
        );
        let beacons = Arc::new(BeaconPeerSource::with_parts(
            BeaconConfig::new("router-1", "10.0.0.1:30020", Proto::Tcp),
            Arc::new(clock.clone()),
            Arc::new(sink.clone()),
        ));
        beacons.observe(BeaconConfig::new("router-2", "10.0.0.2:30020", Proto::Tcp).beacon());
        let federation = Federation::with_diagnostics(
            FederationConfig::new("router-1"),
            Arc::clone(&router),
            Arc::clone(&beacons) as Arc<dyn PeerSource>,
            Arc::new(RecordingTransport::default()),
            Arc::new(sink.clone()),
        );

        federation.discover_peers().await;
        let ids: Vec<_> = federation.status().peers.into_iter().map(|p| p.peer_id).collect();
        assert_eq!(ids, vec!["router-2"]);

        let before = federation.peer_last_seen("router-2").unwrap();
        clock.advance(Duration::from_secs(2));
        federation
            .receive_from_peer("router-2", Announcement::new("r", "tcp", "node:r"))
            .unwrap();
        assert!(federation.peer_last_seen("router-2").unwrap() > before);
    }

    #[tokio::test]
    async fn test_status_serializes_camel_case() {
        let f = fixture("router-1", &["tcp://router-2:30020"]);
        f.federation.start().await.unwrap();
        let json = serde_json::to_value(f.federation.status()).unwrap();
        assert_eq!(json["routerId"], "router-1");
        assert_eq!(json["peerCount"], 1);
        assert_eq!(json["localEndpointCount"], 0);
        assert_eq!(json["peers"][0]["peerId"], "router-2");
        assert!(json["peers"][0].get("lastSeen").is_some());
        f.federation.stop();
    }
}
