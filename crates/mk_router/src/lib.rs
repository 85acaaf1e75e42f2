//! mk_router: endpoint routing and router federation.
//!
//! A [`RoutingServer`] is the per-process directory of named endpoints. Owners
//! announce endpoints as idempotent heartbeats; an endpoint that is not
//! re-announced within its TTL is swept and reported as `staleExpired`.
//! Resolution by coordinates prefers local endpoints over federated ones and
//! fresher endpoints over older ones, so a failed owner drops out of the
//! answer automatically.
//!
//! A [`Federation`] links routers: it pushes locally-owned endpoints to every
//! peer and injects the peers' endpoints tagged with `federationSource`.
//!
//! # Architecture
//!
//! - **Directory**: [`routing`], with an injected [`Clock`] and
//!   [`DiagnosticSink`].
//! - **Peers**: [`discovery`] supplies peer URLs, either a static list or
//!   UDP multicast beacons.
//! - **Transport**: WebSocket frames carrying JSON [`PeerMessage`]s
//!   (via `tokio-tungstenite`), behind the [`PeerTransport`] trait.
//! - **Inspection**: [`inspect`] annotates the directory with liveness.
//! - **Node**: [`RouterNode`] wires all of the above from a [`RouterConfig`].
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mk_router::{Announcement, Federation, LoggingTransport, RouterConfig, RoutingServer, StaticPeerSource};
//!
//! # async fn example() -> mk_router::Result<()> {
//! let config = RouterConfig::default();
//! let router = RoutingServer::new(config.routing_config());
//! router.start_sweeper()?;
//!
//! let federation = Federation::new(
//!     config.federation_config(),
//!     Arc::clone(&router),
//!     Arc::new(StaticPeerSource::new(["tcp://router-2:30020"])),
//!     Arc::new(LoggingTransport::default()),
//! );
//! federation.start().await?;
//!
//! router.announce(Announcement::new("timer-1", "inproc", "node:timer"))?;
//! let best = router.resolve("node:timer");
//! # let _ = best;
//! federation.stop();
//! router.stop_sweeper();
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod diagnostics;
pub mod discovery;
pub mod endpoint;
pub mod error;
pub mod federation;
pub mod inspect;
pub mod logging;
pub mod node;
pub mod peer;
pub mod routing;
pub mod transport;
pub mod wire;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DiscoverySettings, RouterConfig};
pub use diagnostics::{Diagnostic, DiagnosticSink, Level, MemorySink, SharedSink, TracingSink};
pub use discovery::{BeaconConfig, BeaconPeerSource, ChainedPeerSource, PeerSource, StaticPeerSource};
pub use endpoint::{Announcement, Endpoint, FEDERATION_SOURCE, Metadata, RouterEvent};
pub use error::{Result, RouterError};
pub use federation::{Federation, FederationConfig, FederationStatus};
pub use inspect::{EndpointFilter, EndpointView, LivenessStatus, inspect};
pub use logging::init_logging;
pub use node::RouterNode;
pub use peer::{PeerConnection, PeerTable, extract_peer_id};
pub use routing::{RoutingConfig, RoutingServer, Subscription, SubscriptionId, SweeperMetrics};
pub use transport::{FederationListener, LoggingTransport, PeerTransport, WsTransport};
pub use wire::PeerMessage;
