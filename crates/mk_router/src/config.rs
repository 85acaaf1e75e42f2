//! Router configuration.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::discovery::{
    BeaconConfig, BeaconPeerSource, ChainedPeerSource, PeerSource, Proto, StaticPeerSource,
};
use crate::error::{Result, RouterError};
use crate::federation::FederationConfig;
use crate::routing::RoutingConfig;
use crate::transport::WsTransport;

/// Configuration for one router instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterConfig {
    /// Identity used for self-exclusion and as `federationSource` on peers.
    pub router_id: String,

    /// Endpoint TTL.
    #[serde(with = "duration_ms")]
    pub ttl: Duration,

    /// Period of the background sweeper.
    #[serde(with = "duration_ms")]
    pub sweep_interval: Duration,

    /// Period of the federation propagation loop.
    #[serde(with = "duration_ms")]
    pub propagate_interval: Duration,

    /// Address the federation listener binds.
    #[serde(with = "socket_addr_serde")]
    pub listen_addr: SocketAddr,

    /// Static peer URLs, e.g. `tcp://router-2:30020`.
    pub known_peers: Vec<String>,

    /// Bound on each outbound WebSocket send, handshake through close.
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,

    pub discovery: DiscoverySettings,
}

/// Multicast beacon discovery settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscoverySettings {
    pub enabled: bool,
    pub multicast_addr: Ipv4Addr,
    pub port: u16,
    #[serde(with = "duration_ms")]
    pub interval: Duration,
    /// TTL advertised in our beacons.
    #[serde(with = "duration_ms")]
    pub peer_ttl: Duration,
    /// Address advertised to peers. Defaults to `listen_addr`.
    pub advertise_addr: Option<String>,
    pub proto: Proto,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            multicast_addr: Ipv4Addr::new(224, 0, 0, 251),
            port: 5353,
            interval: Duration::from_millis(5_000),
            peer_ttl: Duration::from_millis(30_000),
            advertise_addr: None,
            proto: Proto::Tcp,
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        let routing = RoutingConfig::default();
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        Self {
            router_id: format!("router-{}", &uuid[..8]),
            ttl: routing.ttl,
            sweep_interval: routing.sweep_interval,
            propagate_interval: Duration::from_millis(5_000),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 30020)),
            known_peers: Vec::new(),
            connect_timeout: Duration::from_millis(3_000),
            discovery: DiscoverySettings::default(),
        }
    }
}

impl RouterConfig {
    pub fn routing_config(&self) -> RoutingConfig {
        RoutingConfig {
            ttl: self.ttl,
            sweep_interval: self.sweep_interval,
        }
    }

    pub fn federation_config(&self) -> FederationConfig {
        FederationConfig {
            router_id: self.router_id.clone(),
            propagate_interval: self.propagate_interval,
        }
    }

    pub fn beacon_config(&self) -> BeaconConfig {
        let addr = self
            .discovery
            .advertise_addr
            .clone()
            .unwrap_or_else(|| self.listen_addr.to_string());
        let mut config = BeaconConfig::new(self.router_id.clone(), addr, self.discovery.proto);
        config.multicast_addr = self.discovery.multicast_addr;
        config.port = self.discovery.port;
        config.interval = self.discovery.interval;
        config.peer_ttl = self.discovery.peer_ttl;
        config
    }

    /// WebSocket transport honouring `connect_timeout`.
    pub fn transport(&self) -> WsTransport {
        WsTransport::new(self.connect_timeout)
    }

    pub fn static_peer_source(&self) -> StaticPeerSource {
        StaticPeerSource::new(self.known_peers.iter().cloned())
    }

    /// Peer source for Federation: `known_peers`, the beacon table, or both
    /// chained when both are present.
    pub fn peer_source(&self, beacon: Option<Arc<BeaconPeerSource>>) -> Arc<dyn PeerSource> {
        let fixed: Arc<dyn PeerSource> = Arc::new(self.static_peer_source());
        match beacon {
            None => fixed,
            Some(beacon) if self.known_peers.is_empty() => beacon,
            Some(beacon) => Arc::new(ChainedPeerSource::new(vec![fixed, beacon as Arc<dyn PeerSource>])),
        }
    }

    /// Save the config as pretty JSON, creating parent directories.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| RouterError::Config(format!("Failed to create directory: {e}")))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .map_err(|e| RouterError::Config(format!("Failed to write config file: {e}")))
    }

    /// Load a config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| RouterError::Config(format!("Cannot read {}: {e}", path.display())))?;
        serde_json::from_str(&data)
            .map_err(|e| RouterError::Config(format!("Invalid config {}: {e}", path.display())))
    }

    /// Load config from a JSON file, or return defaults if it is missing or
    /// unreadable.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match Self::load(path) {
                Ok(config) => return config,
                Err(e) => tracing::warn!("{e}; using defaults"),
            }
        }
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S: Serializer>(addr: &SocketAddr, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SocketAddr, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RouterConfig::default();
        assert!(config.router_id.starts_with("router-"));
        assert_eq!(config.ttl, Duration::from_secs(30));
        assert_eq!(config.sweep_interval, Duration::from_secs(10));
        assert_eq!(config.propagate_interval, Duration::from_secs(5));
        assert_eq!(config.listen_addr.port(), 30020);
        assert!(!config.discovery.enabled);
        assert_eq!(config.discovery.port, 5353);
    }

    #[test]
    fn test_durations_serialize_as_millis() {
        let mut config = RouterConfig::default();
        config.ttl = Duration::from_millis(1_500);
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["ttl"], 1_500);
        assert_eq!(json["discovery"]["interval"], 5_000);
        assert_eq!(json["listenAddr"], "0.0.0.0:30020");
    }

    #[test]
    fn test_partial_file_takes_defaults() {
        let config: RouterConfig =
            serde_json::from_str(r#"{"routerId":"router-1","ttl":1000}"#).unwrap();
        assert_eq!(config.router_id, "router-1");
        assert_eq!(config.ttl, Duration::from_secs(1));
        assert_eq!(config.sweep_interval, Duration::from_secs(10));
        assert!(config.known_peers.is_empty());
    }

    #[test]
    fn test_derived_configs() {
        let mut config = RouterConfig::default();
        config.router_id = "router-1".into();
        config.ttl = Duration::from_secs(12);
        config.discovery.advertise_addr = Some("10.0.0.1:30020".into());
        config.discovery.proto = Proto::Ws;

        assert_eq!(config.routing_config().ttl, Duration::from_secs(12));
        assert_eq!(config.federation_config().router_id, "router-1");

        let beacon = config.beacon_config().beacon();
        assert_eq!(beacon.host_id, "router-1");
        assert_eq!(beacon.addr, "10.0.0.1:30020");
        assert_eq!(beacon.proto, Proto::Ws);
        assert_eq!(beacon.ttl, 30_000);
    }

    #[test]
    fn test_beacon_addr_defaults_to_listen_addr() {
        let mut config = RouterConfig::default();
        config.listen_addr = "10.0.0.5:4000".parse().unwrap();
        assert_eq!(config.beacon_config().addr, "10.0.0.5:4000");
    }

    #[test]
    fn test_transport_uses_connect_timeout() {
        let mut config = RouterConfig::default();
        config.connect_timeout = Duration::from_millis(750);
        assert_eq!(config.transport().timeout(), Duration::from_millis(750));
    }

    #[tokio::test]
    async fn test_peer_source_from_known_peers() {
        let mut config = RouterConfig::default();
        config.router_id = "router-1".into();
        config.known_peers = vec!["tcp://router-2:30020".into()];

        let peers = config.peer_source(None).get_peers().await.unwrap();
        assert_eq!(peers, vec!["tcp://router-2:30020"]);
    }

    #[tokio::test]
    async fn test_peer_source_chains_beacons() {
        let mut config = RouterConfig::default();
        config.router_id = "router-1".into();
        config.discovery.advertise_addr = Some("10.0.0.1:30020".into());
        let beacon = Arc::new(BeaconPeerSource::new(config.beacon_config()));
        beacon.observe(BeaconConfig::new("router-3", "10.0.0.3:30020", Proto::Tcp).beacon());

        let only_beacons = config.peer_source(Some(Arc::clone(&beacon)));
        assert_eq!(
            only_beacons.get_peers().await.unwrap(),
            vec!["tcp://router-3@10.0.0.3:30020"]
        );

        config.known_peers = vec!["tcp://router-2:30020".into()];
        let both = config.peer_source(Some(beacon));
        assert_eq!(
            both.get_peers().await.unwrap(),
            vec!["tcp://router-2:30020", "tcp://router-3@10.0.0.3:30020"]
        );
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("router.json");

        let mut original = RouterConfig::default();
        original.router_id = "router-7".into();
        original.known_peers = vec!["tcp://router-2:30020".into()];
        original.save_to_file(&path).unwrap();

        let loaded = RouterConfig::load_or_default(&path);
        assert_eq!(loaded, original);
    }

    #[test]
    fn test_corrupt_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("router.json");
        std::fs::write(&path, "{ nope").unwrap();

        assert!(matches!(RouterConfig::load(&path), Err(RouterError::Config(_))));
        let fallback = RouterConfig::load_or_default(&path);
        assert_eq!(fallback.ttl, Duration::from_secs(30));
    }

    #[test]
    fn test_config_load_missing_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = RouterConfig::load_or_default(&dir.path().join("absent.json"));
        assert!(config.known_peers.is_empty());
    }
}
