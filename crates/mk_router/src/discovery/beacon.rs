//! Discovery beacon record and codec.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default beacon TTL in milliseconds, used when a beacon omits it.
pub const DEFAULT_BEACON_TTL_MS: u64 = 30_000;

fn default_ttl() -> u64 {
    DEFAULT_BEACON_TTL_MS
}

/// Transport a router accepts federation traffic on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Proto {
    Tcp,
    Ws,
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Ws => write!(f, "ws"),
        }
    }
}

/// Self-description a router broadcasts on the LAN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Beacon {
    pub host_id: String,
    /// Reachable `host:port`.
    pub addr: String,
    pub proto: Proto,
    pub supported_versions: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespaces: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caps: Option<Vec<String>>,
    /// Milliseconds the advertisement stays valid without a refresh.
    #[serde(default = "default_ttl")]
    pub ttl: u64,
}

/// A peer learned from beacons.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub host_id: String,
    pub addr: String,
    pub proto: Proto,
    pub supported_versions: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespaces: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caps: Option<Vec<String>>,
    pub ttl: u64,
    pub discovered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl PeerInfo {
    /// URL handed to Federation, e.g. `tcp://router-7@10.0.0.7:30020`. The
    /// host id rides in the user part; see [`crate::peer::extract_peer_id`].
    pub fn url(&self) -> String {
        format!("{}://{}@{}", self.proto, self.host_id, self.addr)
    }

    /// Whether the entry is still within its advertised TTL at `now`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        (now - self.last_seen).num_milliseconds() <= self.ttl as i64
    }
}

/// JSON encoding of [`Beacon`] datagrams.
pub struct BeaconCodec;

impl BeaconCodec {
    pub fn encode(beacon: &Beacon) -> Vec<u8> {
        serde_json::to_vec(beacon).unwrap_or_default()
    }

    /// Decode a datagram. Anything malformed or incomplete yields `None`.
    pub fn decode(bytes: &[u8]) -> Option<Beacon> {
        let beacon: Beacon = serde_json::from_slice(bytes).ok()?;
        if beacon.host_id.is_empty() || beacon.addr.is_empty() {
            return None;
        }
        Some(beacon)
    }

    /// Build a table entry from a beacon seen at `now`.
    pub fn to_peer_info(beacon: Beacon, now: DateTime<Utc>) -> PeerInfo {
        PeerInfo {
            host_id: beacon.host_id,
            addr: beacon.addr,
            proto: beacon.proto,
            supported_versions: beacon.supported_versions,
            namespaces: beacon.namespaces,
            caps: beacon.caps,
            ttl: beacon.ttl,
            discovered_at: now,
            last_seen: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
