//! Peer table: the routers this instance federates with.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A federated peer router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerConnection {
    /// Identifier derived from the peer URL (see [`extract_peer_id`]).
    pub peer_id: String,
    /// Address as reported by the peer source.
    pub url: String,
    /// Last time an announcement from this peer was received (or when it was
    /// discovered, if nothing arrived yet).
    pub last_seen: DateTime<Utc>,
    /// Inactive peers are skipped by propagation.
    pub active: bool,
}

/// Registry of known peers keyed by peer id.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<String, PeerConnection>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a newly discovered peer. Returns `false` if the id was
    /// already known; the existing entry is left untouched.
    pub fn insert_new(&mut self, peer_id: &str, url: &str, now: DateTime<Utc>) -> bool {
        if self.peers.contains_key(peer_id) {
            return false;
        }
        self.peers.insert(
            peer_id.to_string(),
            PeerConnection {
                peer_id: peer_id.to_string(),
                url: url.to_string(),
                last_seen: now,
                active: true,
            },
        );
        true
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerConnection> {
        self.peers.get(peer_id)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Refresh `last_seen` for a known peer. Unknown peers are ignored.
    pub fn touch(&mut self, peer_id: &str, now: DateTime<Utc>) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(peer) => {
                peer.last_seen = now;
                true
            }
            None => false,
        }
    }

    pub fn set_active(&mut self, peer_id: &str, active: bool) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.active = active;
        }
    }

    /// Snapshot of the active peers, ordered by id.
    pub fn list_active(&self) -> Vec<PeerConnection> {
        let mut active: Vec<_> = self.peers.values().filter(|p| p.active).cloned().collect();
        active.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        active
    }

    /// Snapshot of every peer, ordered by id.
    pub fn list_all(&self) -> Vec<PeerConnection> {
        let mut all: Vec<_> = self.peers.values().cloned().collect();
        all.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        all
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}

/// Derive a peer id from a peer URL.
///
/// For `tcp://`, `ws://` and `wss://` URLs this is the user part when one
/// is present (`tcp://router-1@10.0.0.7:30020` -> `router-1`, the form beacon
/// discovery produces), otherwise the host (`tcp://router-1:30020` ->
/// `router-1`). Anything else is used verbatim.
pub fn extract_peer_id(url: &str) -> String {
    if let Ok(parsed) = url::Url::parse(url) {
        if matches!(parsed.scheme(), "tcp" | "ws" | "wss") {
            if !parsed.username().is_empty() {
                return parsed.username().to_string();
            }
            if let Some(host) = parsed.host_str() {
                if !host.is_empty() {
                    return host.to_string();
                }
            }
        }
    }
    url.to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
