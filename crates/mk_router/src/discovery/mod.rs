//! Peer sources: where Federation gets its list of peer routers.
//!
//! The engine only needs a point-in-time list of peer addresses on demand.
//! [`StaticPeerSource`] serves a configured list; [`BeaconPeerSource`] keeps a
//! live table fed by UDP multicast beacons. [`ChainedPeerSource`] merges
//! several sources.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::error::Result;

pub mod beacon;
pub mod multicast;

pub use beacon::{Beacon, BeaconCodec, PeerInfo, Proto};
pub use multicast::{BeaconConfig, BeaconPeerSource};

/// Supplies peer router addresses.
#[async_trait]
pub trait PeerSource: Send + Sync {
    /// Current peer addresses, e.g. `tcp://router-2:30020`.
    async fn get_peers(&self) -> Result<Vec<String>>;
}

/// A fixed list of peers from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticPeerSource {
    peers: Vec<String>,
}

impl StaticPeerSource {
    pub fn new<I, S>(peers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            peers: peers.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl PeerSource for StaticPeerSource {
    async fn get_peers(&self) -> Result<Vec<String>> {
        Ok(self.peers.clone())
    }
}

/// Concatenates several sources, dropping repeated URLs. A failing source
/// is skipped; the call fails only when every source does.
#[derive(Clone, Default)]
pub struct ChainedPeerSource {
    sources: Vec<Arc<dyn PeerSource>>,
}

impl ChainedPeerSource {
    pub fn new(sources: Vec<Arc<dyn PeerSource>>) -> Self {
        Self { sources }
    }
}

#[async_trait]
impl PeerSource for ChainedPeerSource {
    async fn get_peers(&self) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        let mut peers = Vec::new();
        let mut last_error = None;
        let mut any_ok = self.sources.is_empty();

        for source in &self.sources {
            match source.get_peers().await {
                Ok(urls) => {
                    any_ok = true;
                    peers.extend(urls.into_iter().filter(|url| seen.insert(url.clone())));
                }
                Err(e) => {
                    warn!("Peer source failed: {e}");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if !any_ok => Err(e),
            _ => Ok(peers),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
