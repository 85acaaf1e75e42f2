//! Endpoint records, announcements and directory events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata key marking an endpoint as learned from a peer router.
/// Its value is the peer id. Absence means the endpoint is local.
pub const FEDERATION_SOURCE: &str = "federationSource";

/// Open key/value bag attached to an endpoint.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// An endpoint announcement, as passed to `RoutingServer::announce` and as
/// carried between federated routers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    pub id: String,
    /// Transport kind (inproc, worker, external, pty, tcp, ...). Opaque.
    #[serde(rename = "type")]
    pub kind: String,
    /// Logical address clients resolve against.
    pub coordinates: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl Announcement {
    pub fn new(
        id: impl Into<String>,
        kind: impl Into<String>,
        coordinates: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            coordinates: coordinates.into(),
            metadata: None,
        }
    }

    /// Builder-style metadata setter.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata
            .get_or_insert_with(Metadata::new)
            .insert(key.into(), value.into());
        self
    }

    /// Peer id this announcement was learned from, if any.
    pub fn federation_source(&self) -> Option<&str> {
        federation_source(self.metadata.as_ref())
    }
}

/// A directory record: one physical binding announced under a unique id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub coordinates: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    /// Set on first announcement, never changed afterwards.
    pub announced_at: DateTime<Utc>,
    /// Refreshed on every re-announcement.
    pub updated_at: DateTime<Utc>,
    /// Always `updated_at + ttl`.
    pub expires_at: DateTime<Utc>,
}

impl Endpoint {
    /// Peer id this endpoint was learned from, if any.
    pub fn federation_source(&self) -> Option<&str> {
        federation_source(self.metadata.as_ref())
    }

    /// True when the endpoint is owned by this router.
    pub fn is_local(&self) -> bool {
        self.federation_source().is_none()
    }

    /// Strip the timestamps back to the announcement that produced this record.
    pub fn to_announcement(&self) -> Announcement {
        Announcement {
            id: self.id.clone(),
            kind: self.kind.clone(),
            coordinates: self.coordinates.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

fn federation_source(metadata: Option<&Metadata>) -> Option<&str> {
    metadata
        .and_then(|m| m.get(FEDERATION_SOURCE))
        .and_then(|v| v.as_str())
}

/// Change notification delivered to directory subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RouterEvent {
    /// A new id was announced.
    Added {
        endpoint: Endpoint,
        timestamp: DateTime<Utc>,
    },
    /// An existing id was re-announced.
    Updated {
        endpoint: Endpoint,
        timestamp: DateTime<Utc>,
    },
    /// The owner withdrew the endpoint.
    Removed {
        endpoint: Endpoint,
        timestamp: DateTime<Utc>,
    },
    /// The sweeper evicted the endpoint after its TTL elapsed. This is the
    /// failover trigger, distinct from an explicit withdrawal.
    StaleExpired {
        endpoint: Endpoint,
        timestamp: DateTime<Utc>,
    },
}

impl RouterEvent {
    pub fn endpoint(&self) -> &Endpoint {
        match self {
            Self::Added { endpoint, .. }
            | Self::Updated { endpoint, .. }
            | Self::Removed { endpoint, .. }
            | Self::StaleExpired { endpoint, .. } => endpoint,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Added { timestamp, .. }
            | Self::Updated { timestamp, .. }
            | Self::Removed { timestamp, .. }
            | Self::StaleExpired { timestamp, .. } => *timestamp,
        }
    }

    /// Short name used in diagnostics.
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Added { .. } => "added",
            Self::Updated { .. } => "updated",
            Self::Removed { .. } => "removed",
            Self::StaleExpired { .. } => "staleExpired",
        }
    }
}
