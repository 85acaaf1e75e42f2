//! Read-only directory inspection for tooling.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::to_delta;
use crate::endpoint::Endpoint;
use crate::routing::RoutingServer;

/// Health of an endpoint relative to its TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LivenessStatus {
    /// Refreshed within the first half of its TTL.
    Healthy,
    /// More than half the TTL has passed without a refresh.
    Stale,
    /// Past `expires_at`; the next sweep removes it.
    Expired,
}

impl LivenessStatus {
    pub fn classify(endpoint: &Endpoint, ttl: std::time::Duration, now: DateTime<Utc>) -> Self {
        if now > endpoint.expires_at {
            Self::Expired
        } else if now - endpoint.updated_at > to_delta(ttl) / 2 {
            Self::Stale
        } else {
            Self::Healthy
        }
    }
}

/// Narrowing applied by [`inspect`]. Empty matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EndpointFilter {
    /// Exact match on the endpoint `type`.
    pub kind: Option<String>,
    /// Exact match on one metadata entry.
    pub metadata: Option<(String, serde_json::Value)>,
}

impl EndpointFilter {
    pub fn kind(kind: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            metadata: None,
        }
    }

    pub fn metadata(key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            kind: None,
            metadata: Some((key.into(), value.into())),
        }
    }

    pub fn matches(&self, endpoint: &Endpoint) -> bool {
        if let Some(kind) = &self.kind {
            if endpoint.kind != *kind {
                return false;
            }
        }
        if let Some((key, value)) = &self.metadata {
            let found = endpoint.metadata.as_ref().and_then(|m| m.get(key));
            if found != Some(value) {
                return false;
            }
        }
        true
    }
}

/// An endpoint annotated with its liveness at inspection time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointView {
    #[serde(flatten)]
    pub endpoint: Endpoint,
    pub status: LivenessStatus,
    /// Milliseconds until `expires_at`; negative once expired.
    pub expires_in_ms: i64,
}

/// Snapshot the directory through `filter`, sorted by coordinates then id.
pub fn inspect(router: &RoutingServer, filter: &EndpointFilter, now: DateTime<Utc>) -> Vec<EndpointView> {
    let ttl = router.ttl();
    let mut views: Vec<EndpointView> = router
        .list()
        .into_iter()
        .filter(|ep| filter.matches(ep))
        .map(|endpoint| {
            let status = LivenessStatus::classify(&endpoint, ttl, now);
            let expires_in: TimeDelta = endpoint.expires_at - now;
            EndpointView {
                endpoint,
                status,
                expires_in_ms: expires_in.num_milliseconds(),
            }
        })
        .collect();

    views.sort_by(|a, b| {
        a.endpoint
            .coordinates
            .cmp(&b.endpoint.coordinates)
            .then_with(|| a.endpoint.id.cmp(&b.endpoint.id))
    });
    views
}
