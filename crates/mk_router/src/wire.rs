//! Router-to-router wire messages.
//!
//! One WebSocket text frame carries one [`PeerMessage`] as JSON. Timestamps
//! are not sent with announcements: the receiver stamps them itself and
//! recomputes `expiresAt` from its own TTL.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::endpoint::Announcement;

/// Current wire protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// What a frame carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerMessageKind {
    /// A batch of locally-owned endpoints from the sending router.
    Announce,
}

/// A router-to-router message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerMessage {
    /// Unique message id (UUID v4), for log correlation.
    pub id: String,
    pub version: u32,
    pub kind: PeerMessageKind,
    /// Router id of the sender; becomes `federationSource` on the receiver.
    pub from: String,
    #[serde(default)]
    pub announcements: Vec<Announcement>,
    pub sent_at: DateTime<Utc>,
}

impl PeerMessage {
    /// Build an announce batch from `from`.
    pub fn announce(from: impl Into<String>, announcements: Vec<Announcement>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            version: PROTOCOL_VERSION,
            kind: PeerMessageKind::Announce,
            from: from.into(),
            announcements,
            sent_at: Utc::now(),
        }
    }

    /// Serialize for transmission.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a received frame.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
