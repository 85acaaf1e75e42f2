//! Router error types.

use std::time::Duration;

/// Errors that can occur in the mk_router crate.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// `announce` was called without an endpoint id.
    #[error("announcement requires a non-empty \"id\"")]
    MissingId,

    /// A peer message claimed to come from this router.
    #[error("Refusing announcements from self ({0})")]
    SelfLoop(String),

    /// The peer source could not produce a peer list.
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// A transport-level error (WebSocket connect/send/receive).
    #[error("Transport error: {0}")]
    Transport(String),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An operation timed out.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// A background task was requested outside of a Tokio runtime.
    #[error("No Tokio runtime available to spawn background task")]
    NoRuntime,

    /// Configuration could not be read or written.
    #[error("Config error: {0}")]
    Config(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RouterError>;
