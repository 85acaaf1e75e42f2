//! Diagnostics sink: structured engine events injected at construction.
//!
//! Every component takes an `Arc<dyn DiagnosticSink>` rather than logging
//! through a process-wide hook, so tests can observe exactly what the engine
//! reported. [`TracingSink`] is the production default and forwards to
//! `tracing`.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Severity of a diagnostic event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

/// A single structured diagnostic event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Emitting component (`router`, `federation`, `discovery`, `transport`).
    pub component: String,
    /// Dotted event name, e.g. `sweep.stale`.
    pub event: String,
    pub level: Level,
    /// Free-form structured context.
    pub fields: serde_json::Value,
}

impl Diagnostic {
    pub fn new(
        component: impl Into<String>,
        event: impl Into<String>,
        level: Level,
        fields: serde_json::Value,
    ) -> Self {
        Self {
            component: component.into(),
            event: event.into(),
            level,
            fields,
        }
    }
}

/// Receiver of diagnostic events.
pub trait DiagnosticSink: Send + Sync {
    fn emit(&self, diagnostic: Diagnostic);
}

/// Shared handle used by the engine components.
pub type SharedSink = Arc<dyn DiagnosticSink>;

/// Small helper so call sites stay one line.
pub(crate) fn emit(
    sink: &SharedSink,
    component: &str,
    event: &str,
    level: Level,
    fields: serde_json::Value,
) {
    sink.emit(Diagnostic::new(component, event, level, fields));
}

/// Forwards diagnostics to `tracing` at the matching level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn emit(&self, d: Diagnostic) {
        let component = d.component.as_str();
        let event = d.event.as_str();
        match d.level {
            Level::Debug => debug!(component, event, fields = %d.fields, "router diagnostic"),
            Level::Info => info!(component, event, fields = %d.fields, "router diagnostic"),
            Level::Warn => warn!(component, event, fields = %d.fields, "router diagnostic"),
            Level::Error => error!(component, event, fields = %d.fields, "router diagnostic"),
        }
    }
}

/// Default sink for components constructed without one.
pub fn tracing_sink() -> SharedSink {
    Arc::new(TracingSink)
}

/// Records every diagnostic in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<Diagnostic>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn events(&self) -> Vec<Diagnostic> {
        self.events.lock().clone()
    }

    /// Whether an event with this component and name was recorded.
    pub fn contains(&self, component: &str, event: &str) -> bool {
        self.events
            .lock()
            .iter()
            .any(|d| d.component == component && d.event == event)
    }

    /// Count of recorded events with this component and name.
    pub fn count(&self, component: &str, event: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|d| d.component == component && d.event == event)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl DiagnosticSink for MemorySink {
    fn emit(&self, diagnostic: Diagnostic) {
        self.events.lock().push(diagnostic);
    }
}
