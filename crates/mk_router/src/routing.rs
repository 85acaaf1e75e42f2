//! Routing server: the per-process endpoint directory.
//!
//! Owns the map from endpoint id to [`Endpoint`], the TTL/sweep liveness
//! protocol, path-preference resolution and synchronous event subscription.
//! Knows nothing about peers; see [`crate::federation`] for that.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use crate::clock::{Clock, SystemClock, to_delta};
use crate::diagnostics::{Level, SharedSink, emit, tracing_sink};
use crate::endpoint::{Announcement, Endpoint, RouterEvent};
use crate::error::{Result, RouterError};

const COMPONENT: &str = "router";

/// Directory timing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingConfig {
    /// How long an endpoint stays live without a re-announcement.
    pub ttl: Duration,
    /// Period of the background sweeper.
    pub sweep_interval: Duration,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_millis(30_000),
            sweep_interval: Duration::from_millis(10_000),
        }
    }
}

/// Counters describing sweeper activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweeperMetrics {
    pub total_sweeps: u64,
    pub total_removed: u64,
    pub last_sweep_at: Option<DateTime<Utc>>,
}

/// Observer callback for directory events.
pub type EventCallback = Arc<dyn Fn(&RouterEvent) + Send + Sync>;

/// Identifies one registered observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Disposer returned by [`RoutingServer::subscribe`].
///
/// Dropping the handle does not unsubscribe; call
/// [`Subscription::unsubscribe`] explicitly.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    server: Weak<RoutingServer>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Remove the observer. A no-op if the server is gone.
    pub fn unsubscribe(self) {
        if let Some(server) = self.server.upgrade() {
            server.unsubscribe(self.id);
        }
    }
}

struct Directory {
    endpoints: HashMap<String, Endpoint>,
    subscribers: Vec<(SubscriptionId, EventCallback)>,
    next_subscription: u64,
    metrics: SweeperMetrics,
}

/// The endpoint directory for a single router instance.
///
/// Shared as `Arc<RoutingServer>`: the sweeper task and subscription handles
/// hold weak references back to it.
pub struct RoutingServer {
    config: RoutingConfig,
    clock: Arc<dyn Clock>,
    diagnostics: SharedSink,
    state: Mutex<Directory>,
    /// Held across each mutation and its event delivery so subscribers see
    /// events in mutation order. Re-entrant: a callback may announce.
    dispatch: ReentrantMutex<()>,
    sweeper: Mutex<Option<broadcast::Sender<()>>>,
}

impl RoutingServer {
    /// Create a directory using the system clock and tracing diagnostics.
    pub fn new(config: RoutingConfig) -> Arc<Self> {
        Self::with_parts(config, Arc::new(SystemClock), tracing_sink())
    }

    /// Create a directory driven by a custom clock.
    pub fn with_clock(config: RoutingConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        Self::with_parts(config, clock, tracing_sink())
    }

    /// Create a directory with every collaborator supplied.
    pub fn with_parts(
        config: RoutingConfig,
        clock: Arc<dyn Clock>,
        diagnostics: SharedSink,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            clock,
            diagnostics,
            state: Mutex::new(Directory {
                endpoints: HashMap::new(),
                subscribers: Vec::new(),
                next_subscription: 0,
                metrics: SweeperMetrics::default(),
            }),
            dispatch: ReentrantMutex::new(()),
            sweeper: Mutex::new(None),
        })
    }

    pub fn ttl(&self) -> Duration {
        self.config.ttl
    }

    pub fn sweep_interval(&self) -> Duration {
        self.config.sweep_interval
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn endpoint_count(&self) -> usize {
        self.state.lock().endpoints.len()
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Insert or refresh an endpoint.
    ///
    /// A repeated id is a heartbeat: `announced_at` is kept, `updated_at`
    /// advances and `expires_at` is recomputed. Emits `Added` or `Updated`.
    pub fn announce(&self, announcement: Announcement) -> Result<()> {
        if announcement.id.is_empty() {
            return Err(RouterError::MissingId);
        }

        let _order = self.dispatch.lock();
        let ttl = to_delta(self.config.ttl);
        let now = self.clock.now();

        let (event, subscribers) = {
            let mut dir = self.state.lock();
            let previous = dir.endpoints.get(&announcement.id);

            let (announced_at, updated_at, is_new) = match previous {
                // Never let a heartbeat stand still or move backwards.
                Some(prev) if now <= prev.updated_at => (
                    prev.announced_at,
                    prev.updated_at + TimeDelta::milliseconds(1),
                    false,
                ),
                Some(prev) => (prev.announced_at, now, false),
                None => (now, now, true),
            };

            let endpoint = Endpoint {
                id: announcement.id,
                kind: announcement.kind,
                coordinates: announcement.coordinates,
                metadata: announcement.metadata,
                announced_at,
                updated_at,
                expires_at: updated_at + ttl,
            };

            emit(
                &self.diagnostics,
                COMPONENT,
                "announce",
                Level::Debug,
                serde_json::json!({
                    "id": endpoint.id,
                    "type": endpoint.kind,
                    "coordinates": endpoint.coordinates,
                    "metadata": endpoint.metadata,
                }),
            );

            dir.endpoints.insert(endpoint.id.clone(), endpoint.clone());
            let event = if is_new {
                RouterEvent::Added { endpoint, timestamp: updated_at }
            } else {
                RouterEvent::Updated { endpoint, timestamp: updated_at }
            };
            (event, snapshot_subscribers(&dir))
        };

        self.deliver(&subscribers, &event);
        Ok(())
    }

    /// Remove an endpoint. Unknown ids are ignored.
    pub fn withdraw(&self, id: &str) {
        if id.is_empty() {
            return;
        }

        let _order = self.dispatch.lock();
        let (removed, subscribers) = {
            let mut dir = self.state.lock();
            let removed = dir.endpoints.remove(id);
            (removed, snapshot_subscribers(&dir))
        };

        if let Some(endpoint) = removed {
            emit(
                &self.diagnostics,
                COMPONENT,
                "withdraw",
                Level::Debug,
                serde_json::json!({ "id": id }),
            );
            let event = RouterEvent::Removed {
                endpoint,
                timestamp: self.clock.now(),
            };
            self.deliver(&subscribers, &event);
        }
    }

    /// Evict every endpoint whose TTL has elapsed. Returns how many were
    /// removed; each removal emits `StaleExpired`.
    pub fn sweep(&self) -> usize {
        let _order = self.dispatch.lock();
        let ttl = to_delta(self.config.ttl);
        let now = self.clock.now();

        let (stale, remaining, subscribers) = {
            let mut dir = self.state.lock();
            let stale_ids: Vec<String> = dir
                .endpoints
                .values()
                .filter(|ep| now - ep.updated_at > ttl)
                .map(|ep| ep.id.clone())
                .collect();

            let mut stale = Vec::with_capacity(stale_ids.len());
            for id in stale_ids {
                if let Some(ep) = dir.endpoints.remove(&id) {
                    emit(
                        &self.diagnostics,
                        COMPONENT,
                        "sweep.stale",
                        Level::Warn,
                        serde_json::json!({
                            "id": ep.id,
                            "ageMs": (now - ep.updated_at).num_milliseconds(),
                            "ttlMs": self.config.ttl.as_millis() as u64,
                            "lastUpdated": ep.updated_at,
                        }),
                    );
                    stale.push(ep);
                }
            }

            dir.metrics.total_sweeps += 1;
            dir.metrics.total_removed += stale.len() as u64;
            dir.metrics.last_sweep_at = Some(now);
            (stale, dir.endpoints.len(), snapshot_subscribers(&dir))
        };

        let removed = stale.len();
        for endpoint in stale {
            emit(
                &self.diagnostics,
                COMPONENT,
                "sweep.removed",
                Level::Debug,
                serde_json::json!({ "id": endpoint.id }),
            );
            let event = RouterEvent::StaleExpired {
                endpoint,
                timestamp: now,
            };
            self.deliver(&subscribers, &event);
        }

        if removed > 0 {
            emit(
                &self.diagnostics,
                COMPONENT,
                "sweep.complete",
                Level::Info,
                serde_json::json!({ "removed": removed, "remaining": remaining }),
            );
        }
        removed
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Snapshot of every endpoint, including stale ones not yet swept.
    pub fn list(&self) -> Vec<Endpoint> {
        self.state.lock().endpoints.values().cloned().collect()
    }

    /// Snapshot of a single endpoint.
    pub fn get(&self, id: &str) -> Option<Endpoint> {
        self.state.lock().endpoints.get(id).cloned()
    }

    /// Best endpoint answering for `coordinates`, if any.
    pub fn resolve(&self, coordinates: &str) -> Option<Endpoint> {
        self.resolve_all(coordinates).into_iter().next()
    }

    /// Every endpoint answering for `coordinates`, best first.
    ///
    /// Local endpoints rank above federated ones regardless of age; within a
    /// locality class the most recently refreshed wins. Remaining ties break
    /// on id so the order is deterministic.
    pub fn resolve_all(&self, coordinates: &str) -> Vec<Endpoint> {
        let mut candidates: Vec<Endpoint> = self
            .state
            .lock()
            .endpoints
            .values()
            .filter(|ep| ep.coordinates == coordinates)
            .cloned()
            .collect();

        candidates.sort_by(|a, b| {
            b.is_local()
                .cmp(&a.is_local())
                .then_with(|| b.updated_at.cmp(&a.updated_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        candidates
    }

    pub fn sweeper_metrics(&self) -> SweeperMetrics {
        self.state.lock().metrics.clone()
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Register an observer. Events are delivered synchronously, in
    /// registration order, on the thread that caused them.
    pub fn subscribe<F>(self: &Arc<Self>, callback: F) -> Subscription
    where
        F: Fn(&RouterEvent) + Send + Sync + 'static,
    {
        let mut dir = self.state.lock();
        let id = SubscriptionId(dir.next_subscription);
        dir.next_subscription += 1;
        dir.subscribers.push((id, Arc::new(callback)));
        Subscription {
            id,
            server: Arc::downgrade(self),
        }
    }

    /// Remove an observer. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.state.lock().subscribers.retain(|(sid, _)| *sid != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    fn deliver(&self, subscribers: &[EventCallback], event: &RouterEvent) {
        for callback in subscribers {
            // One misbehaving observer must not starve the rest, nor abort a
            // sweep halfway through.
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                emit(
                    &self.diagnostics,
                    COMPONENT,
                    "subscriber.panic",
                    Level::Error,
                    serde_json::json!({
                        "event": event.kind_str(),
                        "id": event.endpoint().id,
                    }),
                );
            }
        }
    }

    // -----------------------------------------------------------------------
    // Sweeper
    // -----------------------------------------------------------------------

    /// Run [`sweep`](Self::sweep) every `sweep_interval` on the current Tokio
    /// runtime. Calling it again while running is a no-op.
    pub fn start_sweeper(self: &Arc<Self>) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| RouterError::NoRuntime)?;

        let mut slot = self.sweeper.lock();
        if slot.is_some() {
            return Ok(());
        }

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let period = self.config.sweep_interval.max(Duration::from_millis(1));
        let server = Arc::downgrade(self);

        runtime.spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => break,
                    _ = interval.tick() => {
                        let Some(server) = server.upgrade() else { break };
                        server.sweep();
                    }
                }
            }
        });

        *slot = Some(shutdown_tx);
        emit(
            &self.diagnostics,
            COMPONENT,
            "sweeper.start",
            Level::Debug,
            serde_json::json!({ "intervalMs": period.as_millis() as u64 }),
        );
        Ok(())
    }

    /// Stop the background sweeper. A no-op when it is not running, and safe
    /// to call from inside a sweep callback.
    pub fn stop_sweeper(&self) {
        if let Some(tx) = self.sweeper.lock().take() {
            let _ = tx.send(());
            emit(
                &self.diagnostics,
                COMPONENT,
                "sweeper.stop",
                Level::Debug,
                serde_json::json!({}),
            );
        }
    }

    pub fn is_sweeper_running(&self) -> bool {
        self.sweeper.lock().is_some()
    }
}

impl Drop for RoutingServer {
    fn drop(&mut self) {
        if let Some(tx) = self.sweeper.get_mut().take() {
            let _ = tx.send(());
        }
    }
}

fn snapshot_subscribers(dir: &Directory) -> Vec<EventCallback> {
    dir.subscribers.iter().map(|(_, cb)| Arc::clone(cb)).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
