//! Heartbeat-based detection of silently dead connections.
//!
//! Every monitored connection is pinged once per period. A connection that
//! leaves [`MAX_LOST_PINGS`] pings unanswered is torn down, so a dead peer is
//! detected within `MAX_LOST_PINGS × PING_PERIOD` at worst.

use dashmap::DashMap;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_transport::{Connection, ConnectionId};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::scheduler::{RepeatingAction, SchedulerHandle, TaskId};

/// Interval between liveness passes.
pub const PING_PERIOD: Duration = Duration::from_secs(15);

/// Unanswered pings after which a connection is torn down.
pub const MAX_LOST_PINGS: u32 = 3;

/// Timer jitter accepted when deciding whether a full period elapsed.
const PERIOD_TOLERANCE: Duration = Duration::from_millis(250);

/// Liveness settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessConfig {
    pub period: Duration,
    pub max_lost_pings: u32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            period: PING_PERIOD,
            max_lost_pings: MAX_LOST_PINGS,
        }
    }
}

impl LivenessConfig {
    /// Worst-case time until a dead connection is torn down.
    #[must_use]
    pub fn loss_window(&self) -> Duration {
        self.period * self.max_lost_pings
    }

    /// Lifetime of an online lease refreshed by this heartbeat: the loss
    /// window plus three periods of margin.
    #[must_use]
    pub fn online_lease_ttl(&self) -> Duration {
        self.period * self.max_lost_pings.saturating_add(3)
    }
}

/// Outcome of tearing down an unresponsive connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// This pass closed the connection.
    Disconnected,
    /// The transport had already lost it.
    AlreadyGone,
}

/// What one pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassReport {
    /// The pass was skipped because a full period had not elapsed.
    pub skipped: bool,
    pub pinged: usize,
    pub torn_down: Vec<(ConnectionId, Teardown)>,
}

/// The set of monitored connections and the pass logic.
pub struct LivenessMonitor {
    connections: DashMap<ConnectionId, Arc<dyn Connection>>,
    last_pass: Mutex<Option<Instant>>,
    config: LivenessConfig,
}

impl LivenessMonitor {
    #[must_use]
    pub fn new(config: LivenessConfig) -> Self {
        Self {
            connections: DashMap::new(),
            last_pass: Mutex::new(None),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> LivenessConfig {
        self.config
    }

    /// Start monitoring a connection. Callable from any thread.
    pub fn add(&self, connection: Arc<dyn Connection>) {
        debug!(
            connection = %connection.id(),
            addr = ?connection.remote_addr(),
            "Monitoring connection"
        );
        self.connections.insert(connection.id(), connection);
    }

    /// Stop monitoring a connection if present.
    pub fn remove(&self, id: ConnectionId) -> bool {
        let removed = self.connections.remove(&id).is_some();
        if removed {
            debug!(connection = %id, "No longer monitoring connection");
        }
        removed
    }

    #[must_use]
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Run one liveness pass at `now`.
    pub fn run_pass(&self, now: Instant) -> PassReport {
        let mut report = PassReport::default();

        {
            let mut last_pass = match self.last_pass.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(last) = *last_pass {
                let elapsed = now.saturating_duration_since(last);
                if elapsed + PERIOD_TOLERANCE < self.config.period {
                    debug!(elapsed_ms = elapsed.as_millis() as u64, "Ignoring early liveness pass");
                    report.skipped = true;
                    return report;
                }
            }
            *last_pass = Some(now);
        }

        // Snapshot so no lock is held while talking to connections.
        let snapshot: Vec<Arc<dyn Connection>> =
            self.connections.iter().map(|entry| Arc::clone(entry.value())).collect();

        for connection in snapshot {
            let liveness = connection.liveness();
            if liveness.take_pong() {
                liveness.reset_lost_pings();
            }

            if liveness.lost_pings() >= self.config.max_lost_pings {
                let id = connection.id();
                info!(
                    connection = %id,
                    addr = ?connection.remote_addr(),
                    "Too many lost pings, killing connection"
                );

                let outcome = if connection.disconnect() {
                    Teardown::Disconnected
                } else {
                    warn!(connection = %id, "Connection was already dead, getting rid of it");
                    Teardown::AlreadyGone
                };
                self.remove(id);
                report.torn_down.push((id, outcome));
                continue;
            }

            if let Err(e) = connection.send_ping() {
                debug!(connection = %connection.id(), "Ping failed: {}", e);
            }
            liveness.increment_lost_pings();
            report.pinged += 1;
        }

        report
    }

    /// Register the periodic pass with a scheduler. `on_teardown` runs on the
    /// scheduler thread for every connection the pass tore down.
    pub fn start<S: 'static>(
        self: &Arc<Self>,
        scheduler: &SchedulerHandle<S>,
        mut on_teardown: impl FnMut(&mut S, ConnectionId, Teardown) + Send + 'static,
    ) -> TaskId {
        let monitor = Arc::clone(self);
        let period = self.config.period;
        RepeatingAction::new("Pinger", period, period, move |state: &mut S, tick| {
            let report = monitor.run_pass(tick.current_time());
            for (id, outcome) in report.torn_down {
                on_teardown(state, id, outcome);
            }
            ControlFlow::Continue(())
        })
        .start(scheduler)
    }
}

impl Default for LivenessMonitor {
    fn default() -> Self {
        Self::new(LivenessConfig::default())
    }
}
