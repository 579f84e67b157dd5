//! Channel process.
//!
//! A channel hosts players. It registers with center over the control link,
//! accepts clients once it holds a channel id, moves players to other
//! channels, and hands its whole world to a replacement registering under
//! its name.
//!
//! Everything in [`ChannelState`] runs on the scheduler thread.

pub mod control;
pub mod io;
pub mod migration;
pub mod session;
#[cfg(test)]
pub(crate) mod testing;

use anyhow::Result;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tether_core::{
    LivenessMonitor, PendingHandoffs, PresenceStore, RepeatingAction, SchedulerHandle, TaskId,
    Teardown, Tick,
};
use tether_protocol::{
    ip_to_wire, CharacterId, ControlMessage, Rates, WireMessage, PROTOCOL_VERSION,
};
use tether_transport::{Connection, ConnectionEvent, ConnectionId, Link};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use self::io::ChannelIo;
use self::migration::MigrationSession;
use self::session::ClientSession;
use crate::alert::AlertSink;
use crate::config::Config;
use crate::hooks::GameHooks;
use crate::http::{self, SharedStatus};
use crate::metrics;
use crate::services::Services;

/// Interval of the status refresh.
const STATUS_INTERVAL: Duration = Duration::from_secs(1);

/// Interval between kick rounds while draining.
const DRAIN_INTERVAL: Duration = Duration::from_millis(100);

/// Longest wait for clients to leave before exiting anyway.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Identity and timing of a channel process.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub name: String,
    pub public_ip: Ipv4Addr,
    pub port: u16,
    pub world_id: u8,
    pub world_name: String,
    pub auth_key: String,
    pub center_addr: SocketAddr,
    pub register_attempts: u32,
    pub register_wait: Duration,
    pub migration_timeout: Duration,
    pub migration_sweep: Duration,
    pub handoff_sweep: Duration,
    pub handoff_max_age: Duration,
    pub redirect_grace: Duration,
}

impl ChannelSettings {
    /// # Errors
    ///
    /// Returns an error if the center address is invalid.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            name: config.channel.name.clone(),
            public_ip: config.channel.public_ip,
            port: config.port,
            world_id: config.channel.world_id,
            world_name: config.channel.world_name.clone(),
            auth_key: config.channel.auth_key.clone(),
            center_addr: config.center_addr()?,
            register_attempts: config.channel.register_attempts.max(1),
            register_wait: Duration::from_millis(config.channel.register_wait_ms),
            migration_timeout: Duration::from_millis(config.migration.timeout_ms),
            migration_sweep: Duration::from_millis(config.migration.sweep_interval_ms),
            handoff_sweep: Duration::from_millis(config.handoff.sweep_interval_ms),
            handoff_max_age: Duration::from_millis(config.handoff.max_age_ms),
            redirect_grace: Duration::from_millis(config.handoff.redirect_grace_ms),
        })
    }
}

/// Wait between the end of the drain and exit, scaled by the work still
/// queued on the scheduler.
#[must_use]
pub fn shutdown_grace(backlog: usize) -> Duration {
    let backlog = u32::try_from(backlog).unwrap_or(u32::MAX);
    let scaled = Duration::from_millis(10).saturating_mul(backlog);
    scaled.clamp(Duration::from_millis(700), Duration::from_secs(3))
}

/// State of a channel process, owned by its scheduler.
pub struct ChannelState {
    settings: ChannelSettings,
    scheduler: SchedulerHandle<ChannelState>,
    io: Box<dyn ChannelIo>,
    game: Box<dyn GameHooks>,
    presence: Arc<PresenceStore>,
    liveness: Arc<LivenessMonitor>,
    alerts: Arc<dyn AlertSink>,
    status: SharedStatus,

    // Control link
    center: Option<Arc<dyn Link<ControlMessage>>>,
    dialing: bool,
    registered: bool,
    center_attempts: u32,
    watchdog: Option<TaskId>,
    expecting_center_change: bool,
    channel_id: Option<u8>,
    rates: Rates,
    reported_connections: Option<u32>,

    // Clients
    sessions: HashMap<ConnectionId, ClientSession>,
    characters: HashMap<CharacterId, ConnectionId>,
    handoffs: PendingHandoffs,
    reaper: Option<TaskId>,

    migration: MigrationSession,
    shutting_down: bool,
    drain_started: Option<Instant>,
}

impl ChannelState {
    pub fn new(
        settings: ChannelSettings,
        scheduler: SchedulerHandle<ChannelState>,
        io: Box<dyn ChannelIo>,
        game: Box<dyn GameHooks>,
        services: Services,
    ) -> Self {
        let handoffs = PendingHandoffs::new(settings.handoff_max_age);
        Self {
            settings,
            scheduler,
            io,
            game,
            presence: services.presence,
            liveness: services.liveness,
            alerts: services.alerts,
            status: services.status,
            center: None,
            dialing: false,
            registered: false,
            center_attempts: 0,
            watchdog: None,
            expecting_center_change: false,
            channel_id: None,
            rates: Rates::default(),
            reported_connections: None,
            sessions: HashMap::new(),
            characters: HashMap::new(),
            handoffs,
            reaper: None,
            migration: MigrationSession::new(),
            shutting_down: false,
            drain_started: None,
        }
    }

    #[must_use]
    pub fn channel_id(&self) -> Option<u8> {
        self.channel_id
    }

    /// Start the periodic tasks and contact center.
    pub fn boot(&mut self, _tick: &Tick) {
        info!(name = %self.settings.name, center = %self.settings.center_addr, "Starting channel");

        self.liveness.start(&self.scheduler, |state: &mut ChannelState, id, outcome| {
            state.on_liveness_teardown(id, outcome);
        });
        RepeatingAction::new(
            "Status",
            STATUS_INTERVAL,
            STATUS_INTERVAL,
            |state: &mut ChannelState, _: &Tick| {
                state.publish_status();
                ControlFlow::Continue(())
            },
        )
        .start(&self.scheduler);

        self.dial_center();
        self.start_center_watchdog();
    }

    fn dial_center(&mut self) {
        if self.dialing || self.shutting_down {
            return;
        }
        self.dialing = true;
        self.io.dial_center(self.settings.center_addr);
    }

    /// A control link to center is up.
    pub fn on_center_connected(&mut self, _tick: &Tick, link: Arc<dyn Link<ControlMessage>>) {
        self.dialing = false;
        if self.shutting_down {
            link.disconnect();
            return;
        }

        if let Some(previous) = self.center.take() {
            debug!(connection = %previous.id(), "Dropping previous center link");
            self.liveness.remove(previous.id());
            previous.disconnect();
        }

        info!(connection = %link.id(), addr = ?link.remote_addr(), "Connected to center");
        self.liveness.add(Arc::clone(&link).into_connection());
        self.center = Some(link);
        self.registered = false;

        self.send_to_center(&ControlMessage::ServerRequestAllocation {
            version: PROTOCOL_VERSION,
            name: self.settings.name.clone(),
            auth_key: self.settings.auth_key.clone(),
            public_ip: ip_to_wire(self.settings.public_ip),
            port: self.settings.port,
            world_id: self.settings.world_id,
            world_name: self.settings.world_name.clone(),
        });
    }

    pub fn on_center_connect_failed(&mut self, addr: SocketAddr, reason: &str) {
        self.dialing = false;
        warn!(%addr, "Could not reach center: {}", reason);
        self.start_center_watchdog();
    }

    pub fn on_center_event(&mut self, tick: &Tick, event: ConnectionEvent<ControlMessage>) {
        match event {
            ConnectionEvent::Message { id, message } => {
                if self.center.as_ref().map(|center| center.id()) != Some(id) {
                    debug!(
                        connection = %id,
                        kind = message.kind(),
                        "Message from a stale center link"
                    );
                    return;
                }
                self.handle_control(tick, message);
            }
            ConnectionEvent::Closed { id } => self.on_center_closed(id),
        }
    }

    fn on_center_closed(&mut self, id: ConnectionId) {
        self.liveness.remove(id);
        if self.center.as_ref().map(|center| center.id()) != Some(id) {
            debug!(connection = %id, "Previous center link closed");
            return;
        }
        self.center = None;
        self.registered = false;

        if self.shutting_down {
            return;
        }
        if self.expecting_center_change {
            info!("Center link closed during center change");
        } else {
            warn!("Lost connection to center");
            self.abort_migration(migration::MigrationError::CenterLost);
            self.dial_center();
        }
        self.start_center_watchdog();
    }

    /// Retry center until a channel id is assigned, or give up.
    fn start_center_watchdog(&mut self) {
        if self.watchdog.is_some() || self.shutting_down {
            return;
        }
        let wait = self.settings.register_wait;
        let id = RepeatingAction::new(
            "CenterWatchdog",
            wait,
            wait,
            |state: &mut ChannelState, _: &Tick| {
                state.center_watchdog_pass()
            },
        )
        .start(&self.scheduler);
        self.watchdog = Some(id);
    }

    fn center_watchdog_pass(&mut self) -> ControlFlow<()> {
        if self.registered || self.shutting_down {
            self.watchdog = None;
            self.center_attempts = 0;
            return ControlFlow::Break(());
        }

        self.center_attempts += 1;
        if self.center_attempts >= self.settings.register_attempts {
            self.watchdog = None;
            let attempts = self.center_attempts;
            if self.channel_id.is_none() {
                self.alerts.alert(&format!(
                    "{} could not obtain a channel id from center after {} attempts",
                    self.settings.name, attempts
                ));
                self.exit(1);
            } else {
                self.alerts.alert(&format!(
                    "{} lost center and could not reconnect after {} attempts",
                    self.settings.name, attempts
                ));
                self.begin_shutdown();
            }
            return ControlFlow::Break(());
        }

        debug!(attempt = self.center_attempts, "Waiting for center");
        if self.center.is_none() {
            self.dial_center();
        }
        ControlFlow::Continue(())
    }

    fn on_liveness_teardown(&mut self, id: ConnectionId, outcome: Teardown) {
        metrics::record_teardown(outcome);
        if self.center.as_ref().is_some_and(|center| center.id() == id) {
            self.on_center_closed(id);
        } else {
            self.on_client_closed(id);
        }
    }

    /// Start discarding hand-offs nobody claimed.
    fn start_handoff_reaper(&mut self) {
        if self.reaper.is_some() {
            return;
        }
        let sweep = self.settings.handoff_sweep;
        let id = RepeatingAction::new(
            "HandoffReaper",
            sweep,
            sweep,
            |state: &mut ChannelState, tick: &Tick| {
                for character_id in state.handoffs.reap(tick.current_time()) {
                    info!(character = character_id, "Discarding unclaimed hand-off");
                    metrics::record_handoff("reaped");
                }
                ControlFlow::Continue(())
            },
        )
        .start(&self.scheduler);
        self.reaper = Some(id);
    }

    /// Send on the control link. Returns `false` if nothing was sent.
    fn send_to_center(&self, message: &ControlMessage) -> bool {
        let Some(center) = &self.center else {
            debug!(kind = message.kind(), "No center link, dropping message");
            return false;
        };
        match center.send(message) {
            Ok(()) => true,
            Err(e) => {
                warn!(kind = message.kind(), "Failed to send to center: {}", e);
                false
            }
        }
    }

    /// Tell center how many clients are connected, if that changed.
    fn report_connections(&mut self) {
        metrics::set_client_connections(self.sessions.len());
        let count = u32::try_from(self.sessions.len()).unwrap_or(u32::MAX);
        if !self.registered || self.reported_connections == Some(count) {
            return;
        }
        if self.send_to_center(&ControlMessage::ServerSetConnectionsValue { count }) {
            self.reported_connections = Some(count);
        }
    }

    /// Kick every client, then exit once they are gone.
    pub fn begin_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        info!(players = self.characters.len(), "Shutting down");
        self.shutting_down = true;
        self.io.stop_listening();
        if let Some(id) = self.watchdog.take() {
            self.scheduler.cancel(id);
        }

        RepeatingAction::new(
            "ShutdownDrain",
            Duration::ZERO,
            DRAIN_INTERVAL,
            |state: &mut ChannelState, tick: &Tick| {
                state.drain_pass(tick)
            },
        )
        .start(&self.scheduler);
    }

    fn drain_pass(&mut self, tick: &Tick) -> ControlFlow<()> {
        let started = *self.drain_started.get_or_insert(tick.current_time());
        if !self.sessions.is_empty() && tick.since(started) < DRAIN_TIMEOUT {
            for session in self.sessions.values() {
                session.link.disconnect();
            }
            return ControlFlow::Continue(());
        }

        if !self.sessions.is_empty() {
            warn!(remaining = self.sessions.len(), "Clients did not leave in time");
        }
        let grace = shutdown_grace(self.scheduler.queue_length());
        info!(grace_ms = grace.as_millis() as u64, "Drained, exiting");
        RepeatingAction::new("Exit", grace, Duration::ZERO, |state: &mut ChannelState, _: &Tick| {
            state.exit(0);
            ControlFlow::Break(())
        })
        .start(&self.scheduler);
        ControlFlow::Break(())
    }

    fn exit(&mut self, code: i32) {
        if let Some(center) = self.center.take() {
            center.disconnect();
        }
        self.io.exit(code);
    }

    fn publish_status(&self) {
        let backlog = self.scheduler.queue_length();
        metrics::set_scheduler_queue(backlog);
        metrics::set_monitored_connections(self.liveness.len());
        metrics::set_presence_failures(self.presence.lookup_failures());

        http::publish(&self.status, |status| {
            status.channel_id = self.channel_id;
            status.migration_phase = Some(self.migration.phase());
            status.connections = self.sessions.len();
            status.players = self.characters.len();
            status.pending_handoffs = self.handoffs.len();
            status.scheduler_backlog = backlog;
            status.presence_running_normally = self.presence.is_running_normally();
            status.shutting_down = self.shutting_down;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::testing::Harness;
    use super::*;
    use tether_core::Scheduler;
    use tether_protocol::ClientMessage;
    use tether_transport::MemoryConnection;

    #[test]
    fn test_shutdown_grace_is_clamped() {
        assert_eq!(shutdown_grace(0), Duration::from_millis(700));
        assert_eq!(shutdown_grace(100), Duration::from_millis(1000));
        assert_eq!(shutdown_grace(10_000), Duration::from_secs(3));
    }

    #[test]
    fn test_boot_dials_center_once() {
        let mut harness = Harness::new();
        harness.state.boot(&Tick::now());
        harness.state.dial_center();

        let dials = harness.io.lock().unwrap().dials.clone();
        assert_eq!(dials, vec![harness.state.settings.center_addr]);
    }

    #[test]
    fn test_registration_request_on_connect() {
        let mut harness = Harness::new();
        let center = harness.connect_center();

        match center.take_sent().as_slice() {
            [ControlMessage::ServerRequestAllocation {
                name,
                auth_key,
                public_ip,
                port,
                ..
            }] => {
                assert_eq!(name, "Game1");
                assert_eq!(auth_key, "secret");
                assert_eq!(*public_ip, [10, 0, 0, 2]);
                assert_eq!(*port, 8586);
            }
            other => panic!("Expected allocation request, got {:?}", other),
        }
        assert!(harness.liveness.contains(center.id()));
        assert!(!harness.io.lock().unwrap().listening);
    }

    #[test]
    fn test_watchdog_exhaustion_before_assignment_exits() {
        let mut harness = Harness::new();
        harness.connect_center();

        for _ in 0..2 {
            assert!(harness.state.center_watchdog_pass().is_continue());
        }
        assert!(harness.state.center_watchdog_pass().is_break());

        assert_eq!(harness.io.lock().unwrap().exits, vec![1]);
        assert_eq!(harness.alerts.messages().len(), 1);
    }

    #[test]
    fn test_watchdog_stops_once_registered() {
        let (mut harness, _center) = Harness::registered(1);
        assert!(harness.state.center_watchdog_pass().is_break());
        assert!(harness.io.lock().unwrap().exits.is_empty());
    }

    #[test]
    fn test_lost_center_is_redialed_without_alert() {
        let (mut harness, center) = Harness::registered(1);
        harness.io.lock().unwrap().dials.clear();

        center.kill();
        harness
            .state
            .on_center_event(&Tick::now(), ConnectionEvent::Closed { id: center.id() });

        assert!(harness.state.center.is_none());
        assert_eq!(harness.io.lock().unwrap().dials.len(), 1);
        assert!(harness.alerts.messages().is_empty());
        // Clients keep being served while center is away.
        assert!(harness.io.lock().unwrap().listening);

        // Reconnecting re-registers and keeps the listener.
        let center = harness.connect_center();
        harness.control(ControlMessage::ServerAssignmentResult {
            in_migration: false,
            channel_id: 1,
        });
        assert!(harness.state.registered);
        assert!(matches!(
            center.sent().first(),
            Some(ControlMessage::ServerRequestAllocation { .. })
        ));
    }

    #[test]
    fn test_reconnect_exhaustion_after_registration_shuts_down() {
        let (mut harness, center) = Harness::registered(1);
        harness
            .state
            .on_center_event(&Tick::now(), ConnectionEvent::Closed { id: center.id() });

        for _ in 0..3 {
            harness.state.center_watchdog_pass();
        }
        assert!(harness.state.shutting_down);
        assert!(harness.io.lock().unwrap().exits.is_empty());
        assert!(!harness.io.lock().unwrap().listening);
        assert_eq!(harness.alerts.messages().len(), 1);
    }

    #[test]
    fn test_liveness_teardown_of_center_is_handled_as_loss() {
        let (mut harness, center) = Harness::registered(1);
        harness.state.on_liveness_teardown(center.id(), Teardown::AlreadyGone);
        assert!(harness.state.center.is_none());
        assert!(!harness.state.registered);
    }

    #[test]
    fn test_connection_count_reported_on_change_only() {
        let (mut harness, center) = Harness::registered(1);
        let first = harness.connect_client();
        harness.connect_client();
        harness.close_client(&first);
        harness.state.report_connections();

        let counts: Vec<u32> = center
            .take_sent()
            .into_iter()
            .filter_map(|message| match message {
                ControlMessage::ServerSetConnectionsValue { count } => Some(count),
                _ => None,
            })
            .collect();
        assert_eq!(counts, vec![1, 2, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_clients_then_exits() {
        let (scheduler, handle) = Scheduler::<ChannelState>::new();
        let mut harness = Harness::with_scheduler(handle.clone());
        let client = harness.login(7, 70);
        let io = Arc::clone(&harness.io);
        let task = tokio::spawn(scheduler.run(harness.state));

        handle.add_callback("shutdown", |state: &mut ChannelState, _: &Tick| {
            state.begin_shutdown();
        });
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!client.is_open());
        assert!(io.lock().unwrap().exits.is_empty());

        let id = client.id();
        handle.add_callback("closed", move |state: &mut ChannelState, tick: &Tick| {
            state.on_client_event(tick, ConnectionEvent::Closed { id });
        });
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(io.lock().unwrap().exits, vec![0]);

        handle.stop();
        let state = task.await.unwrap();
        assert!(state.sessions.is_empty());
        assert_eq!(client.take_sent(), Vec::<ClientMessage>::new());
    }

    #[test]
    fn test_shutdown_refuses_new_center_link() {
        let mut harness = Harness::new();
        harness.state.begin_shutdown();
        let center = MemoryConnection::<ControlMessage>::new();
        harness.state.on_center_connected(&Tick::now(), center.clone());
        assert!(!center.is_open());
        assert!(harness.state.center.is_none());
    }
}
