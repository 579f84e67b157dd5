//! Whole-process migration.
//!
//! A replacement process registering under the name of a running channel
//! takes over its world. Center relays the steps between the two:
//!
//! ```text
//!   old                         center                      replacement
//!    |                             |<--- register (same name) ---|
//!    |                             |---- assigned, migrating --->|
//!    |<-------------------- StartMigration ----------------------|
//!  stop listening                  |                             |
//!    |--------------------- StartListening --------------------->|
//!    |                             |                     start listening
//!    |<------------------- DataTransferRequest ------------------|
//!  snapshot world                  |                             |
//!    |------------- DataTransferResponse (gzip payload) -------->|
//!    |                             |                      restore world
//!    |<----------------- FinishedInitialization -----------------|
//!  evacuate players                |                             |
//!    |--------------------- PlayersMigrated -------------------->|
//!  shut down                       |                          complete
//! ```
//!
//! Every wait is bounded by a watchdog. A failure at any step is logged,
//! raised as an alert, and never retried.

use serde::Serialize;
use std::ops::ControlFlow;
use std::time::Duration;
use tether_core::{RepeatingAction, TaskId, Tick};
use tether_protocol::{
    CharacterId, ControlMessage, MigrationPayload, MigrationStatus, ProtocolError,
};
use tether_transport::{ConnectionId, TransportError};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::session::TransferError;
use super::ChannelState;
use crate::hooks::HookError;
use crate::metrics;

/// Phase of the migration as seen by one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    Idle,
    Started,
    Listening,
    TransferRequested,
    Transferred,
    Evacuating,
    Complete,
    Aborted,
}

impl MigrationPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MigrationPhase::Idle => "idle",
            MigrationPhase::Started => "started",
            MigrationPhase::Listening => "listening",
            MigrationPhase::TransferRequested => "transfer_requested",
            MigrationPhase::Transferred => "transferred",
            MigrationPhase::Evacuating => "evacuating",
            MigrationPhase::Complete => "complete",
            MigrationPhase::Aborted => "aborted",
        }
    }

    /// Whether a migration is in progress.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(
            self,
            MigrationPhase::Started
                | MigrationPhase::Listening
                | MigrationPhase::TransferRequested
                | MigrationPhase::Transferred
                | MigrationPhase::Evacuating
        )
    }
}

/// Side of the migration this process is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationRole {
    /// The process being replaced.
    Old,
    /// The process taking over.
    Replacement,
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("unexpected {status:?} in phase {phase:?}")]
    OutOfOrder {
        status: MigrationStatus,
        phase: MigrationPhase,
    },

    #[error("no progress for {0:?} in phase {1:?}")]
    TimedOut(Duration, MigrationPhase),

    #[error("world snapshot: {0}")]
    Snapshot(#[from] ProtocolError),

    #[error("game layer: {0}")]
    Game(#[from] HookError),

    #[error("listener: {0}")]
    Listen(#[from] TransportError),

    #[error("lost connection to center")]
    CenterLost,
}

/// Bookkeeping of the old process while it moves its players out.
#[derive(Debug, Clone, Copy)]
pub(super) struct Evacuation {
    pub(super) started_at: Instant,
    pub(super) sweep: Option<TaskId>,
}

/// Migration state machine of one process.
#[derive(Debug)]
pub struct MigrationSession {
    role: Option<MigrationRole>,
    phase: MigrationPhase,
    /// Bumped on every transition, so a watchdog can tell whether the
    /// phase it guards is still current.
    step: u32,
    started_at: Option<Instant>,
    pub(super) watchdog: Option<TaskId>,
    pub(super) evacuation: Option<Evacuation>,
}

impl Default for MigrationSession {
    fn default() -> Self {
        Self::new()
    }
}

impl MigrationSession {
    #[must_use]
    pub fn new() -> Self {
        Self {
            role: None,
            phase: MigrationPhase::Idle,
            step: 0,
            started_at: None,
            watchdog: None,
            evacuation: None,
        }
    }

    #[must_use]
    pub fn phase(&self) -> MigrationPhase {
        self.phase
    }

    #[must_use]
    pub fn role(&self) -> Option<MigrationRole> {
        self.role
    }

    #[must_use]
    pub fn step(&self) -> u32 {
        self.step
    }

    /// Time since the migration started.
    #[must_use]
    pub fn elapsed(&self, now: Instant) -> Option<Duration> {
        self.started_at.map(|at| now.saturating_duration_since(at))
    }

    /// Start migrating as the replacement.
    ///
    /// # Errors
    ///
    /// Returns an error if a migration is already in progress.
    pub fn begin_replacement(&mut self, now: Instant) -> Result<MigrationPhase, MigrationError> {
        if self.phase.is_active() {
            return Err(MigrationError::OutOfOrder {
                status: MigrationStatus::StartMigration,
                phase: self.phase,
            });
        }
        self.role = Some(MigrationRole::Replacement);
        self.started_at = Some(now);
        Ok(self.enter(MigrationPhase::Started, now))
    }

    /// Apply a step received from the peer.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError::OutOfOrder`] if the step is not the one
    /// expected next. The session is left unchanged.
    pub fn advance(
        &mut self,
        status: MigrationStatus,
        now: Instant,
    ) -> Result<MigrationPhase, MigrationError> {
        use MigrationPhase as P;
        use MigrationRole::{Old, Replacement};
        use MigrationStatus as S;

        let next = match (self.role, self.phase, status) {
            (_, P::Idle | P::Aborted | P::Complete, S::StartMigration) => {
                self.role = Some(Old);
                self.started_at = Some(now);
                P::Started
            }
            (Some(Replacement), P::Started, S::StartListening) => P::Listening,
            (Some(Old), P::Started, S::DataTransferRequest) => P::TransferRequested,
            (Some(Replacement), P::TransferRequested, S::DataTransferResponse) => P::Transferred,
            (Some(Old), P::TransferRequested, S::FinishedInitialization) => P::Evacuating,
            (Some(Replacement), P::Transferred, S::PlayersMigrated) => P::Complete,
            (_, phase, status) => return Err(MigrationError::OutOfOrder { status, phase }),
        };
        Ok(self.enter(next, now))
    }

    /// Move to `phase` on this side's own initiative.
    pub fn enter(&mut self, phase: MigrationPhase, now: Instant) -> MigrationPhase {
        let after = self.elapsed(now).unwrap_or_default();
        debug!(
            from = self.phase.as_str(),
            to = phase.as_str(),
            after_ms = after.as_millis() as u64,
            "Migration phase"
        );
        self.phase = phase;
        self.step = self.step.wrapping_add(1);
        phase
    }

    /// Abandon the migration, returning the side this process was on.
    pub fn abort(&mut self) -> Option<MigrationRole> {
        self.phase = MigrationPhase::Aborted;
        self.step = self.step.wrapping_add(1);
        self.watchdog = None;
        self.evacuation = None;
        self.role.take()
    }

    /// Longest wait for the peer's next step in the current phase.
    ///
    /// A replacement holding the world waits for the old process to finish
    /// evacuating, which has its own timeout.
    #[must_use]
    pub fn step_timeout(&self, timeout: Duration, sweep: Duration) -> Option<Duration> {
        match self.phase {
            MigrationPhase::Started
            | MigrationPhase::Listening
            | MigrationPhase::TransferRequested => Some(timeout),
            MigrationPhase::Transferred => Some(timeout.saturating_mul(2).saturating_add(sweep)),
            _ => None,
        }
    }
}

impl ChannelState {
    /// Center assigned this process while another one still holds the name.
    pub(super) fn begin_replacement_migration(&mut self, tick: &Tick) {
        match self.migration.begin_replacement(tick.current_time()) {
            Ok(phase) => {
                info!(name = %self.settings.name, "Taking over from the running process");
                self.migration_phase_entered(phase);
                self.send_to_center(&ControlMessage::migration(MigrationStatus::StartMigration));
                self.arm_migration_watchdog();
            }
            Err(e) => warn!("Cannot start migration: {}", e),
        }
    }

    /// A migration step arrived from the peer.
    pub(super) fn on_migration_update(
        &mut self,
        tick: &Tick,
        status: MigrationStatus,
        payload: Vec<u8>,
    ) {
        if self.shutting_down {
            warn!(?status, "Ignoring migration step while shutting down");
            return;
        }

        let phase = match self.migration.advance(status, tick.current_time()) {
            Ok(phase) => phase,
            Err(e) => {
                warn!("Ignoring migration step: {}", e);
                return;
            }
        };
        debug!(?status, phase = phase.as_str(), "Migration step");
        self.migration_phase_entered(phase);

        if let Err(e) = self.apply_migration_step(tick, phase, payload) {
            self.abort_migration(e);
            return;
        }
        self.arm_migration_watchdog();
    }

    fn apply_migration_step(
        &mut self,
        tick: &Tick,
        phase: MigrationPhase,
        payload: Vec<u8>,
    ) -> Result<(), MigrationError> {
        match phase {
            MigrationPhase::Started => {
                info!(name = %self.settings.name, "Replacement registered, handing over");
                self.io.stop_listening();
                self.send_to_center(&ControlMessage::migration(MigrationStatus::StartListening));
            }
            MigrationPhase::Listening => {
                self.io.start_listening()?;
                self.start_handoff_reaper();
                self.send_to_center(&ControlMessage::migration(
                    MigrationStatus::DataTransferRequest,
                ));
                let next = self
                    .migration
                    .enter(MigrationPhase::TransferRequested, tick.current_time());
                self.migration_phase_entered(next);
            }
            MigrationPhase::TransferRequested => {
                let snapshot = self.game.snapshot_world()?;
                let compressed = snapshot.compress()?;
                info!(maps = snapshot.map_count(), bytes = compressed.len(), "Sending world state");
                self.send_to_center(&ControlMessage::migration_with_payload(
                    MigrationStatus::DataTransferResponse,
                    compressed,
                ));
            }
            MigrationPhase::Transferred => {
                let snapshot = MigrationPayload::decompress(&payload)?;
                info!(
                    maps = snapshot.map_count(),
                    parties = snapshot.parties.len(),
                    "Restoring world state"
                );
                self.game.restore_world(snapshot)?;
                self.send_to_center(&ControlMessage::migration(
                    MigrationStatus::FinishedInitialization,
                ));
            }
            MigrationPhase::Evacuating => self.start_evacuation(tick),
            MigrationPhase::Complete => {
                let took = self.migration.elapsed(tick.current_time()).unwrap_or_default();
                info!(took_ms = took.as_millis() as u64, "Migration complete");
            }
            MigrationPhase::Idle | MigrationPhase::Aborted => {}
        }
        Ok(())
    }

    fn migration_phase_entered(&mut self, phase: MigrationPhase) {
        metrics::record_migration_phase(phase.as_str());
        self.game.on_migration_phase(phase);
    }

    /// Guard the current phase against a peer that stopped answering.
    fn arm_migration_watchdog(&mut self) {
        if let Some(id) = self.migration.watchdog.take() {
            self.scheduler.cancel(id);
        }
        let Some(wait) = self
            .migration
            .step_timeout(self.settings.migration_timeout, self.settings.migration_sweep)
        else {
            return;
        };

        let step = self.migration.step();
        let id = RepeatingAction::new(
            "MigrationWatchdog",
            wait,
            Duration::ZERO,
            move |state: &mut ChannelState, _: &Tick| {
                state.migration_watchdog_fired(step, wait);
                ControlFlow::Break(())
            },
        )
        .start(&self.scheduler);
        self.migration.watchdog = Some(id);
    }

    fn migration_watchdog_fired(&mut self, step: u32, waited: Duration) {
        if self.migration.step() != step || !self.migration.phase().is_active() {
            return;
        }
        self.migration.watchdog = None;
        let phase = self.migration.phase();
        self.abort_migration(MigrationError::TimedOut(waited, phase));
    }

    /// Give up on the running migration.
    pub(super) fn abort_migration(&mut self, err: MigrationError) {
        let phase = self.migration.phase();
        if !phase.is_active() {
            debug!("No migration to abort ({})", err);
            return;
        }

        if let Some(id) = self.migration.watchdog {
            self.scheduler.cancel(id);
        }
        if let Some(sweep) = self.migration.evacuation.and_then(|evacuation| evacuation.sweep) {
            self.scheduler.cancel(sweep);
        }
        let role = self.migration.abort();

        error!(phase = phase.as_str(), ?role, "Migration aborted: {}", err);
        self.alerts.alert(&format!(
            "Migration of {} aborted in phase {}: {}",
            self.settings.name,
            phase.as_str(),
            err
        ));
        self.migration_phase_entered(MigrationPhase::Aborted);

        if role == Some(MigrationRole::Old) && !self.shutting_down && !self.io.is_listening() {
            match self.io.start_listening() {
                Ok(()) => info!("Accepting clients again"),
                Err(e) => {
                    self.alerts.alert(&format!(
                        "{} cannot accept clients after an aborted migration: {}",
                        self.settings.name, e
                    ));
                    self.begin_shutdown();
                }
            }
        }
    }

    fn start_evacuation(&mut self, tick: &Tick) {
        info!(players = self.characters.len(), "Evacuating players");
        self.evacuate_players();

        let sweep = self.settings.migration_sweep;
        let id = RepeatingAction::new(
            "EvacuationSweep",
            sweep,
            sweep,
            |state: &mut ChannelState, tick: &Tick| {
                state.evacuation_pass(tick)
            },
        )
        .start(&self.scheduler);
        self.migration.evacuation = Some(Evacuation {
            started_at: tick.current_time(),
            sweep: Some(id),
        });
    }

    fn evacuate_players(&mut self) {
        let sessions: Vec<(ConnectionId, Option<CharacterId>)> = self
            .sessions
            .iter()
            .map(|(id, session)| {
                let character = session.character.as_ref().map(|loaded| loaded.character_id);
                (*id, character)
            })
            .collect();

        for (connection, character) in sessions {
            let Some(character_id) = character else {
                self.disconnect_client(connection);
                continue;
            };
            if let Err(e) = self.evacuate_player(connection, character_id) {
                warn!(character = character_id, "Evacuation failed, disconnecting: {}", e);
                self.disconnect_client(connection);
            }
        }
    }

    fn evacuate_player(
        &mut self,
        connection: ConnectionId,
        character_id: CharacterId,
    ) -> Result<(), TransferError> {
        self.game.detach_transient(character_id)?;
        if self.game.is_idle_away_from_town(character_id)? {
            self.game.return_to_town(character_id)?;
        }
        if !self.game.is_resumable(character_id)? {
            info!(character = character_id, "Player cannot be resumed, disconnecting");
            self.disconnect_client(connection);
            return Ok(());
        }
        let channel = self.channel_id.ok_or(TransferError::NoCenter)?;
        self.request_transfer(connection, character_id, channel)
    }

    fn evacuation_pass(&mut self, tick: &Tick) -> ControlFlow<()> {
        let Some(evacuation) = self.migration.evacuation else {
            return ControlFlow::Break(());
        };
        let waited = tick.since(evacuation.started_at);
        if !self.sessions.is_empty() && waited < self.settings.migration_timeout {
            debug!(remaining = self.sessions.len(), "Waiting for players to leave");
            return ControlFlow::Continue(());
        }

        if !self.sessions.is_empty() {
            warn!(remaining = self.sessions.len(), "Evacuation timed out");
        }
        self.migration.evacuation = None;
        if let Some(id) = self.migration.watchdog.take() {
            self.scheduler.cancel(id);
        }
        self.send_to_center(&ControlMessage::migration(MigrationStatus::PlayersMigrated));
        let phase = self.migration.enter(MigrationPhase::Complete, tick.current_time());
        self.migration_phase_entered(phase);
        info!("Players migrated, shutting down");
        self.begin_shutdown();
        ControlFlow::Break(())
    }
}
