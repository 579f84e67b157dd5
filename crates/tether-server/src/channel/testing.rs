//! Test doubles for the channel process.

use bytes::Bytes;
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_core::{
    LivenessMonitor, MemoryBackend, PresenceStore, Scheduler, SchedulerHandle, Tick,
};
use tether_protocol::{
    CharacterId, ClientMessage, ControlMessage, MigrationPayload, Rates, RelayKind, UserId,
};
use tether_transport::{Connection, ConnectionEvent, MemoryConnection, TransportError};

use super::io::ChannelIo;
use super::migration::MigrationPhase;
use super::{ChannelSettings, ChannelState};
use crate::alert::testing::RecordingAlerts;
use crate::hooks::{GameHooks, HookError, PlayerProfile};
use crate::http;
use crate::services::Services;

#[derive(Debug, Default)]
pub struct IoLog {
    pub listening: bool,
    pub fail_listen: bool,
    pub dials: Vec<SocketAddr>,
    pub exits: Vec<i32>,
}

pub struct FakeIo(pub Arc<Mutex<IoLog>>);

impl ChannelIo for FakeIo {
    fn start_listening(&mut self) -> Result<(), TransportError> {
        let mut log = self.0.lock().unwrap();
        if log.fail_listen {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "address in use",
            )));
        }
        log.listening = true;
        Ok(())
    }

    fn stop_listening(&mut self) {
        self.0.lock().unwrap().listening = false;
    }

    fn is_listening(&self) -> bool {
        self.0.lock().unwrap().listening
    }

    fn dial_center(&mut self, addr: SocketAddr) {
        self.0.lock().unwrap().dials.push(addr);
    }

    fn exit(&mut self, code: i32) {
        self.0.lock().unwrap().exits.push(code);
    }
}

#[derive(Debug, Default)]
pub struct GameLog {
    pub loaded: HashSet<CharacterId>,
    pub unresumable: HashSet<CharacterId>,
    pub away_from_town: HashSet<CharacterId>,
    pub detached: Vec<CharacterId>,
    pub returned: Vec<CharacterId>,
    pub left: Vec<(CharacterId, bool)>,
    pub resumed: Vec<(CharacterId, Option<Bytes>)>,
    pub phases: Vec<MigrationPhase>,
    pub snapshot: MigrationPayload,
    pub restored: Option<MigrationPayload>,
    pub rates: Vec<Rates>,
    pub admin: Vec<(String, u8)>,
    pub relays: Vec<(RelayKind, CharacterId, Vec<u8>)>,
}

impl GameLog {
    fn require(&self, character_id: CharacterId) -> Result<(), HookError> {
        if self.loaded.contains(&character_id) {
            Ok(())
        } else {
            Err(HookError::UnknownCharacter(character_id))
        }
    }
}

/// Game layer that records every call.
pub struct RecordingGame(pub Arc<Mutex<GameLog>>);

impl GameHooks for RecordingGame {
    fn on_rates_changed(&mut self, rates: &Rates) {
        self.0.lock().unwrap().rates.push(*rates);
    }

    fn on_admin_message(&mut self, message: &str, kind: u8) {
        self.0.lock().unwrap().admin.push((message.to_string(), kind));
    }

    fn on_relay(&mut self, kind: RelayKind, character_id: CharacterId, payload: &[u8]) {
        self.0
            .lock()
            .unwrap()
            .relays
            .push((kind, character_id, payload.to_vec()));
    }

    fn on_migration_phase(&mut self, phase: MigrationPhase) {
        self.0.lock().unwrap().phases.push(phase);
    }

    fn on_player_left(&mut self, character_id: CharacterId, cc: bool) {
        let mut log = self.0.lock().unwrap();
        log.loaded.remove(&character_id);
        log.left.push((character_id, cc));
    }

    fn snapshot_world(&mut self) -> Result<MigrationPayload, HookError> {
        Ok(self.0.lock().unwrap().snapshot.clone())
    }

    fn restore_world(&mut self, payload: MigrationPayload) -> Result<(), HookError> {
        self.0.lock().unwrap().restored = Some(payload);
        Ok(())
    }

    fn detach_transient(&mut self, character_id: CharacterId) -> Result<(), HookError> {
        let mut log = self.0.lock().unwrap();
        log.require(character_id)?;
        log.detached.push(character_id);
        Ok(())
    }

    fn is_idle_away_from_town(&mut self, character_id: CharacterId) -> Result<bool, HookError> {
        let log = self.0.lock().unwrap();
        log.require(character_id)?;
        Ok(log.away_from_town.contains(&character_id))
    }

    fn return_to_town(&mut self, character_id: CharacterId) -> Result<(), HookError> {
        let mut log = self.0.lock().unwrap();
        log.require(character_id)?;
        log.away_from_town.remove(&character_id);
        log.returned.push(character_id);
        Ok(())
    }

    fn is_resumable(&mut self, character_id: CharacterId) -> Result<bool, HookError> {
        let log = self.0.lock().unwrap();
        log.require(character_id)?;
        Ok(!log.unresumable.contains(&character_id))
    }

    fn encode_for_transfer(&mut self, character_id: CharacterId) -> Result<Vec<u8>, HookError> {
        self.0.lock().unwrap().require(character_id)?;
        Ok(format!("state-{character_id}").into_bytes())
    }

    fn resume_player(
        &mut self,
        character_id: CharacterId,
        _user_id: UserId,
        state: Option<Bytes>,
    ) -> Result<PlayerProfile, HookError> {
        let mut log = self.0.lock().unwrap();
        log.loaded.insert(character_id);
        log.resumed.push((character_id, state));
        Ok(PlayerProfile {
            name: format!("player{character_id}"),
            job: 100,
            level: 30,
            gm_level: 0,
        })
    }
}

pub fn settings() -> ChannelSettings {
    ChannelSettings {
        name: "Game1".to_string(),
        public_ip: Ipv4Addr::new(10, 0, 0, 2),
        port: 8586,
        world_id: 0,
        world_name: "Tether".to_string(),
        auth_key: "secret".to_string(),
        center_addr: "10.0.0.1:8383".parse().unwrap(),
        register_attempts: 3,
        register_wait: Duration::from_secs(1),
        migration_timeout: Duration::from_secs(15),
        migration_sweep: Duration::from_secs(5),
        handoff_sweep: Duration::from_secs(5),
        handoff_max_age: Duration::from_secs(10),
        redirect_grace: Duration::from_secs(5),
    }
}

/// A channel state wired to recording doubles.
pub struct Harness {
    pub state: ChannelState,
    pub io: Arc<Mutex<IoLog>>,
    pub game: Arc<Mutex<GameLog>>,
    pub alerts: Arc<RecordingAlerts>,
    pub backend: Arc<MemoryBackend>,
    pub presence: Arc<PresenceStore>,
    pub liveness: Arc<LivenessMonitor>,
    _scheduler: Option<Scheduler<ChannelState>>,
}

impl Harness {
    pub fn new() -> Self {
        let (scheduler, handle) = Scheduler::new();
        let mut harness = Self::with_scheduler(handle);
        harness._scheduler = Some(scheduler);
        harness
    }

    /// Build on a scheduler the test runs itself.
    pub fn with_scheduler(handle: SchedulerHandle<ChannelState>) -> Self {
        let backend = Arc::new(MemoryBackend::new());
        let presence = Arc::new(PresenceStore::new(backend.clone()));
        Self::with_parts(handle, backend, presence)
    }

    /// Build over a presence store without a backend.
    pub fn degraded() -> Self {
        let (scheduler, handle) = Scheduler::new();
        let mut harness = Self::with_parts(
            handle,
            Arc::new(MemoryBackend::new()),
            Arc::new(PresenceStore::degraded()),
        );
        harness._scheduler = Some(scheduler);
        harness
    }

    fn with_parts(
        handle: SchedulerHandle<ChannelState>,
        backend: Arc<MemoryBackend>,
        presence: Arc<PresenceStore>,
    ) -> Self {
        let io = Arc::new(Mutex::new(IoLog::default()));
        let game = Arc::new(Mutex::new(GameLog::default()));
        let alerts = Arc::new(RecordingAlerts::default());
        let liveness = Arc::new(LivenessMonitor::default());

        let services = Services {
            presence: presence.clone(),
            liveness: liveness.clone(),
            alerts: alerts.clone(),
            status: http::shared_status("channel", "Game1"),
        };
        let state = ChannelState::new(
            settings(),
            handle,
            Box::new(FakeIo(io.clone())),
            Box::new(RecordingGame(game.clone())),
            services,
        );

        Self {
            state,
            io,
            game,
            alerts,
            backend,
            presence,
            liveness,
            _scheduler: None,
        }
    }

    /// A channel registered as `channel_id`, with its center link.
    pub fn registered(channel_id: u8) -> (Self, Arc<MemoryConnection<ControlMessage>>) {
        let mut harness = Self::new();
        let center = harness.connect_center();
        harness.control(ControlMessage::ServerAssignmentResult {
            in_migration: false,
            channel_id,
        });
        center.take_sent();
        (harness, center)
    }

    pub fn connect_center(&mut self) -> Arc<MemoryConnection<ControlMessage>> {
        let center = MemoryConnection::<ControlMessage>::new();
        self.state.on_center_connected(&Tick::now(), center.clone());
        center
    }

    /// Deliver a message on the current center link.
    pub fn control(&mut self, message: ControlMessage) {
        let id = self
            .state
            .center
            .as_ref()
            .map(|center| center.id())
            .expect("center link");
        self.state
            .on_center_event(&Tick::now(), ConnectionEvent::Message { id, message });
    }

    pub fn connect_client(&mut self) -> Arc<MemoryConnection<ClientMessage>> {
        let client = MemoryConnection::<ClientMessage>::new();
        self.state.on_client_connected(&Tick::now(), client.clone());
        client
    }

    pub fn client_says(
        &mut self,
        client: &Arc<MemoryConnection<ClientMessage>>,
        message: ClientMessage,
    ) {
        self.state.on_client_event(
            &Tick::now(),
            ConnectionEvent::Message {
                id: client.id(),
                message,
            },
        );
    }

    /// Drop a client the way the transport reports it.
    pub fn close_client(&mut self, client: &Arc<MemoryConnection<ClientMessage>>) {
        client.disconnect();
        self.state
            .on_client_event(&Tick::now(), ConnectionEvent::Closed { id: client.id() });
    }

    /// Connect a client and load `character_id` as if center had sent it
    /// here.
    pub fn login(
        &mut self,
        character_id: CharacterId,
        user_id: UserId,
    ) -> Arc<MemoryConnection<ClientMessage>> {
        self.presence.set_migration_hold(character_id);
        let client = self.connect_client();
        self.client_says(
            &client,
            ClientMessage::MigrateIn {
                character_id,
                user_id,
            },
        );
        client
    }
}
