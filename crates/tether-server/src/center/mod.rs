//! Center process.
//!
//! Center assigns channel ids to registering channel processes, allocates
//! destinations for players changing channel, relays migration steps between
//! an old channel process and its replacement, and keeps the player
//! directory used to route social traffic.
//!
//! Everything in [`CenterState`] runs on the scheduler thread.

use std::collections::{BTreeMap, HashMap};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tether_core::{LivenessMonitor, PresenceStore, RepeatingAction, SchedulerHandle, Teardown, Tick};
use tether_protocol::{
    ip_from_wire, CharacterId, ControlMessage, MigrationStatus, Rates, UserId, Version, WireMessage,
    PROTOCOL_VERSION,
};
use tether_transport::{Connection, ConnectionEvent, ConnectionId, Link};
use tracing::{debug, info, warn};

use crate::alert::AlertSink;
use crate::config::{ChannelSlot, Config};
use crate::http::{self, SharedStatus};
use crate::{metrics, net};
use crate::services::Services;

const STATUS_INTERVAL: Duration = Duration::from_secs(1);

/// Identity and policy of the center process.
#[derive(Debug, Clone)]
pub struct CenterSettings {
    pub world_id: u8,
    pub world_name: String,
    pub auth_key: String,
    pub slots: Vec<ChannelSlot>,
    pub rates: Rates,
    pub online_count_interval: Duration,
}

impl CenterSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            world_id: config.center.world_id,
            world_name: config.center.world_name.clone(),
            auth_key: config.center.auth_key.clone(),
            slots: config.center.channels.clone(),
            rates: config.center.rates,
            online_count_interval: Duration::from_millis(config.center.online_count_interval_ms),
        }
    }
}

/// A connected channel process.
struct Peer {
    link: Arc<dyn Link<ControlMessage>>,
    slot: Option<u8>,
    /// Address clients are sent to.
    endpoint: Option<([u8; 4], u16)>,
}

/// A channel slot and the processes holding it.
#[derive(Debug)]
struct ChannelEntry {
    name: String,
    primary: Option<ConnectionId>,
    /// Replacement registered while the primary is still up.
    transfer: Option<ConnectionId>,
    in_maintenance: bool,
    connections: u32,
}

impl ChannelEntry {
    /// Where new players of this channel go.
    fn destination(&self) -> Option<ConnectionId> {
        if self.in_maintenance {
            self.transfer
        } else {
            self.primary
        }
    }

    /// The other side of a running migration.
    fn counterpart(&self, peer: ConnectionId) -> Option<ConnectionId> {
        if self.primary == Some(peer) {
            self.transfer
        } else if self.transfer == Some(peer) {
            self.primary
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
struct DirectoryEntry {
    user_id: UserId,
    name: String,
    channel: u8,
    peer: ConnectionId,
}

struct Registration {
    version: Version,
    name: String,
    auth_key: String,
    public_ip: [u8; 4],
    port: u16,
    world_id: u8,
}

/// State of the center process, owned by its scheduler.
pub struct CenterState {
    settings: CenterSettings,
    scheduler: SchedulerHandle<CenterState>,
    presence: Arc<PresenceStore>,
    liveness: Arc<LivenessMonitor>,
    alerts: Arc<dyn AlertSink>,
    status: SharedStatus,

    peers: HashMap<ConnectionId, Peer>,
    channels: BTreeMap<u8, ChannelEntry>,
    directory: HashMap<CharacterId, DirectoryEntry>,
    rates: Rates,
}

impl CenterState {
    pub fn new(
        settings: CenterSettings,
        scheduler: SchedulerHandle<CenterState>,
        services: Services,
    ) -> Self {
        let channels = settings
            .slots
            .iter()
            .map(|slot| {
                (
                    slot.id,
                    ChannelEntry {
                        name: slot.name.clone(),
                        primary: None,
                        transfer: None,
                        in_maintenance: false,
                        connections: 0,
                    },
                )
            })
            .collect();
        let rates = settings.rates;
        Self {
            settings,
            scheduler,
            presence: services.presence,
            liveness: services.liveness,
            alerts: services.alerts,
            status: services.status,
            peers: HashMap::new(),
            channels,
            directory: HashMap::new(),
            rates,
        }
    }

    /// Start the periodic tasks.
    pub fn boot(&mut self, _tick: &Tick) {
        info!(world = %self.settings.world_name, channels = self.channels.len(), "Starting center");

        self.liveness.start(&self.scheduler, |state: &mut CenterState, id, outcome| {
            metrics::record_teardown(outcome);
            if outcome == Teardown::Disconnected {
                debug!(connection = %id, "Channel stopped answering pings");
            }
            state.on_peer_closed(id);
        });

        let interval = self.settings.online_count_interval;
        RepeatingAction::new(
            "OnlineCount",
            interval,
            interval,
            |state: &mut CenterState, _: &Tick| {
                state.refresh_online_counts();
                ControlFlow::Continue(())
            },
        )
        .start(&self.scheduler);

        RepeatingAction::new(
            "Status",
            STATUS_INTERVAL,
            STATUS_INTERVAL,
            |state: &mut CenterState, _: &Tick| {
                state.publish_status();
                ControlFlow::Continue(())
            },
        )
        .start(&self.scheduler);
    }

    pub fn on_peer_connected(&mut self, _tick: &Tick, link: Arc<dyn Link<ControlMessage>>) {
        let id = link.id();
        debug!(connection = %id, addr = ?link.remote_addr(), "Channel connected");
        self.liveness.add(Arc::clone(&link).into_connection());
        self.peers.insert(
            id,
            Peer {
                link,
                slot: None,
                endpoint: None,
            },
        );
    }

    pub fn on_peer_event(&mut self, _tick: &Tick, event: ConnectionEvent<ControlMessage>) {
        match event {
            ConnectionEvent::Message { id, message } => self.handle_peer_message(id, message),
            ConnectionEvent::Closed { id } => self.on_peer_closed(id),
        }
    }

    fn handle_peer_message(&mut self, peer: ConnectionId, message: ControlMessage) {
        let Some(slot) = self.peers.get(&peer).map(|p| p.slot) else {
            debug!(connection = %peer, "Message from unknown peer");
            return;
        };
        let kind = message.kind();

        match (slot, message) {
            (_, ControlMessage::Ping { .. } | ControlMessage::Pong { .. }) => {}
            (
                None,
                ControlMessage::ServerRequestAllocation {
                    version,
                    name,
                    auth_key,
                    public_ip,
                    port,
                    world_id,
                    ..
                },
            ) => self.allocate(
                peer,
                Registration {
                    version,
                    name,
                    auth_key,
                    public_ip,
                    port,
                    world_id,
                },
            ),
            (Some(_), ControlMessage::ServerRequestAllocation { .. }) => {
                self.drop_unexpected(peer, kind, "from a registered channel");
            }
            (None, _) => self.drop_unexpected(peer, kind, "before registration"),
            (Some(slot), message) => self.handle_channel_message(peer, slot, message),
        }
    }

    /// Dispatch a message from a registered channel process.
    fn handle_channel_message(&mut self, peer: ConnectionId, slot: u8, message: ControlMessage) {
        let kind = message.kind();
        match message {
            ControlMessage::ServerSetConnectionsValue { count } => {
                if let Some(entry) = self.channels.get_mut(&slot) {
                    if entry.primary == Some(peer) || entry.transfer == Some(peer) {
                        entry.connections = count;
                    }
                }
                self.presence.set_online_count(self.settings.world_id, slot, count);
            }
            ControlMessage::ServerRegisterPlayer {
                character_id,
                user_id,
                name,
                ..
            } => {
                debug!(character = character_id, channel = slot, "Player online");
                self.directory.insert(
                    character_id,
                    DirectoryEntry {
                        user_id,
                        name,
                        channel: slot,
                        peer,
                    },
                );
            }
            ControlMessage::ServerUnregisterPlayer { character_id, cc } => {
                if self
                    .directory
                    .get(&character_id)
                    .is_some_and(|entry| entry.peer == peer)
                {
                    if let Some(entry) = self.directory.remove(&character_id) {
                        debug!(
                            character = character_id,
                            user = entry.user_id,
                            name = %entry.name,
                            cc,
                            "Player offline"
                        );
                    }
                }
            }
            ControlMessage::PlayerChangeServer {
                session,
                character_id,
                world,
                channel,
                cc,
                state,
            } => self.allocate_destination(peer, session, character_id, world, channel, cc, state),
            ControlMessage::ServerMigrationUpdate { status, payload } => {
                self.relay_migration(peer, slot, status, payload);
            }
            ControlMessage::ChangeRates { rates } => {
                if self.rates.merge(&rates) {
                    info!(rates = ?self.rates, "World rates changed");
                    self.broadcast(&ControlMessage::ChangeRates { rates: self.rates });
                }
            }
            ControlMessage::AdminMessage { message, kind } => {
                self.broadcast(&ControlMessage::AdminMessage { message, kind });
            }
            ControlMessage::KickPlayer { user_id } => {
                info!(user = user_id, "Kicking account");
                self.broadcast(&ControlMessage::KickPlayerResult { user_id });
            }
            ControlMessage::Relay {
                kind,
                character_id,
                payload,
            } => match self.directory.get(&character_id) {
                Some(entry) => {
                    let target = entry.peer;
                    debug!(character = character_id, channel = entry.channel, ?kind, "Relaying");
                    self.send_to_peer(
                        target,
                        &ControlMessage::Relay {
                            kind,
                            character_id,
                            payload,
                        },
                    );
                }
                None => debug!(character = character_id, ?kind, "Relay for an offline player"),
            },
            ControlMessage::Ping { .. }
            | ControlMessage::Pong { .. }
            | ControlMessage::ServerRequestAllocation { .. }
            | ControlMessage::ServerAssignmentResult { .. }
            | ControlMessage::PlayerChangeServerResult { .. }
            | ControlMessage::PlayerChangeServerData { .. }
            | ControlMessage::ChangeCenterServer { .. }
            | ControlMessage::KickPlayerResult { .. } => {
                self.drop_unexpected(peer, kind, "at center");
            }
        }
    }

    /// Validate a registration and hand out a channel id.
    fn allocate(&mut self, peer: ConnectionId, registration: Registration) {
        let Registration {
            version,
            name,
            auth_key,
            public_ip,
            port,
            world_id,
        } = registration;

        if let Err(e) = PROTOCOL_VERSION.admit_peer(version) {
            warn!(connection = %peer, %name, "Refusing registration: {}", e);
            self.disconnect_peer(peer);
            return;
        }
        let Some(slot) = self
            .settings
            .slots
            .iter()
            .find(|slot| slot.name == name)
            .map(|slot| slot.id)
        else {
            warn!(connection = %peer, %name, "Unknown channel name");
            self.disconnect_peer(peer);
            return;
        };
        if auth_key != self.settings.auth_key {
            let addr = self
                .peers
                .get(&peer)
                .and_then(|p| p.link.remote_addr())
                .map_or_else(|| "unknown address".to_string(), |addr| addr.to_string());
            self.alerts
                .alert(&format!("Rejected registration of {name} from {addr}: bad auth key"));
            self.disconnect_peer(peer);
            return;
        }
        if world_id != self.settings.world_id {
            warn!(connection = %peer, %name, world_id, "Channel belongs to another world");
            self.disconnect_peer(peer);
            return;
        }

        let live_primary = self
            .channels
            .get(&slot)
            .and_then(|entry| entry.primary)
            .filter(|primary| *primary != peer && self.peers.contains_key(primary));
        let Some(entry) = self.channels.get_mut(&slot) else {
            return;
        };

        let in_migration = match live_primary {
            Some(_) if entry.in_maintenance || entry.transfer.is_some() => {
                warn!(connection = %peer, %name, "Channel is already being replaced");
                self.disconnect_peer(peer);
                return;
            }
            Some(primary) => {
                info!(%name, old = %primary, new = %peer, "Replacement registered, migrating");
                entry.in_maintenance = true;
                entry.transfer = Some(peer);
                true
            }
            None => {
                entry.primary = Some(peer);
                false
            }
        };

        if let Some(p) = self.peers.get_mut(&peer) {
            p.slot = Some(slot);
            p.endpoint = Some((public_ip, port));
        }
        info!(
            %name,
            channel_id = slot,
            addr = %ip_from_wire(public_ip),
            port,
            "Channel registered"
        );

        self.send_to_peer(
            peer,
            &ControlMessage::ServerAssignmentResult {
                in_migration,
                channel_id: slot,
            },
        );
        self.send_to_peer(peer, &ControlMessage::ChangeRates { rates: self.rates });
        metrics::set_registered_channels(self.registered_channels());
    }

    /// Find where a player changing channel goes.
    #[allow(clippy::too_many_arguments)]
    fn allocate_destination(
        &mut self,
        source: ConnectionId,
        session: String,
        character_id: CharacterId,
        world: u8,
        channel: u8,
        cc: bool,
        state: Vec<u8>,
    ) {
        let reject = |center: &Self, reason: &str| {
            info!(character = character_id, channel, "Channel change rejected: {}", reason);
            metrics::record_transfer("rejected");
            center.send_to_peer(
                source,
                &ControlMessage::transfer_rejected(session.clone(), character_id),
            );
        };

        match self.presence.claim_migration_hold(character_id, false) {
            Ok(false) => {}
            Ok(true) => return reject(self, "a transfer is already in flight"),
            Err(e) => {
                warn!(character = character_id, "Could not check migration hold: {}", e);
                return reject(self, "presence store unavailable");
            }
        }
        if world != self.settings.world_id {
            return reject(self, "other world");
        }

        let Some(target) = self.channels.get(&channel).and_then(ChannelEntry::destination) else {
            return reject(self, "channel offline");
        };
        if target == source {
            return reject(self, "already there");
        }
        let Some((ip, port)) = self.peers.get(&target).and_then(|p| p.endpoint) else {
            return reject(self, "destination not registered");
        };

        self.presence.set_migration_hold(character_id);
        if cc {
            self.send_to_peer(
                target,
                &ControlMessage::PlayerChangeServerData { character_id, state },
            );
        }
        metrics::record_transfer("allocated");
        debug!(character = character_id, channel, "Destination allocated");
        self.send_to_peer(
            source,
            &ControlMessage::PlayerChangeServerResult {
                session,
                character_id,
                ip,
                port,
            },
        );
    }

    fn relay_migration(
        &mut self,
        peer: ConnectionId,
        slot: u8,
        status: MigrationStatus,
        payload: Vec<u8>,
    ) {
        let Some(entry) = self.channels.get(&slot) else {
            return;
        };
        if !entry.in_maintenance {
            warn!(channel = slot, ?status, "Migration step outside a migration");
            return;
        }
        let Some(target) = entry.counterpart(peer) else {
            warn!(connection = %peer, channel = slot, ?status, "Migration step from a bystander");
            return;
        };
        debug!(channel = slot, ?status, bytes = payload.len(), "Relaying migration step");
        self.send_to_peer(target, &ControlMessage::migration_with_payload(status, payload));
    }

    fn on_peer_closed(&mut self, id: ConnectionId) {
        self.liveness.remove(id);
        let Some(peer) = self.peers.remove(&id) else {
            return;
        };
        peer.link.disconnect();
        let Some(slot) = peer.slot else {
            debug!(connection = %id, "Unregistered channel left");
            return;
        };

        self.directory.retain(|_, entry| entry.peer != id);
        let Some(entry) = self.channels.get_mut(&slot) else {
            return;
        };
        if entry.primary == Some(id) {
            entry.primary = entry.transfer.take();
            entry.in_maintenance = false;
            entry.connections = 0;
            match entry.primary {
                Some(replacement) => info!(channel = slot, %replacement, "Replacement took over"),
                None => warn!(channel = slot, name = %entry.name, "Channel went offline"),
            }
        } else if entry.transfer == Some(id) {
            entry.transfer = None;
            entry.in_maintenance = false;
            let name = entry.name.clone();
            self.alerts
                .alert(&format!("Replacement of {name} disconnected during migration"));
        }
        metrics::set_registered_channels(self.registered_channels());
    }

    fn refresh_online_counts(&self) {
        for (slot, entry) in &self.channels {
            if entry.primary.is_some() {
                self.presence
                    .set_online_count(self.settings.world_id, *slot, entry.connections);
            }
        }
    }

    fn registered_channels(&self) -> usize {
        self.channels.values().filter(|entry| entry.primary.is_some()).count()
    }

    fn send_to_peer(&self, id: ConnectionId, message: &ControlMessage) -> bool {
        let Some(peer) = self.peers.get(&id) else {
            return false;
        };
        match peer.link.send(message) {
            Ok(()) => true,
            Err(e) => {
                warn!(connection = %id, kind = message.kind(), "Failed to send to channel: {}", e);
                false
            }
        }
    }

    /// Send to every registered channel process.
    fn broadcast(&self, message: &ControlMessage) {
        for (id, peer) in &self.peers {
            if peer.slot.is_some() {
                self.send_to_peer(*id, message);
            }
        }
    }

    fn disconnect_peer(&mut self, id: ConnectionId) {
        if let Some(peer) = self.peers.get(&id) {
            peer.link.disconnect();
        }
    }

    fn drop_unexpected(&self, id: ConnectionId, kind: &'static str, context: &str) {
        if let Some(peer) = self.peers.get(&id) {
            net::drop_unexpected(&*peer.link, kind, context);
        }
    }

    fn publish_status(&self) {
        let backlog = self.scheduler.queue_length();
        metrics::set_scheduler_queue(backlog);
        metrics::set_monitored_connections(self.liveness.len());
        metrics::set_presence_failures(self.presence.lookup_failures());

        http::publish(&self.status, |status| {
            status.connections = self.peers.len();
            status.players = self.directory.len();
            status.registered_channels = self.registered_channels();
            status.scheduler_backlog = backlog;
            status.presence_running_normally = self.presence.is_running_normally();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::testing::RecordingAlerts;
    use tether_core::presence::keys;
    use tether_core::{KvBackend, MemoryBackend, Scheduler};
    use tether_transport::MemoryConnection;

    type ChannelLink = Arc<MemoryConnection<ControlMessage>>;

    struct Harness {
        state: CenterState,
        backend: Arc<MemoryBackend>,
        alerts: Arc<RecordingAlerts>,
        _scheduler: Scheduler<CenterState>,
    }

    impl Harness {
        fn new() -> Self {
            let (scheduler, handle) = Scheduler::new();
            let backend = Arc::new(MemoryBackend::new());
            let alerts = Arc::new(RecordingAlerts::default());
            let services = Services {
                presence: Arc::new(PresenceStore::new(backend.clone())),
                liveness: Arc::new(LivenessMonitor::default()),
                alerts: alerts.clone(),
                status: http::shared_status("center", "Tether"),
            };
            let settings = CenterSettings {
                world_id: 0,
                world_name: "Tether".into(),
                auth_key: "secret".into(),
                slots: vec![
                    ChannelSlot {
                        name: "Game0".into(),
                        id: 0,
                    },
                    ChannelSlot {
                        name: "Game1".into(),
                        id: 1,
                    },
                ],
                rates: Rates::default(),
                online_count_interval: Duration::from_secs(30),
            };
            Self {
                state: CenterState::new(settings, handle, services),
                backend,
                alerts,
                _scheduler: scheduler,
            }
        }

        fn connect(&mut self) -> ChannelLink {
            let link = MemoryConnection::<ControlMessage>::new();
            self.state.on_peer_connected(&Tick::now(), link.clone());
            link
        }

        fn says(&mut self, link: &ChannelLink, message: ControlMessage) {
            self.state.on_peer_event(
                &Tick::now(),
                ConnectionEvent::Message {
                    id: link.id(),
                    message,
                },
            );
        }

        fn close(&mut self, link: &ChannelLink) {
            self.state
                .on_peer_event(&Tick::now(), ConnectionEvent::Closed { id: link.id() });
        }

        fn register_as(&mut self, name: &str, auth_key: &str, port: u16) -> ChannelLink {
            let link = self.connect();
            self.says(
                &link,
                ControlMessage::ServerRequestAllocation {
                    version: PROTOCOL_VERSION,
                    name: name.into(),
                    auth_key: auth_key.into(),
                    public_ip: [10, 0, 0, 2],
                    port,
                    world_id: 0,
                    world_name: "Tether".into(),
                },
            );
            link
        }

        fn register(&mut self, name: &str, port: u16) -> ChannelLink {
            let link = self.register_as(name, "secret", port);
            link.take_sent();
            link
        }
    }

    fn change_request(character_id: CharacterId, channel: u8) -> ControlMessage {
        ControlMessage::PlayerChangeServer {
            session: "conn_1".into(),
            character_id,
            world: 0,
            channel,
            cc: true,
            state: b"state".to_vec(),
        }
    }

    #[test]
    fn test_registration_assigns_slot_and_sends_rates() {
        let mut harness = Harness::new();
        let link = harness.register_as("Game1", "secret", 8586);

        assert_eq!(
            link.take_sent(),
            vec![
                ControlMessage::ServerAssignmentResult {
                    in_migration: false,
                    channel_id: 1,
                },
                ControlMessage::ChangeRates {
                    rates: Rates::default(),
                },
            ]
        );
        assert_eq!(harness.state.registered_channels(), 1);
    }

    #[test]
    fn test_bad_credentials_are_refused() {
        let mut harness = Harness::new();
        let wrong_key = harness.register_as("Game1", "guess", 8586);
        let unknown = harness.register_as("Game9", "secret", 8586);

        assert!(!wrong_key.is_open());
        assert!(!unknown.is_open());
        assert!(wrong_key.sent().is_empty());
        // Only a bad key is operator-relevant.
        assert_eq!(harness.alerts.messages().len(), 1);
        assert!(harness.alerts.messages()[0].contains("Game1"));
        assert_eq!(harness.state.registered_channels(), 0);
    }

    #[test]
    fn test_incompatible_version_is_refused() {
        let mut harness = Harness::new();
        let link = harness.connect();
        harness.says(
            &link,
            ControlMessage::ServerRequestAllocation {
                version: Version::new(PROTOCOL_VERSION.major + 1, 0),
                name: "Game1".into(),
                auth_key: "secret".into(),
                public_ip: [10, 0, 0, 2],
                port: 8586,
                world_id: 0,
                world_name: "Tether".into(),
            },
        );
        assert!(!link.is_open());
    }

    #[test]
    fn test_second_registration_under_a_name_starts_migration() {
        let mut harness = Harness::new();
        let old = harness.register("Game1", 8586);
        let replacement = harness.register_as("Game1", "secret", 8686);

        assert_eq!(
            replacement.take_sent().first(),
            Some(&ControlMessage::ServerAssignmentResult {
                in_migration: true,
                channel_id: 1,
            })
        );
        let entry = &harness.state.channels[&1];
        assert!(entry.in_maintenance);
        assert_eq!(entry.transfer, Some(replacement.id()));

        // A third process is turned away.
        let third = harness.register_as("Game1", "secret", 8786);
        assert!(!third.is_open());

        // Steps are relayed both ways.
        harness.says(&replacement, ControlMessage::migration(MigrationStatus::StartMigration));
        assert_eq!(
            old.take_sent(),
            vec![ControlMessage::migration(MigrationStatus::StartMigration)]
        );
        harness.says(
            &old,
            ControlMessage::migration_with_payload(
                MigrationStatus::DataTransferResponse,
                vec![1, 2],
            ),
        );
        assert_eq!(
            replacement.take_sent(),
            vec![ControlMessage::migration_with_payload(
                MigrationStatus::DataTransferResponse,
                vec![1, 2]
            )]
        );

        // The old process leaving promotes the replacement.
        harness.close(&old);
        let entry = &harness.state.channels[&1];
        assert_eq!(entry.primary, Some(replacement.id()));
        assert!(!entry.in_maintenance);
        assert!(harness.alerts.messages().is_empty());
    }

    #[test]
    fn test_replacement_loss_ends_maintenance_with_alert() {
        let mut harness = Harness::new();
        let old = harness.register("Game1", 8586);
        let replacement = harness.register("Game1", 8686);

        harness.close(&replacement);
        let entry = &harness.state.channels[&1];
        assert_eq!(entry.primary, Some(old.id()));
        assert!(!entry.in_maintenance);
        assert_eq!(harness.alerts.messages().len(), 1);
    }

    #[test]
    fn test_migration_step_outside_migration_is_dropped() {
        let mut harness = Harness::new();
        let first = harness.register("Game0", 8585);
        let second = harness.register("Game1", 8586);
        harness.says(&first, ControlMessage::migration(MigrationStatus::StartMigration));
        assert!(second.take_sent().is_empty());
    }

    #[test]
    fn test_channel_change_allocates_destination_and_forwards_state() {
        let mut harness = Harness::new();
        let source = harness.register("Game0", 8585);
        let destination = harness.register("Game1", 8586);

        harness.says(&source, change_request(7, 1));

        assert_eq!(
            source.take_sent(),
            vec![ControlMessage::PlayerChangeServerResult {
                session: "conn_1".into(),
                character_id: 7,
                ip: [10, 0, 0, 2],
                port: 8586,
            }]
        );
        assert_eq!(
            destination.take_sent(),
            vec![ControlMessage::PlayerChangeServerData {
                character_id: 7,
                state: b"state".to_vec(),
            }]
        );
        assert!(harness.backend.exists(&keys::migrating(7)).unwrap());
    }

    #[test]
    fn test_channel_change_rejections() {
        let mut harness = Harness::new();
        let source = harness.register("Game0", 8585);

        // Offline destination.
        harness.says(&source, change_request(7, 1));
        // Own channel.
        harness.says(&source, change_request(7, 0));
        // Unknown channel.
        harness.says(&source, change_request(7, 9));

        let sent = source.take_sent();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(ControlMessage::is_transfer_rejection));
        assert!(!harness.backend.exists(&keys::migrating(7)).unwrap());
    }

    #[test]
    fn test_pending_hold_rejects_second_transfer() {
        let mut harness = Harness::new();
        let source = harness.register("Game0", 8585);
        let destination = harness.register("Game1", 8586);

        harness.says(&source, change_request(7, 1));
        source.take_sent();
        destination.take_sent();

        harness.says(&source, change_request(7, 1));
        let sent = source.take_sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].is_transfer_rejection());
        assert!(destination.take_sent().is_empty());
    }

    #[test]
    fn test_evacuation_goes_to_replacement() {
        let mut harness = Harness::new();
        let old = harness.register("Game1", 8586);
        let replacement = harness.register("Game1", 8686);

        harness.says(&old, change_request(7, 1));

        assert_eq!(
            old.take_sent(),
            vec![ControlMessage::PlayerChangeServerResult {
                session: "conn_1".into(),
                character_id: 7,
                ip: [10, 0, 0, 2],
                port: 8686,
            }]
        );
        assert_eq!(replacement.take_sent().len(), 1);
    }

    #[test]
    fn test_directory_routes_relays() {
        let mut harness = Harness::new();
        let first = harness.register("Game0", 8585);
        let second = harness.register("Game1", 8586);
        harness.says(
            &second,
            ControlMessage::ServerRegisterPlayer {
                character_id: 7,
                user_id: 70,
                name: "player7".into(),
                job: 100,
                level: 30,
                gm_level: 0,
            },
        );

        let relay = ControlMessage::Relay {
            kind: tether_protocol::RelayKind::Buddy,
            character_id: 7,
            payload: vec![1],
        };
        harness.says(&first, relay.clone());
        assert_eq!(second.take_sent(), vec![relay.clone()]);

        // A stale unregister from another process does not drop the entry.
        harness.says(&first, ControlMessage::ServerUnregisterPlayer { character_id: 7, cc: true });
        assert_eq!(harness.state.directory[&7].name, "player7");
        assert_eq!(harness.state.directory[&7].user_id, 70);
        assert_eq!(harness.state.directory[&7].channel, 1);

        harness.close(&second);
        harness.says(&first, relay);
        assert!(harness.state.directory.is_empty());
    }

    #[test]
    fn test_broadcasts_reach_registered_channels() {
        let mut harness = Harness::new();
        let first = harness.register("Game0", 8585);
        let second = harness.register("Game1", 8586);
        let stranger = harness.connect();

        harness.says(&first, ControlMessage::KickPlayer { user_id: 70 });
        harness.says(
            &first,
            ControlMessage::AdminMessage {
                message: "hello".into(),
                kind: 0,
            },
        );

        for link in [&first, &second] {
            assert_eq!(
                link.take_sent(),
                vec![
                    ControlMessage::KickPlayerResult { user_id: 70 },
                    ControlMessage::AdminMessage {
                        message: "hello".into(),
                        kind: 0,
                    },
                ]
            );
        }
        assert!(stranger.sent().is_empty());
    }

    #[test]
    fn test_rate_change_broadcast_once() {
        let mut harness = Harness::new();
        let first = harness.register("Game0", 8585);
        let second = harness.register("Game1", 8586);

        let doubled = Rates::new(2.0, 1.0, 1.0);
        harness.says(&first, ControlMessage::ChangeRates { rates: doubled });
        // The echo of the channels changes nothing.
        harness.says(&second, ControlMessage::ChangeRates { rates: doubled });

        assert_eq!(second.take_sent(), vec![ControlMessage::ChangeRates { rates: doubled }]);
        assert_eq!(first.take_sent().len(), 1);
    }

    #[test]
    fn test_connection_counts_become_online_count_leases() {
        let mut harness = Harness::new();
        let link = harness.register("Game1", 8586);
        harness.says(&link, ControlMessage::ServerSetConnectionsValue { count: 12 });

        assert_eq!(
            harness.backend.get(&keys::online_count(0, 1)).unwrap().as_deref(),
            Some("12")
        );
        harness.backend.del(&keys::online_count(0, 1)).unwrap();
        harness.state.refresh_online_counts();
        assert_eq!(
            harness.backend.get(&keys::online_count(0, 1)).unwrap().as_deref(),
            Some("12")
        );
    }

    #[test]
    fn test_message_before_registration_drops_peer() {
        let mut harness = Harness::new();
        let bystander = harness.register("Game0", 8585);
        let link = harness.connect();
        harness.says(&link, change_request(7, 1));

        assert!(link.sent().is_empty());
        assert!(!link.is_open());
        assert!(bystander.is_open());
        assert!(!harness.backend.exists(&keys::migrating(7)).unwrap());
    }

    #[test]
    fn test_channel_bound_message_drops_peer() {
        let mut harness = Harness::new();
        let link = harness.register("Game1", 8586);
        harness.says(
            &link,
            ControlMessage::ServerAssignmentResult {
                in_migration: false,
                channel_id: 0,
            },
        );
        assert!(!link.is_open());

        // The slot frees up once the transport reports the close.
        harness.close(&link);
        let again = harness.register_as("Game1", "secret", 8586);
        assert!(again.is_open());
        assert_eq!(harness.state.registered_channels(), 1);
    }

    #[test]
    fn test_newer_minor_version_registers() {
        let mut harness = Harness::new();
        let link = harness.connect();
        harness.says(
            &link,
            ControlMessage::ServerRequestAllocation {
                version: Version::new(PROTOCOL_VERSION.major, PROTOCOL_VERSION.minor + 1),
                name: "Game1".into(),
                auth_key: "secret".into(),
                public_ip: [10, 0, 0, 2],
                port: 8586,
                world_id: 0,
                world_name: "Tether".into(),
            },
        );
        assert!(link.is_open());
        assert_eq!(harness.state.registered_channels(), 1);
    }
}
