//! Client sessions: admission of inbound players, channel change, and
//! disconnect bookkeeping.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tether_core::presence::online_id;
use tether_core::{RepeatingAction, Tick};
use tether_protocol::{
    ip_from_wire, ip_to_wire, CharacterId, ClientMessage, ControlMessage, UserId, WireMessage,
};
use tether_transport::{Connection, ConnectionEvent, ConnectionId, Link, TransportError};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::ChannelState;
use crate::hooks::{HookError, PlayerProfile};
use crate::{metrics, net};

/// Why a channel change could not be requested.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("game layer: {0}")]
    Game(#[from] HookError),

    #[error("control link: {0}")]
    Link(#[from] TransportError),

    #[error("not connected to center")]
    NoCenter,
}

/// A character loaded on this process.
#[derive(Debug, Clone)]
pub(super) struct LoadedCharacter {
    pub(super) character_id: CharacterId,
    pub(super) user_id: UserId,
    pub(super) profile: PlayerProfile,
}

/// One connected client.
pub(super) struct ClientSession {
    pub(super) link: Arc<dyn Link<ClientMessage>>,
    pub(super) character: Option<LoadedCharacter>,
    /// The client was sent to another channel.
    pub(super) is_cc: bool,
}

impl ClientSession {
    fn new(link: Arc<dyn Link<ClientMessage>>) -> Self {
        Self {
            link,
            character: None,
            is_cc: false,
        }
    }
}

impl ChannelState {
    /// A client connected to the listener.
    pub fn on_client_connected(&mut self, _tick: &Tick, link: Arc<dyn Link<ClientMessage>>) {
        if self.shutting_down {
            link.disconnect();
            return;
        }
        let id = link.id();
        debug!(connection = %id, addr = ?link.remote_addr(), "Client connected");
        self.liveness.add(Arc::clone(&link).into_connection());
        self.sessions.insert(id, ClientSession::new(link));
        self.report_connections();
    }

    pub fn on_client_event(&mut self, _tick: &Tick, event: ConnectionEvent<ClientMessage>) {
        match event {
            ConnectionEvent::Message { id, message } => self.handle_client_message(id, message),
            ConnectionEvent::Closed { id } => self.on_client_closed(id),
        }
    }

    fn handle_client_message(&mut self, connection: ConnectionId, message: ClientMessage) {
        let Some(session) = self.sessions.get(&connection) else {
            debug!(connection = %connection, "Message from unknown client");
            return;
        };
        let character = session
            .character
            .as_ref()
            .map(|loaded| (loaded.character_id, loaded.user_id));
        let kind = message.kind();

        match message {
            ClientMessage::Ping { .. } => {}
            ClientMessage::Pong { .. } => {
                if let Some((_, user_id)) = character {
                    self.presence.set_player_online(user_id, self.online_id());
                }
            }
            ClientMessage::MigrateIn {
                character_id,
                user_id,
            } => self.admit(connection, character_id, user_id),
            ClientMessage::ChangeChannel { channel } => self.on_change_channel(connection, channel),
            ClientMessage::Payload { data } => {
                self.game
                    .on_client_payload(character.map(|(character_id, _)| character_id), &data);
            }
            ClientMessage::ConnectToServer { .. } | ClientMessage::TransferChannelIgnored => {
                if let Some(session) = self.sessions.get(&connection) {
                    net::drop_unexpected(&*session.link, kind, "from a client");
                }
            }
        }
    }

    /// Value of this process in online leases.
    fn online_id(&self) -> i32 {
        online_id(self.settings.world_id, self.channel_id.unwrap_or_default())
    }

    /// Resume a character announced by its client.
    fn admit(&mut self, connection: ConnectionId, character_id: CharacterId, user_id: UserId) {
        if self
            .sessions
            .get(&connection)
            .map_or(true, |session| session.character.is_some())
        {
            warn!(connection = %connection, "Client already carries a character");
            return;
        }

        if self.presence.holdoff_player_connection(character_id) {
            info!(character = character_id, "Channel change still in flight, bouncing client");
            self.send_to_client(
                connection,
                &ClientMessage::ConnectToServer {
                    ip: ip_to_wire(self.settings.public_ip),
                    port: self.settings.port,
                },
            );
            self.schedule_disconnect(connection);
            return;
        }

        match self.presence.claim_migration_hold(character_id, true) {
            Ok(true) => {}
            Ok(false) => {
                info!(character = character_id, "No migration hold, refusing client");
                self.disconnect_client(connection);
                return;
            }
            Err(e) => {
                warn!(
                    character = character_id,
                    "Could not claim migration hold, refusing client: {}",
                    e
                );
                self.disconnect_client(connection);
                return;
            }
        }

        if self.characters.contains_key(&character_id) {
            warn!(character = character_id, "Character already online here");
            self.disconnect_client(connection);
            return;
        }

        let state = self.handoffs.claim(character_id).map(|handoff| {
            metrics::record_handoff("claimed");
            handoff.state
        });
        let profile = match self.game.resume_player(character_id, user_id, state) {
            Ok(profile) => profile,
            Err(e) => {
                warn!(character = character_id, "Failed to load character: {}", e);
                self.disconnect_client(connection);
                return;
            }
        };

        let loaded = LoadedCharacter {
            character_id,
            user_id,
            profile,
        };
        self.presence.set_player_online(user_id, self.online_id());
        self.send_to_center(&register_message(&loaded));
        if let Some(session) = self.sessions.get_mut(&connection) {
            session.character = Some(loaded);
        }
        self.characters.insert(character_id, connection);
        info!(connection = %connection, character = character_id, "Player loaded");
    }

    /// Re-announce every loaded character, after center came back.
    pub(super) fn announce_players(&self) {
        for session in self.sessions.values() {
            if let Some(loaded) = &session.character {
                self.send_to_center(&register_message(loaded));
            }
        }
    }

    fn on_change_channel(&mut self, connection: ConnectionId, channel: u8) {
        let Some(character_id) = self
            .sessions
            .get(&connection)
            .and_then(|session| session.character.as_ref())
            .map(|loaded| loaded.character_id)
        else {
            debug!(connection = %connection, "Channel change before load");
            return;
        };

        if Some(channel) == self.channel_id
            || self.shutting_down
            || self.migration.phase().is_active()
        {
            self.send_to_client(connection, &ClientMessage::TransferChannelIgnored);
            return;
        }

        if let Err(e) = self.request_transfer(connection, character_id, channel) {
            warn!(character = character_id, channel, "Channel change failed: {}", e);
            metrics::record_transfer("failed");
            self.send_to_client(connection, &ClientMessage::TransferChannelIgnored);
        }
    }

    /// Ask center for a destination on `channel`, shipping the resumable
    /// state of the character along.
    pub(super) fn request_transfer(
        &mut self,
        connection: ConnectionId,
        character_id: CharacterId,
        channel: u8,
    ) -> Result<(), TransferError> {
        let state = self.game.encode_for_transfer(character_id)?;
        let center = self.center.as_ref().ok_or(TransferError::NoCenter)?;
        center.send(&ControlMessage::PlayerChangeServer {
            session: connection.to_string(),
            character_id,
            world: self.settings.world_id,
            channel,
            cc: true,
            state,
        })?;
        debug!(character = character_id, channel, "Requested channel change");
        Ok(())
    }

    /// Center answered a channel change request.
    pub(super) fn on_transfer_result(
        &mut self,
        session: &str,
        character_id: CharacterId,
        ip: [u8; 4],
        port: u16,
    ) {
        let Some(&connection) = self.characters.get(&character_id) else {
            debug!(character = character_id, "Transfer result for a player no longer here");
            return;
        };
        if connection.to_string() != session {
            debug!(character = character_id, session, "Stale transfer result");
            return;
        }

        if port == 0 {
            info!(character = character_id, "Channel change rejected by center");
            metrics::record_transfer("rejected");
            self.send_to_client(connection, &ClientMessage::TransferChannelIgnored);
            if self.migration.evacuation.is_some() {
                self.disconnect_client(connection);
            }
            return;
        }

        if let Err(e) = self.game.detach_transient(character_id) {
            warn!(character = character_id, "Failed to detach session state: {}", e);
        }
        self.presence.set_cc_processing(character_id);
        if let Some(session) = self.sessions.get_mut(&connection) {
            session.is_cc = true;
        }

        metrics::record_transfer("accepted");
        info!(character = character_id, ip = %ip_from_wire(ip), port, "Redirecting player");
        self.send_to_client(connection, &ClientMessage::ConnectToServer { ip, port });
        self.schedule_disconnect(connection);
    }

    /// Disconnect every client of an account.
    pub(super) fn kick_account(&mut self, user_id: UserId) {
        let connections: Vec<ConnectionId> = self
            .sessions
            .iter()
            .filter(|(_, session)| {
                session
                    .character
                    .as_ref()
                    .is_some_and(|loaded| loaded.user_id == user_id)
            })
            .map(|(id, _)| *id)
            .collect();
        for connection in connections {
            info!(connection = %connection, user = user_id, "Kicking account");
            self.disconnect_client(connection);
        }
    }

    /// Drop a client that was told to go elsewhere and has not left.
    fn schedule_disconnect(&self, connection: ConnectionId) {
        let grace = self.settings.redirect_grace;
        RepeatingAction::new(
            "RedirectDisconnect",
            grace,
            Duration::ZERO,
            move |state: &mut ChannelState, _: &Tick| {
                state.disconnect_client(connection);
                ControlFlow::Break(())
            },
        )
        .start(&self.scheduler);
    }

    fn send_to_client(&self, connection: ConnectionId, message: &ClientMessage) {
        let Some(session) = self.sessions.get(&connection) else {
            return;
        };
        if let Err(e) = session.link.send(message) {
            debug!(
                connection = %connection,
                kind = message.kind(),
                "Failed to send to client: {}",
                e
            );
        }
    }

    /// Tear a client down. Bookkeeping runs when the transport reports the
    /// close.
    pub(super) fn disconnect_client(&mut self, connection: ConnectionId) {
        if let Some(session) = self.sessions.get(&connection) {
            if !session.link.disconnect() {
                debug!(connection = %connection, "Client already disconnected");
            }
        }
    }

    /// Forget a client. Safe to call more than once.
    pub(super) fn on_client_closed(&mut self, connection: ConnectionId) {
        self.liveness.remove(connection);
        let Some(session) = self.sessions.remove(&connection) else {
            return;
        };
        debug!(connection = %connection, cc = session.is_cc, "Client disconnected");

        if let Some(loaded) = session.character {
            let character_id = loaded.character_id;
            self.characters.remove(&character_id);
            self.game.on_player_left(character_id, session.is_cc);
            self.send_to_center(&ControlMessage::ServerUnregisterPlayer {
                character_id,
                cc: session.is_cc,
            });
            if !session.is_cc {
                self.presence.remove_player_online(loaded.user_id);
            }
            self.presence.arm_cc_cooldown(character_id);
        }
        self.report_connections();
    }
}

fn register_message(loaded: &LoadedCharacter) -> ControlMessage {
    ControlMessage::ServerRegisterPlayer {
        character_id: loaded.character_id,
        user_id: loaded.user_id,
        name: loaded.profile.name.clone(),
        job: loaded.profile.job,
        level: loaded.profile.level,
        gm_level: loaded.profile.gm_level,
    }
}
