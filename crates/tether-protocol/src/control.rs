//! Messages exchanged on the channel↔center control link.
//!
//! The control link is the single persistent connection between a channel
//! process and center. It carries registration, the per-player channel change
//! ("CC") protocol, the whole-process migration protocol, and relayed
//! social/admin traffic. Each variant is handled by exactly one handler on the
//! receiving side.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

use crate::codec::{Heartbeat, WireMessage};
use crate::version::Version;

/// Character identifier.
pub type CharacterId = i32;

/// Account identifier.
pub type UserId = i32;

/// Phase markers of the whole-process migration protocol.
///
/// The order of the variants is the order of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum MigrationStatus {
    /// Replacement → old: begin handing over.
    StartMigration = 0,
    /// Old → replacement: old stopped listening, replacement may start.
    StartListening = 1,
    /// Replacement → old: send me your world state.
    DataTransferRequest = 2,
    /// Old → replacement: compressed world state.
    DataTransferResponse = 3,
    /// Replacement → old: state applied, start moving players.
    FinishedInitialization = 4,
    /// Old → replacement: evacuation done, old is shutting down.
    PlayersMigrated = 5,
}

impl From<MigrationStatus> for u8 {
    fn from(status: MigrationStatus) -> u8 {
        status as u8
    }
}

impl TryFrom<u8> for MigrationStatus {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MigrationStatus::StartMigration),
            1 => Ok(MigrationStatus::StartListening),
            2 => Ok(MigrationStatus::DataTransferRequest),
            3 => Ok(MigrationStatus::DataTransferResponse),
            4 => Ok(MigrationStatus::FinishedInitialization),
            5 => Ok(MigrationStatus::PlayersMigrated),
            _ => Err("Invalid migration status"),
        }
    }
}

/// Kind of social traffic relayed through center.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum RelayKind {
    Party = 0,
    Guild = 1,
    Buddy = 2,
    Messenger = 3,
    Whisper = 4,
}

impl From<RelayKind> for u8 {
    fn from(kind: RelayKind) -> u8 {
        kind as u8
    }
}

impl TryFrom<u8> for RelayKind {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(RelayKind::Party),
            1 => Ok(RelayKind::Guild),
            2 => Ok(RelayKind::Buddy),
            3 => Ok(RelayKind::Messenger),
            4 => Ok(RelayKind::Whisper),
            _ => Err("Invalid relay kind"),
        }
    }
}

/// World rate multipliers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rates {
    pub mob_exp: f64,
    pub meso_amount: f64,
    pub drop_chance: f64,
}

impl Rates {
    #[must_use]
    pub const fn new(mob_exp: f64, meso_amount: f64, drop_chance: f64) -> Self {
        Self {
            mob_exp,
            meso_amount,
            drop_chance,
        }
    }

    /// Apply every strictly positive rate of `update` to `self`.
    ///
    /// Returns `true` if anything changed.
    pub fn merge(&mut self, update: &Rates) -> bool {
        let mut changed = false;
        for (current, new) in [
            (&mut self.mob_exp, update.mob_exp),
            (&mut self.meso_amount, update.meso_amount),
            (&mut self.drop_chance, update.drop_chance),
        ] {
            if new > 0.0 && *current != new {
                *current = new;
                changed = true;
            }
        }
        changed
    }
}

impl Default for Rates {
    fn default() -> Self {
        Self::new(1.0, 1.0, 1.0)
    }
}

/// A control link message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Channel → center: registration request.
    #[serde(rename = "server_request_allocation")]
    ServerRequestAllocation {
        version: Version,
        name: String,
        auth_key: String,
        public_ip: [u8; 4],
        port: u16,
        world_id: u8,
        world_name: String,
    },

    /// Center → channel: identity assignment.
    #[serde(rename = "server_assignment_result")]
    ServerAssignmentResult {
        /// Set when this process is the replacement of a live process.
        in_migration: bool,
        channel_id: u8,
    },

    /// Channel → center: number of connected clients changed.
    #[serde(rename = "server_set_connections_value")]
    ServerSetConnectionsValue { count: u32 },

    /// Channel → center: a character finished loading on this channel.
    #[serde(rename = "server_register_player")]
    ServerRegisterPlayer {
        character_id: CharacterId,
        user_id: UserId,
        name: String,
        job: i16,
        level: u8,
        gm_level: u8,
    },

    /// Channel → center: a character left this channel.
    #[serde(rename = "server_unregister_player")]
    ServerUnregisterPlayer {
        character_id: CharacterId,
        /// Whether the character left because of a channel change.
        cc: bool,
    },

    /// Channel → center: allocate a destination for a player.
    #[serde(rename = "player_change_server")]
    PlayerChangeServer {
        session: String,
        character_id: CharacterId,
        world: u8,
        channel: u8,
        cc: bool,
        /// Pre-serialized resumable state of the player.
        #[serde(with = "serde_bytes")]
        state: Vec<u8>,
    },

    /// Center → channel: destination for a player, port 0 on rejection.
    #[serde(rename = "player_change_server_result")]
    PlayerChangeServerResult {
        session: String,
        character_id: CharacterId,
        ip: [u8; 4],
        port: u16,
    },

    /// Center → destination channel: a player is inbound.
    #[serde(rename = "player_change_server_data")]
    PlayerChangeServerData {
        character_id: CharacterId,
        #[serde(with = "serde_bytes")]
        state: Vec<u8>,
    },

    /// Either direction: one step of the whole-process migration.
    #[serde(rename = "server_migration_update")]
    ServerMigrationUpdate {
        status: MigrationStatus,
        #[serde(with = "serde_bytes", default)]
        payload: Vec<u8>,
    },

    /// Center → channel: connect to a different center.
    #[serde(rename = "change_center_server")]
    ChangeCenterServer { ip: [u8; 4], port: u16 },

    /// Either direction: world rates.
    #[serde(rename = "change_rates")]
    ChangeRates { rates: Rates },

    /// Either direction: admin broadcast.
    #[serde(rename = "admin_message")]
    AdminMessage { message: String, kind: u8 },

    /// Channel → center: kick an account wherever it is online.
    #[serde(rename = "kick_player")]
    KickPlayer { user_id: UserId },

    /// Center → channel: disconnect an account if it is here.
    #[serde(rename = "kick_player_result")]
    KickPlayerResult { user_id: UserId },

    /// Either direction: opaque social traffic for one character.
    #[serde(rename = "relay")]
    Relay {
        kind: RelayKind,
        character_id: CharacterId,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
}

impl ControlMessage {
    /// Create a migration step without payload.
    #[must_use]
    pub fn migration(status: MigrationStatus) -> Self {
        ControlMessage::ServerMigrationUpdate {
            status,
            payload: Vec::new(),
        }
    }

    /// Create a migration step carrying a payload.
    #[must_use]
    pub fn migration_with_payload(status: MigrationStatus, payload: Vec<u8>) -> Self {
        ControlMessage::ServerMigrationUpdate { status, payload }
    }

    /// Create the "no destination" answer of a channel change request.
    #[must_use]
    pub fn transfer_rejected(session: impl Into<String>, character_id: CharacterId) -> Self {
        ControlMessage::PlayerChangeServerResult {
            session: session.into(),
            character_id,
            ip: [0; 4],
            port: 0,
        }
    }

    /// Whether this is a channel change answer signalling rejection.
    #[must_use]
    pub fn is_transfer_rejection(&self) -> bool {
        matches!(self, ControlMessage::PlayerChangeServerResult { port: 0, .. })
    }
}

impl WireMessage for ControlMessage {
    fn ping(timestamp: Option<u64>) -> Self {
        ControlMessage::Ping { timestamp }
    }

    fn pong(timestamp: Option<u64>) -> Self {
        ControlMessage::Pong { timestamp }
    }

    fn heartbeat(&self) -> Option<Heartbeat> {
        match self {
            ControlMessage::Ping { timestamp } => Some(Heartbeat::Ping(*timestamp)),
            ControlMessage::Pong { timestamp } => Some(Heartbeat::Pong(*timestamp)),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Ping { .. } => "ping",
            ControlMessage::Pong { .. } => "pong",
            ControlMessage::ServerRequestAllocation { .. } => "server_request_allocation",
            ControlMessage::ServerAssignmentResult { .. } => "server_assignment_result",
            ControlMessage::ServerSetConnectionsValue { .. } => "server_set_connections_value",
            ControlMessage::ServerRegisterPlayer { .. } => "server_register_player",
            ControlMessage::ServerUnregisterPlayer { .. } => "server_unregister_player",
            ControlMessage::PlayerChangeServer { .. } => "player_change_server",
            ControlMessage::PlayerChangeServerResult { .. } => "player_change_server_result",
            ControlMessage::PlayerChangeServerData { .. } => "player_change_server_data",
            ControlMessage::ServerMigrationUpdate { .. } => "server_migration_update",
            ControlMessage::ChangeCenterServer { .. } => "change_center_server",
            ControlMessage::ChangeRates { .. } => "change_rates",
            ControlMessage::AdminMessage { .. } => "admin_message",
            ControlMessage::KickPlayer { .. } => "kick_player",
            ControlMessage::KickPlayerResult { .. } => "kick_player_result",
            ControlMessage::Relay { .. } => "relay",
        }
    }
}

/// Convert an address to its wire form.
#[must_use]
pub fn ip_to_wire(ip: Ipv4Addr) -> [u8; 4] {
    ip.octets()
}

/// Convert a wire address back.
#[must_use]
pub fn ip_from_wire(ip: [u8; 4]) -> Ipv4Addr {
    Ipv4Addr::from(ip)
}
