//! Messages exchanged between a channel process and game clients.
//!
//! Only the messages the cluster core itself needs are modelled; game traffic
//! rides in [`ClientMessage::Payload`] and is handed to the game layer as-is.

use serde::{Deserialize, Serialize};

use crate::codec::{Heartbeat, WireMessage};
use crate::control::{CharacterId, UserId};

/// A client link message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
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

    /// Client → channel: resume a character on this process.
    #[serde(rename = "migrate_in")]
    MigrateIn {
        character_id: CharacterId,
        user_id: UserId,
    },

    /// Client → channel: move me to another channel of this world.
    #[serde(rename = "change_channel")]
    ChangeChannel { channel: u8 },

    /// Channel → client: reconnect to the given endpoint.
    #[serde(rename = "connect_to_server")]
    ConnectToServer { ip: [u8; 4], port: u16 },

    /// Channel → client: the channel change request was refused.
    #[serde(rename = "transfer_channel_ignored")]
    TransferChannelIgnored,

    /// Either direction: game traffic opaque to the cluster core.
    #[serde(rename = "payload")]
    Payload {
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
}

impl WireMessage for ClientMessage {
    fn ping(timestamp: Option<u64>) -> Self {
        ClientMessage::Ping { timestamp }
    }

    fn pong(timestamp: Option<u64>) -> Self {
        ClientMessage::Pong { timestamp }
    }

    fn heartbeat(&self) -> Option<Heartbeat> {
        match self {
            ClientMessage::Ping { timestamp } => Some(Heartbeat::Ping(*timestamp)),
            ClientMessage::Pong { timestamp } => Some(Heartbeat::Pong(*timestamp)),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Ping { .. } => "ping",
            ClientMessage::Pong { .. } => "pong",
            ClientMessage::MigrateIn { .. } => "migrate_in",
            ClientMessage::ChangeChannel { .. } => "change_channel",
            ClientMessage::ConnectToServer { .. } => "connect_to_server",
            ClientMessage::TransferChannelIgnored => "transfer_channel_ignored",
            ClientMessage::Payload { .. } => "payload",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode, encode};

    #[test]
    fn test_unit_variant_roundtrip() {
        let encoded = encode(&ClientMessage::TransferChannelIgnored).unwrap();
        let decoded: ClientMessage = decode(&encoded).unwrap();
        assert_eq!(decoded, ClientMessage::TransferChannelIgnored);
    }

    #[test]
    fn test_payload_is_opaque() {
        let message = ClientMessage::Payload {
            data: vec![0xde, 0xad, 0xbe, 0xef],
        };
        let decoded: ClientMessage = decode(&encode(&message).unwrap()).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.kind(), "payload");
        assert!(decoded.heartbeat().is_none());
    }
}
