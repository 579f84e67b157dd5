//! # tether-protocol
//!
//! Wire protocol definitions for the Tether channel/center cluster.
//!
//! This crate defines the messages carried on the channel↔center control
//! link and on the channel↔client link, the length-prefixed MessagePack
//! codec shared by both, and the compressed world snapshot exchanged during
//! a whole-process migration.
//!
//! ## Example
//!
//! ```rust
//! use tether_protocol::{codec, ControlMessage, MigrationStatus};
//!
//! let message = ControlMessage::migration(MigrationStatus::StartMigration);
//!
//! let encoded = codec::encode(&message).unwrap();
//! let decoded: ControlMessage = codec::decode(&encoded).unwrap();
//! assert_eq!(message, decoded);
//! ```

pub mod client;
pub mod codec;
pub mod control;
pub mod migration;
pub mod version;

pub use client::ClientMessage;
pub use codec::{decode, encode, Heartbeat, ProtocolError, WireMessage};
pub use control::{
    ip_from_wire, ip_to_wire, CharacterId, ControlMessage, MigrationStatus, Rates, RelayKind,
    UserId,
};
pub use migration::{MapDrops, MigrationPayload, PartyRecord};
pub use version::{Version, VersionMismatch, PROTOCOL_VERSION};
