//! Seam between the cluster core and the gameplay layer.
//!
//! The core never looks inside maps, characters, or items. It asks the game
//! layer through [`GameHooks`] and moves the answers around as opaque bytes.

use bytes::Bytes;
use std::collections::HashSet;
use tether_protocol::{CharacterId, MigrationPayload, Rates, RelayKind, UserId};
use thiserror::Error;

use crate::channel::migration::MigrationPhase;

/// Errors reported by the gameplay layer.
#[derive(Debug, Error)]
pub enum HookError {
    /// The character is not loaded on this process.
    #[error("character {0} is not loaded")]
    UnknownCharacter(CharacterId),

    /// Any other gameplay failure.
    #[error("{0}")]
    Failed(String),
}

/// Directory data of a character that finished loading.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PlayerProfile {
    pub name: String,
    pub job: i16,
    pub level: u8,
    pub gm_level: u8,
}

/// Callbacks the core invokes on the gameplay layer. All of them run on the
/// scheduler thread.
pub trait GameHooks: Send {
    /// World rates changed.
    fn on_rates_changed(&mut self, _rates: &Rates) {}

    /// An admin broadcast arrived.
    fn on_admin_message(&mut self, _message: &str, _kind: u8) {}

    /// Social traffic for a character on this process arrived.
    fn on_relay(&mut self, _kind: RelayKind, _character_id: CharacterId, _payload: &[u8]) {}

    /// The whole-process migration entered a new phase.
    fn on_migration_phase(&mut self, _phase: MigrationPhase) {}

    /// A character left this process. `cc` is set when it moved to another
    /// channel.
    fn on_player_left(&mut self, _character_id: CharacterId, _cc: bool) {}

    /// Game traffic from a client.
    fn on_client_payload(&mut self, _character_id: Option<CharacterId>, _data: &[u8]) {}

    /// Capture the world state that has to survive a process swap.
    ///
    /// # Errors
    ///
    /// Returns an error if the world cannot be captured.
    fn snapshot_world(&mut self) -> Result<MigrationPayload, HookError>;

    /// Apply a world state captured by the previous process.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be applied.
    fn restore_world(&mut self, payload: MigrationPayload) -> Result<(), HookError>;

    /// Tear down per-session side processes of a character (trades, mini
    /// games, scripted dialogs).
    ///
    /// # Errors
    ///
    /// Returns an error if the character is unknown or teardown fails.
    fn detach_transient(&mut self, character_id: CharacterId) -> Result<(), HookError>;

    /// Whether the character idles on a map outside town.
    ///
    /// # Errors
    ///
    /// Returns an error if the character is unknown.
    fn is_idle_away_from_town(&mut self, character_id: CharacterId) -> Result<bool, HookError>;

    /// Move the character to its return town.
    ///
    /// # Errors
    ///
    /// Returns an error if the character is unknown or cannot be moved.
    fn return_to_town(&mut self, character_id: CharacterId) -> Result<(), HookError>;

    /// Whether the character can be resumed elsewhere, or is mid-action and
    /// has to be disconnected.
    ///
    /// # Errors
    ///
    /// Returns an error if the character is unknown.
    fn is_resumable(&mut self, character_id: CharacterId) -> Result<bool, HookError>;

    /// Serialize the resumable state of a character.
    ///
    /// # Errors
    ///
    /// Returns an error if the character is unknown or cannot be serialized.
    fn encode_for_transfer(&mut self, character_id: CharacterId) -> Result<Vec<u8>, HookError>;

    /// Load a character on this process, with the state buffered by a
    /// hand-off if one arrived.
    ///
    /// # Errors
    ///
    /// Returns an error if the character cannot be loaded.
    fn resume_player(
        &mut self,
        character_id: CharacterId,
        user_id: UserId,
        state: Option<Bytes>,
    ) -> Result<PlayerProfile, HookError>;
}

/// Gameplay layer that holds no world: every character is resumable and
/// idles in town.
#[derive(Debug, Default)]
pub struct NullGame {
    loaded: HashSet<CharacterId>,
}

impl NullGame {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn require(&self, character_id: CharacterId) -> Result<(), HookError> {
        if self.loaded.contains(&character_id) {
            Ok(())
        } else {
            Err(HookError::UnknownCharacter(character_id))
        }
    }
}

impl GameHooks for NullGame {
    fn on_player_left(&mut self, character_id: CharacterId, _cc: bool) {
        self.loaded.remove(&character_id);
    }

    fn snapshot_world(&mut self) -> Result<MigrationPayload, HookError> {
        Ok(MigrationPayload::default())
    }

    fn restore_world(&mut self, _payload: MigrationPayload) -> Result<(), HookError> {
        Ok(())
    }

    fn detach_transient(&mut self, character_id: CharacterId) -> Result<(), HookError> {
        self.require(character_id)
    }

    fn is_idle_away_from_town(&mut self, character_id: CharacterId) -> Result<bool, HookError> {
        self.require(character_id).map(|()| false)
    }

    fn return_to_town(&mut self, character_id: CharacterId) -> Result<(), HookError> {
        self.require(character_id)
    }

    fn is_resumable(&mut self, character_id: CharacterId) -> Result<bool, HookError> {
        self.require(character_id).map(|()| true)
    }

    fn encode_for_transfer(&mut self, character_id: CharacterId) -> Result<Vec<u8>, HookError> {
        self.require(character_id)?;
        Ok(character_id.to_be_bytes().to_vec())
    }

    fn resume_player(
        &mut self,
        character_id: CharacterId,
        _user_id: UserId,
        _state: Option<Bytes>,
    ) -> Result<PlayerProfile, HookError> {
        self.loaded.insert(character_id);
        Ok(PlayerProfile {
            name: format!("character-{character_id}"),
            ..PlayerProfile::default()
        })
    }
}
