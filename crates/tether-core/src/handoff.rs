//! Buffer for players announced as inbound but not yet connected.

use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Interval of the reap sweep.
pub const REAP_INTERVAL: Duration = Duration::from_secs(5);

/// Age after which an unclaimed hand-off is discarded.
pub const MAX_HANDOFF_AGE: Duration = Duration::from_secs(10);

/// Resumable state of one inbound player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingHandoff {
    pub state: Bytes,
    pub enqueued_at: Instant,
}

/// Pending hand-offs keyed by character ID. Owned by the scheduler thread.
#[derive(Debug)]
pub struct PendingHandoffs {
    entries: HashMap<i32, PendingHandoff>,
    max_age: Duration,
}

impl PendingHandoffs {
    #[must_use]
    pub fn new(max_age: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            max_age,
        }
    }

    /// Buffer the state of an inbound character, replacing an older entry.
    pub fn insert(&mut self, character_id: i32, state: Bytes, now: Instant) {
        if self
            .entries
            .insert(
                character_id,
                PendingHandoff {
                    state,
                    enqueued_at: now,
                },
            )
            .is_some()
        {
            debug!(character = character_id, "Replaced pending hand-off");
        }
    }

    /// Take the buffered state of a character that just connected.
    pub fn claim(&mut self, character_id: i32) -> Option<PendingHandoff> {
        self.entries.remove(&character_id)
    }

    #[must_use]
    pub fn contains(&self, character_id: i32) -> bool {
        self.entries.contains_key(&character_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Discard entries older than the maximum age, returning their IDs.
    pub fn reap(&mut self, now: Instant) -> Vec<i32> {
        let max_age = self.max_age;
        let mut reaped = Vec::new();
        self.entries.retain(|character_id, handoff| {
            let keep = now.saturating_duration_since(handoff.enqueued_at) <= max_age;
            if !keep {
                reaped.push(*character_id);
            }
            keep
        });
        reaped.sort_unstable();
        reaped
    }
}

impl Default for PendingHandoffs {
    fn default() -> Self {
        Self::new(MAX_HANDOFF_AGE)
    }
}
