//! Cluster-wide presence leases.
//!
//! A thin layer over a shared TTL store. Most facts are recorded by the mere
//! existence of a key; expiry, not deletion, is what guarantees that a
//! crashed process never leaves a fact behind forever.
//!
//! Lookups that decide whether a player may log in fail towards "blocked":
//! a false positive delays a reconnect, a false negative risks a duplicate
//! session.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::liveness::{MAX_LOST_PINGS, PING_PERIOD};
use crate::store::{KvBackend, PresenceError, RedisBackend};

/// Online lease lifetime under the default heartbeat. Longer than the
/// liveness loss window so a live player's lease never lapses between
/// refreshes. See [`PresenceStore::with_online_ttl`] for other heartbeats.
pub const ONLINE_TTL: Duration =
    Duration::from_secs((MAX_LOST_PINGS as u64 + 3) * PING_PERIOD.as_secs());

/// Migration-hold lease lifetime.
pub const MIGRATION_HOLD_TTL: Duration = Duration::from_secs(50);

/// CC-processing lease lifetime while a hand-off is in flight.
pub const CC_PROCESSING_TTL: Duration = Duration::from_secs(30);

/// Cooldown lease armed when a hand-off completes.
pub const CC_COOLDOWN_TTL: Duration = Duration::from_secs(1);

/// Per-channel online count lifetime.
pub const ONLINE_COUNT_TTL: Duration = Duration::from_secs(60);

/// Key names shared by every process of the cluster.
pub mod keys {
    pub fn online_player(user_id: i32) -> String {
        format!("online-player-{user_id}")
    }

    pub fn migrating(character_id: i32) -> String {
        format!("migrating-{character_id}")
    }

    pub fn processing_cc(character_id: i32) -> String {
        format!("processing-cc-{character_id}")
    }

    pub fn undercover(character_id: i32) -> String {
        format!("undercover-{character_id}")
    }

    pub fn imitate(character_id: i32) -> String {
        format!("imitate-{character_id}")
    }

    pub fn muted(character_id: i32) -> String {
        format!("muted-{character_id}")
    }

    pub fn cc_token(character_id: i32) -> String {
        format!("cctoken-{character_id}")
    }

    pub fn hack_detected(user_id: i32) -> String {
        format!("hack-detected-{user_id}")
    }

    pub fn online_count(world: u8, channel: u8) -> String {
        format!("online-players-{world}-{channel}")
    }
}

/// Value stored in an online lease: the process the player is on.
#[must_use]
pub fn online_id(world: u8, channel: u8) -> i32 {
    20_000 + i32::from(world) * 100 + i32::from(channel)
}

/// What to do when the store is unreachable at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootMode {
    /// Refuse to start.
    Production,
    /// Start with every presence operation a no-op.
    Development,
}

/// Client-side cheat kinds reported outside the game process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HackKind(u8);

impl HackKind {
    pub const MEMORY_EDITS: HackKind = HackKind(0x01);
    pub const SPEEDHACK: HackKind = HackKind(0x02);

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: HackKind) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn union(self, other: HackKind) -> HackKind {
        HackKind(self.0 | other.0)
    }
}

impl fmt::Display for HackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(HackKind::MEMORY_EDITS) {
            names.push("MemoryEdits");
        }
        if self.contains(HackKind::SPEEDHACK) {
            names.push("Speedhack");
        }
        if names.is_empty() {
            return write!(f, "{}", self.0);
        }
        write!(f, "{}", names.join(", "))
    }
}

impl FromStr for HackKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(bits) = s.trim().parse::<u8>() {
            return Ok(HackKind(bits));
        }
        let mut kind = HackKind::default();
        for name in s.split(',').map(str::trim) {
            kind = kind.union(match name {
                "MemoryEdits" => HackKind::MEMORY_EDITS,
                "Speedhack" => HackKind::SPEEDHACK,
                _ => return Err(()),
            });
        }
        Ok(kind)
    }
}

/// Presence operations over an optional backend.
///
/// Without a backend every write is skipped and every lookup answers as if
/// nothing were recorded.
pub struct PresenceStore {
    backend: Option<Arc<dyn KvBackend>>,
    lookup_failures: AtomicU64,
    online_ttl: Duration,
}

impl PresenceStore {
    /// Create a store over a backend.
    #[must_use]
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self {
            backend: Some(backend),
            lookup_failures: AtomicU64::new(0),
            online_ttl: ONLINE_TTL,
        }
    }

    /// Create a store without a backend.
    #[must_use]
    pub fn degraded() -> Self {
        Self {
            backend: None,
            lookup_failures: AtomicU64::new(0),
            online_ttl: ONLINE_TTL,
        }
    }

    /// Use `ttl` for online leases. Must outlive the heartbeat loss window
    /// of the processes refreshing them.
    #[must_use]
    pub fn with_online_ttl(mut self, ttl: Duration) -> Self {
        self.online_ttl = ttl;
        self
    }

    #[must_use]
    pub fn online_ttl(&self) -> Duration {
        self.online_ttl
    }

    /// Connect to the Redis store at `url`, applying the boot policy when it
    /// is missing or unreachable.
    ///
    /// # Errors
    ///
    /// Returns an error in [`BootMode::Production`] if the store cannot be
    /// used.
    pub fn connect(
        url: Option<&str>,
        mode: BootMode,
        timeout: Duration,
    ) -> Result<Self, PresenceError> {
        let result = match url {
            Some(url) => RedisBackend::connect(url, timeout),
            None => Err(PresenceError::Unavailable),
        };

        match (result, mode) {
            (Ok(backend), _) => {
                info!("Presence store connected");
                Ok(Self::new(Arc::new(backend)))
            }
            (Err(e), BootMode::Production) => Err(e),
            (Err(e), BootMode::Development) => {
                warn!("Presence store unavailable ({}), running without it", e);
                Ok(Self::degraded())
            }
        }
    }

    /// Whether a backend is attached.
    #[must_use]
    pub fn is_running_normally(&self) -> bool {
        self.backend.is_some()
    }

    /// Lookups and writes that failed since start.
    #[must_use]
    pub fn lookup_failures(&self) -> u64 {
        self.lookup_failures.load(Ordering::Relaxed)
    }

    fn failed(&self, op: &str, key: &str, error: &PresenceError) {
        self.lookup_failures.fetch_add(1, Ordering::Relaxed);
        warn!(key, "Presence {} failed: {}", op, error);
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        if let Some(backend) = &self.backend {
            if let Err(e) = backend.set(key, value, ttl) {
                self.failed("SET", key, &e);
            }
        }
    }

    fn del(&self, key: &str) {
        if let Some(backend) = &self.backend {
            if let Err(e) = backend.del(key) {
                self.failed("DEL", key, &e);
            }
        }
    }

    /// Existence check that resolves failures to `true`.
    fn exists_or_blocked(&self, key: &str) -> bool {
        let Some(backend) = &self.backend else {
            return false;
        };
        match backend.exists(key) {
            Ok(exists) => exists,
            Err(e) => {
                self.failed("EXISTS", key, &e);
                true
            }
        }
    }

    fn get(&self, key: &str) -> Option<String> {
        let backend = self.backend.as_ref()?;
        match backend.get(key) {
            Ok(value) => value,
            Err(e) => {
                self.failed("GET", key, &e);
                None
            }
        }
    }

    // Online lease

    /// Record that an account is online on `online_id`. Refreshed on every
    /// pong.
    pub fn set_player_online(&self, user_id: i32, online_id: i32) {
        self.set(
            &keys::online_player(user_id),
            &online_id.to_string(),
            Some(self.online_ttl),
        );
    }

    pub fn remove_player_online(&self, user_id: i32) {
        self.del(&keys::online_player(user_id));
    }

    /// Whether an account is online anywhere. A failed lookup counts as
    /// online.
    #[must_use]
    pub fn is_player_online(&self, user_id: i32) -> bool {
        self.exists_or_blocked(&keys::online_player(user_id))
    }

    // Channel change leases

    /// Mark a hand-off of `character_id` as in flight.
    pub fn set_cc_processing(&self, character_id: i32) {
        self.set(&keys::processing_cc(character_id), "", Some(CC_PROCESSING_TTL));
    }

    /// Re-arm the CC-processing lease with the short cooldown lifetime, so
    /// the character cannot reconnect instantly.
    pub fn arm_cc_cooldown(&self, character_id: i32) {
        self.set(&keys::processing_cc(character_id), "", Some(CC_COOLDOWN_TTL));
    }

    /// Whether a login of `character_id` has to wait. A failed lookup holds
    /// the player off.
    #[must_use]
    pub fn holdoff_player_connection(&self, character_id: i32) -> bool {
        self.exists_or_blocked(&keys::processing_cc(character_id))
    }

    /// Allow exactly one process to resume `character_id` within the hold
    /// lifetime.
    pub fn set_migration_hold(&self, character_id: i32) {
        self.set(&keys::migrating(character_id), "", Some(MIGRATION_HOLD_TTL));
    }

    /// Atomically claim the migration hold of `character_id`.
    ///
    /// Returns `true` for exactly one caller while the hold exists, and
    /// `fallback` when the store is not configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached; the caller decides
    /// the safe outcome.
    pub fn claim_migration_hold(
        &self,
        character_id: i32,
        fallback: bool,
    ) -> Result<bool, PresenceError> {
        let Some(backend) = &self.backend else {
            return Ok(fallback);
        };
        let key = keys::migrating(character_id);
        backend.del(&key).map_err(|e| {
            self.failed("DEL", &key, &e);
            e
        })
    }

    /// Store the reconnect token of a hand-off, hex-encoded.
    pub fn set_cc_token(&self, character_id: i32, token: &[u8]) {
        self.set(&keys::cc_token(character_id), &to_hex(token), None);
    }

    #[must_use]
    pub fn cc_token(&self, character_id: i32) -> Option<Vec<u8>> {
        self.get(&keys::cc_token(character_id))
            .and_then(|hex| from_hex(&hex))
    }

    // Directory

    pub fn set_online_count(&self, world: u8, channel: u8, count: u32) {
        self.set(
            &keys::online_count(world, channel),
            &count.to_string(),
            Some(ONLINE_COUNT_TTL),
        );
    }

    // Moderation

    /// Mute `character_id` for `hours`, recording who muted.
    pub fn mute(&self, muted_by: i32, character_id: i32, hours: u32) {
        self.set(
            &keys::muted(character_id),
            &muted_by.to_string(),
            Some(Duration::from_secs(u64::from(hours) * 3600)),
        );
    }

    pub fn unmute(&self, character_id: i32) {
        self.del(&keys::muted(character_id));
    }

    /// Remaining mute time, `None` if not muted.
    #[must_use]
    pub fn mute_remaining(&self, character_id: i32) -> Option<Duration> {
        let backend = self.backend.as_ref()?;
        let key = keys::muted(character_id);
        match backend.ttl(&key) {
            Ok(ttl) => ttl,
            Err(e) => {
                self.failed("TTL", &key, &e);
                None
            }
        }
    }

    #[must_use]
    pub fn is_undercover(&self, character_id: i32) -> bool {
        let Some(backend) = &self.backend else {
            return false;
        };
        let key = keys::undercover(character_id);
        backend.exists(&key).unwrap_or_else(|e| {
            self.failed("EXISTS", &key, &e);
            false
        })
    }

    pub fn set_undercover(&self, character_id: i32, undercover: bool) {
        let key = keys::undercover(character_id);
        if undercover {
            self.set(&key, "", None);
        } else {
            self.del(&key);
        }
    }

    /// Character whose appearance `character_id` imitates.
    #[must_use]
    pub fn imitate_id(&self, character_id: i32) -> Option<i32> {
        self.get(&keys::imitate(character_id))?.parse().ok()
    }

    /// Set the imitated character; `0` clears the mapping.
    pub fn set_imitate_id(&self, character_id: i32, victim_id: i32) {
        let key = keys::imitate(character_id);
        if victim_id == 0 {
            self.del(&key);
        } else {
            self.set(&key, &victim_id.to_string(), None);
        }
    }

    pub fn register_hack_detection(&self, user_id: i32, kind: HackKind) {
        self.set(&keys::hack_detected(user_id), &kind.to_string(), None);
    }

    /// Read and consume a pending hack detection of `user_id`.
    pub fn take_hack_detection(&self, user_id: i32) -> Option<HackKind> {
        let key = keys::hack_detected(user_id);
        let kind = self.get(&key)?.parse::<HackKind>().ok()?;
        self.del(&key);
        Some(kind)
    }
}

impl fmt::Debug for PresenceStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresenceStore")
            .field("running_normally", &self.is_running_normally())
            .field("lookup_failures", &self.lookup_failures())
            .finish()
    }
}

fn to_hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02X}")).collect()
}

fn from_hex(data: &str) -> Option<Vec<u8>> {
    if data.len() % 2 != 0 {
        return None;
    }
    (0..data.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(data.get(i..i + 2)?, 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::LivenessConfig;
    use crate::store::MemoryBackend;
    use std::sync::Barrier;
    use std::thread;

    struct FailingBackend;

    impl KvBackend for FailingBackend {
        fn set(&self, _: &str, _: &str, _: Option<Duration>) -> Result<(), PresenceError> {
            Err(PresenceError::Unavailable)
        }
        fn del(&self, _: &str) -> Result<bool, PresenceError> {
            Err(PresenceError::Unavailable)
        }
        fn exists(&self, _: &str) -> Result<bool, PresenceError> {
            Err(PresenceError::Unavailable)
        }
        fn get(&self, _: &str) -> Result<Option<String>, PresenceError> {
            Err(PresenceError::Unavailable)
        }
        fn ttl(&self, _: &str) -> Result<Option<Duration>, PresenceError> {
            Err(PresenceError::Unavailable)
        }
    }

    fn memory_store() -> (PresenceStore, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        (PresenceStore::new(backend.clone()), backend)
    }

    #[test]
    fn test_key_names() {
        assert_eq!(keys::online_player(42), "online-player-42");
        assert_eq!(keys::migrating(7), "migrating-7");
        assert_eq!(keys::processing_cc(7), "processing-cc-7");
        assert_eq!(keys::undercover(7), "undercover-7");
        assert_eq!(keys::imitate(7), "imitate-7");
        assert_eq!(keys::muted(7), "muted-7");
        assert_eq!(keys::cc_token(7), "cctoken-7");
        assert_eq!(keys::hack_detected(42), "hack-detected-42");
        assert_eq!(keys::online_count(0, 3), "online-players-0-3");
        assert_eq!(online_id(1, 4), 20_104);
    }

    #[test]
    fn test_online_ttl_outlives_loss_window() {
        assert!(ONLINE_TTL > PING_PERIOD * MAX_LOST_PINGS);
        assert_eq!(ONLINE_TTL, Duration::from_secs(90));
        assert_eq!(LivenessConfig::default().online_lease_ttl(), ONLINE_TTL);
        assert_eq!(PresenceStore::degraded().online_ttl(), ONLINE_TTL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_online_lease_follows_slow_heartbeat() {
        let liveness = LivenessConfig {
            period: Duration::from_secs(60),
            max_lost_pings: 3,
        };
        let backend = Arc::new(MemoryBackend::new());
        let store = PresenceStore::new(backend).with_online_ttl(liveness.online_lease_ttl());
        assert_eq!(store.online_ttl(), Duration::from_secs(360));

        store.set_player_online(3, online_id(0, 1));
        // A dead client is still online until the monitor has torn it down.
        tokio::time::advance(liveness.loss_window() + liveness.period).await;
        assert!(store.is_player_online(3));

        tokio::time::advance(liveness.period * 2).await;
        assert!(!store.is_player_online(3));
    }

    #[test]
    fn test_failed_lookup_counts_as_online() {
        let store = PresenceStore::new(Arc::new(FailingBackend));
        assert!(store.is_player_online(42));
        assert!(store.holdoff_player_connection(42));
        assert!(store.claim_migration_hold(42, true).is_err());
        assert!(store.lookup_failures() >= 3);
    }

    #[test]
    fn test_degraded_store_answers_permissively() {
        let store = PresenceStore::degraded();
        assert!(!store.is_running_normally());
        assert!(!store.is_player_online(1));
        assert!(!store.holdoff_player_connection(1));
        assert!(store.claim_migration_hold(1, true).unwrap());
        assert!(!store.claim_migration_hold(1, false).unwrap());
        store.set_player_online(1, online_id(0, 1));
        assert!(!store.is_player_online(1));
    }

    #[test]
    fn test_production_boot_without_store_is_fatal() {
        let result = PresenceStore::connect(None, BootMode::Production, Duration::from_millis(50));
        assert!(matches!(result, Err(PresenceError::Unavailable)));

        let store =
            PresenceStore::connect(None, BootMode::Development, Duration::from_millis(50)).unwrap();
        assert!(!store.is_running_normally());
    }

    #[test]
    fn test_migration_hold_claimed_once() {
        let (store, _) = memory_store();
        store.set_migration_hold(9);
        assert!(store.claim_migration_hold(9, false).unwrap());
        assert!(!store.claim_migration_hold(9, false).unwrap());
    }

    #[test]
    fn test_concurrent_claims_have_one_winner() {
        let backend = Arc::new(MemoryBackend::new());
        let setup = PresenceStore::new(backend.clone());

        for round in 0..50 {
            setup.set_migration_hold(round);

            let barrier = Arc::new(Barrier::new(2));
            let racers: Vec<_> = (0..2)
                .map(|_| {
                    let store = PresenceStore::new(backend.clone());
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        store.claim_migration_hold(round, false).unwrap()
                    })
                })
                .collect();

            let results: Vec<bool> = racers.into_iter().map(|r| r.join().unwrap()).collect();
            assert_eq!(results.iter().filter(|won| **won).count(), 1, "round {round}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cc_cooldown_expires() {
        let (store, backend) = memory_store();

        store.set_cc_processing(5);
        assert!(store.holdoff_player_connection(5));

        store.arm_cc_cooldown(5);
        assert!(backend.exists(&keys::processing_cc(5)).unwrap());

        tokio::time::advance(Duration::from_millis(900)).await;
        assert!(store.holdoff_player_connection(5));

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(!backend.exists(&keys::processing_cc(5)).unwrap());
        assert!(!store.holdoff_player_connection(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_online_lease_expires_without_refresh() {
        let (store, _) = memory_store();
        store.set_player_online(3, online_id(0, 1));
        assert!(store.is_player_online(3));

        tokio::time::advance(ONLINE_TTL - Duration::from_secs(1)).await;
        store.set_player_online(3, online_id(0, 1));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.is_player_online(3));

        tokio::time::advance(ONLINE_TTL).await;
        assert!(!store.is_player_online(3));
    }

    #[test]
    fn test_cc_token_is_hex_encoded() {
        let (store, backend) = memory_store();
        store.set_cc_token(1, &[0x00, 0xAB, 0x10]);
        assert_eq!(backend.get("cctoken-1").unwrap().as_deref(), Some("00AB10"));
        assert_eq!(store.cc_token(1), Some(vec![0x00, 0xAB, 0x10]));
        assert_eq!(store.cc_token(2), None);
    }

    #[test]
    fn test_imitate_zero_clears() {
        let (store, _) = memory_store();
        store.set_imitate_id(1, 77);
        assert_eq!(store.imitate_id(1), Some(77));
        store.set_imitate_id(1, 0);
        assert_eq!(store.imitate_id(1), None);
    }

    #[test]
    fn test_hack_detection_is_consumed() {
        let (store, _) = memory_store();
        let kind = HackKind::MEMORY_EDITS.union(HackKind::SPEEDHACK);
        store.register_hack_detection(4, kind);

        assert_eq!(store.take_hack_detection(4), Some(kind));
        assert_eq!(store.take_hack_detection(4), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mute_remaining() {
        let (store, _) = memory_store();
        assert_eq!(store.mute_remaining(8), None);

        store.mute(1, 8, 2);
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(store.mute_remaining(8), Some(Duration::from_secs(3600)));

        store.unmute(8);
        assert_eq!(store.mute_remaining(8), None);
    }

    #[test]
    fn test_undercover_flag() {
        let (store, _) = memory_store();
        assert!(!store.is_undercover(2));
        store.set_undercover(2, true);
        assert!(store.is_undercover(2));
        store.set_undercover(2, false);
        assert!(!store.is_undercover(2));
    }
}
