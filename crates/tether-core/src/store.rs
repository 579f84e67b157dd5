//! Key/value backends for the presence store.
//!
//! The cluster shares one remote TTL store. Every primitive is a blocking
//! call, made from a scheduler callback.

use dashmap::DashMap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Presence store errors.
#[derive(Debug, Error)]
pub enum PresenceError {
    /// The remote store rejected a command or could not be reached.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// No backend is configured and the process runs degraded.
    #[error("presence store unavailable")]
    Unavailable,

    /// The backend connection lock was poisoned by a panic.
    #[error("presence store connection poisoned")]
    Poisoned,
}

/// Primitive operations of a TTL key/value store.
pub trait KvBackend: Send + Sync {
    /// Store `value` under `key`, expiring after `ttl` if given.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached.
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), PresenceError>;

    /// Delete `key`, returning whether it existed. Must be atomic: of several
    /// concurrent callers at most one observes `true`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached.
    fn del(&self, key: &str) -> Result<bool, PresenceError>;

    /// Check whether `key` exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached.
    fn exists(&self, key: &str) -> Result<bool, PresenceError>;

    /// Read `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached.
    fn get(&self, key: &str) -> Result<Option<String>, PresenceError>;

    /// Remaining lifetime of `key`. `None` if it does not exist or never
    /// expires.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be reached.
    fn ttl(&self, key: &str) -> Result<Option<Duration>, PresenceError>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-process backend. Expiry follows tokio's clock, so paused-time tests
/// can step through TTLs.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: DashMap<String, Entry>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.is_live(now)).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvBackend for MemoryBackend {
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), PresenceError> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    fn del(&self, key: &str) -> Result<bool, PresenceError> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .map_or(false, |(_, entry)| entry.is_live(now)))
    }

    fn exists(&self, key: &str) -> Result<bool, PresenceError> {
        Ok(self.get(key)?.is_some())
    }

    fn get(&self, key: &str) -> Result<Option<String>, PresenceError> {
        let now = Instant::now();
        let value = self
            .entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone());
        if value.is_none() {
            self.entries.remove_if(key, |_, entry| !entry.is_live(now));
        }
        Ok(value)
    }

    fn ttl(&self, key: &str) -> Result<Option<Duration>, PresenceError> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }
}

/// Redis backend over a synchronous connection.
///
/// A failed command drops the connection; the next command reconnects.
pub struct RedisBackend {
    client: redis::Client,
    connection: Mutex<Option<redis::Connection>>,
    timeout: Duration,
}

impl RedisBackend {
    /// Connect to `url` and verify the server answers.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server is unreachable.
    pub fn connect(url: &str, timeout: Duration) -> Result<Self, PresenceError> {
        let client = redis::Client::open(url)?;
        let mut connection = Self::open(&client, timeout)?;
        redis::cmd("PING").query::<String>(&mut connection)?;
        debug!("Connected to presence store");

        Ok(Self {
            client,
            connection: Mutex::new(Some(connection)),
            timeout,
        })
    }

    fn open(client: &redis::Client, timeout: Duration) -> Result<redis::Connection, PresenceError> {
        let connection = client.get_connection_with_timeout(timeout)?;
        connection.set_read_timeout(Some(timeout))?;
        connection.set_write_timeout(Some(timeout))?;
        Ok(connection)
    }

    fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
    ) -> Result<T, PresenceError> {
        let mut slot = self.connection.lock().map_err(|_| PresenceError::Poisoned)?;

        if slot.is_none() {
            *slot = Some(Self::open(&self.client, self.timeout)?);
        }
        let Some(connection) = slot.as_mut() else {
            return Err(PresenceError::Unavailable);
        };

        match f(connection) {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.is_io_error() || e.is_timeout() || e.is_connection_dropped() {
                    warn!("Presence store connection lost: {}", e);
                    slot.take();
                }
                Err(e.into())
            }
        }
    }
}

impl KvBackend for RedisBackend {
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), PresenceError> {
        self.with_connection(|conn| match ttl {
            Some(ttl) => redis::cmd("PSETEX")
                .arg(key)
                .arg(ttl.as_millis().max(1) as u64)
                .arg(value)
                .query(conn),
            None => redis::cmd("SET").arg(key).arg(value).query(conn),
        })
    }

    fn del(&self, key: &str) -> Result<bool, PresenceError> {
        let removed: i64 = self.with_connection(|conn| redis::cmd("DEL").arg(key).query(conn))?;
        Ok(removed > 0)
    }

    fn exists(&self, key: &str) -> Result<bool, PresenceError> {
        let count: i64 = self.with_connection(|conn| redis::cmd("EXISTS").arg(key).query(conn))?;
        Ok(count > 0)
    }

    fn get(&self, key: &str) -> Result<Option<String>, PresenceError> {
        self.with_connection(|conn| redis::cmd("GET").arg(key).query(conn))
    }

    fn ttl(&self, key: &str) -> Result<Option<Duration>, PresenceError> {
        // -2: missing, -1: no expiry.
        let millis: i64 = self.with_connection(|conn| redis::cmd("PTTL").arg(key).query(conn))?;
        Ok(u64::try_from(millis).ok().map(Duration::from_millis))
    }
}
