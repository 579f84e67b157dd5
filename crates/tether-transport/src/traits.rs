//! Transport abstraction traits for Tether.
//!
//! These traits define what the rest of the cluster needs from a connection,
//! allowing heartbeat and protocol logic to run against TCP or in-memory
//! connections alike.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Process-local identifier of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl ConnectionId {
    /// Create a connection ID from a raw value.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Allocate the next unused connection ID of this process.
    #[must_use]
    pub fn generate() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{}", self.0)
    }
}

impl From<u64> for ConnectionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A dial did not complete in time.
    #[error("Connection timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] tether_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Heartbeat bookkeeping of one connection.
///
/// The pong flag is set by whichever task reads the connection, the loss
/// counter is only touched by the liveness pass.
#[derive(Debug)]
pub struct Liveness {
    lost_pings: AtomicU32,
    got_pong: AtomicBool,
}

impl Liveness {
    /// Create fresh counters. A new connection counts as having answered.
    #[must_use]
    pub fn new() -> Self {
        Self {
            lost_pings: AtomicU32::new(0),
            got_pong: AtomicBool::new(true),
        }
    }

    /// Record that a pong arrived.
    pub fn record_pong(&self) {
        self.got_pong.store(true, Ordering::SeqCst);
    }

    /// Consume the pong flag, returning whether a pong arrived since the
    /// last call.
    pub fn take_pong(&self) -> bool {
        self.got_pong.swap(false, Ordering::SeqCst)
    }

    /// Pings sent since the last pong.
    #[must_use]
    pub fn lost_pings(&self) -> u32 {
        self.lost_pings.load(Ordering::SeqCst)
    }

    pub fn reset_lost_pings(&self) {
        self.lost_pings.store(0, Ordering::SeqCst);
    }

    /// Count one more unanswered ping, returning the new total.
    pub fn increment_lost_pings(&self) -> u32 {
        self.lost_pings.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// An active connection, seen from the heartbeat and bookkeeping side.
///
/// All methods take `&self`: connections are shared between the reader task,
/// the scheduler, and the liveness monitor.
pub trait Connection: Send + Sync {
    /// Get the connection's unique identifier.
    fn id(&self) -> ConnectionId;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Heartbeat counters of this connection.
    fn liveness(&self) -> &Liveness;

    /// Send a heartbeat ping.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed or the send fails.
    fn send_ping(&self) -> Result<(), TransportError>;

    /// Tear the connection down.
    ///
    /// Returns `true` if this call closed the connection and `false` if it
    /// was already gone. Calling it again is a no-op.
    fn disconnect(&self) -> bool;

    /// Check if the connection is still open.
    fn is_open(&self) -> bool;
}

/// A connection that carries messages of type `M`.
pub trait Link<M>: Connection {
    /// Queue a message on the outbound path.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed or encoding fails.
    fn send(&self, message: &M) -> Result<(), TransportError>;

    /// View this link as a plain connection.
    fn into_connection(self: Arc<Self>) -> Arc<dyn Connection>;
}

/// Something that happened on a connection, delivered to its owner.
#[derive(Debug)]
pub enum ConnectionEvent<M> {
    /// A non-ping message arrived.
    Message { id: ConnectionId, message: M },
    /// The connection is gone. Emitted exactly once per connection.
    Closed { id: ConnectionId },
}
