//! # tether-transport
//!
//! Connection abstraction for the Tether cluster.
//!
//! Every link a process holds, to center or to a game client, is exposed as
//! a [`Connection`]: an identity, liveness counters, a ping primitive, and an
//! idempotent teardown. [`Link`] adds typed sending on top.
//!
//! - **TCP** ([`tcp`]) - the production transport
//! - **Memory** ([`memory`]) - an in-process connection for tests
//!
//! ```rust,ignore
//! use tether_transport::{tcp::TcpConnection, ConnectionEvent};
//!
//! let (events, mut rx) = tokio::sync::mpsc::unbounded_channel();
//! let limit = Duration::from_secs(5);
//! let center = TcpConnection::<ControlMessage>::connect(addr, limit, events).await?;
//! while let Some(ConnectionEvent::Message { message, .. }) = rx.recv().await {
//!     // Dispatch message
//! }
//! ```

pub mod memory;
pub mod tcp;
pub mod traits;

pub use memory::MemoryConnection;
pub use tcp::{TcpAcceptor, TcpConnection};
pub use traits::{Connection, ConnectionEvent, ConnectionId, Link, Liveness, TransportError};
