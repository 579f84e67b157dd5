//! # tether-core
//!
//! Building blocks that keep a Tether cluster consistent:
//!
//! - **Scheduler** - single logical thread for all state mutation
//! - **Presence** - TTL leases in the shared store
//! - **Liveness** - heartbeat-based dead connection detection
//! - **Handoff** - buffer for players moving between channels
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│  Liveness   │────▶│  Scheduler  │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                                                ▲
//!                     ┌─────────────┐            │
//!                     │  Presence   │────────────┘
//!                     └─────────────┘
//! ```

pub mod handoff;
pub mod liveness;
pub mod presence;
pub mod scheduler;
pub mod store;

pub use handoff::{PendingHandoff, PendingHandoffs};
pub use liveness::{LivenessConfig, LivenessMonitor, PassReport, Teardown};
pub use presence::{BootMode, HackKind, PresenceStore};
pub use scheduler::{RepeatingAction, Scheduler, SchedulerHandle, TaskId, TaskQueue, Tick};
pub use store::{KvBackend, MemoryBackend, PresenceError, RedisBackend};
