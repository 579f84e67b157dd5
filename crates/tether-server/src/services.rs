//! Process-wide services, built once by the process root and handed to the
//! role it runs.

use std::sync::Arc;
use tether_core::{LivenessMonitor, PresenceStore};

use crate::alert::AlertSink;
use crate::http::SharedStatus;

#[derive(Clone)]
pub struct Services {
    pub presence: Arc<PresenceStore>,
    pub liveness: Arc<LivenessMonitor>,
    pub alerts: Arc<dyn AlertSink>,
    pub status: SharedStatus,
}
