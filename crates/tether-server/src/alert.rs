//! Operator alerting.
//!
//! Events an operator has to act on (rejected credentials, aborted
//! migrations, a channel that cannot reach center) go to an [`AlertSink`].

use tracing::error;

/// Receiver of free-text operator alerts.
pub trait AlertSink: Send + Sync {
    fn alert(&self, message: &str);
}

/// Alert sink that writes to the log under the `tether::alert` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn alert(&self, message: &str) {
        error!(target: "tether::alert", "{}", message);
    }
}
