//! Metrics collection and export for Tether.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use anyhow::{Context, Result};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tether_core::Teardown;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CLIENT_CONNECTIONS: &str = "tether_client_connections";
    pub const MONITORED_CONNECTIONS: &str = "tether_monitored_connections";
    pub const TEARDOWNS_TOTAL: &str = "tether_liveness_teardowns_total";
    pub const HANDOFFS_TOTAL: &str = "tether_handoffs_total";
    pub const TRANSFERS_TOTAL: &str = "tether_transfers_total";
    pub const MIGRATION_PHASES_TOTAL: &str = "tether_migration_phases_total";
    pub const SCHEDULER_QUEUE: &str = "tether_scheduler_queue_length";
    pub const DISPATCH_SECONDS: &str = "tether_scheduler_dispatch_seconds";
    pub const PRESENCE_FAILURES: &str = "tether_presence_failures_total";
    pub const REGISTERED_CHANNELS: &str = "tether_registered_channels";
    pub const PROTOCOL_VIOLATIONS_TOTAL: &str = "tether_protocol_violations_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_gauge!(
        names::CLIENT_CONNECTIONS,
        "Clients connected to this channel"
    );
    metrics::describe_gauge!(
        names::MONITORED_CONNECTIONS,
        "Connections under heartbeat monitoring"
    );
    metrics::describe_counter!(
        names::TEARDOWNS_TOTAL,
        "Connections torn down for missing pongs"
    );
    metrics::describe_counter!(
        names::HANDOFFS_TOTAL,
        "Inbound player hand-offs by outcome"
    );
    metrics::describe_counter!(names::TRANSFERS_TOTAL, "Channel change requests by outcome");
    metrics::describe_counter!(
        names::MIGRATION_PHASES_TOTAL,
        "Whole-process migration phases entered"
    );
    metrics::describe_gauge!(
        names::SCHEDULER_QUEUE,
        "Callbacks enqueued on the scheduler but not yet run"
    );
    metrics::describe_histogram!(
        names::DISPATCH_SECONDS,
        "Delay between a network event and its scheduler callback"
    );
    metrics::describe_counter!(
        names::PRESENCE_FAILURES,
        "Presence store operations that failed"
    );
    metrics::describe_gauge!(
        names::REGISTERED_CHANNELS,
        "Channel processes registered with center"
    );
    metrics::describe_counter!(
        names::PROTOCOL_VIOLATIONS_TOTAL,
        "Connections dropped for sending a message the receiver cannot handle"
    );

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

pub fn set_client_connections(count: usize) {
    gauge!(names::CLIENT_CONNECTIONS).set(count as f64);
}

pub fn set_monitored_connections(count: usize) {
    gauge!(names::MONITORED_CONNECTIONS).set(count as f64);
}

/// Record a liveness teardown.
pub fn record_teardown(outcome: Teardown) {
    let outcome = match outcome {
        Teardown::Disconnected => "disconnected",
        Teardown::AlreadyGone => "already_gone",
    };
    counter!(names::TEARDOWNS_TOTAL, "outcome" => outcome).increment(1);
}

/// Record a hand-off event: `buffered`, `claimed` or `reaped`.
pub fn record_handoff(event: &'static str) {
    counter!(names::HANDOFFS_TOTAL, "event" => event).increment(1);
}

/// Record a channel change outcome.
pub fn record_transfer(outcome: &'static str) {
    counter!(names::TRANSFERS_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_migration_phase(phase: &'static str) {
    counter!(names::MIGRATION_PHASES_TOTAL, "phase" => phase).increment(1);
}

pub fn set_scheduler_queue(length: usize) {
    gauge!(names::SCHEDULER_QUEUE).set(length as f64);
}

pub fn record_dispatch_delay(delay: Duration) {
    histogram!(names::DISPATCH_SECONDS).record(delay.as_secs_f64());
}

/// Publish the running total of presence failures.
pub fn set_presence_failures(total: u64) {
    counter!(names::PRESENCE_FAILURES).absolute(total);
}

pub fn set_registered_channels(count: usize) {
    gauge!(names::REGISTERED_CHANNELS).set(count as f64);
}

pub fn record_protocol_violation(kind: &'static str) {
    counter!(names::PROTOCOL_VIOLATIONS_TOTAL, "kind" => kind).increment(1);
}
