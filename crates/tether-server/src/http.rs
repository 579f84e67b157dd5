//! HTTP status endpoint.
//!
//! `/health` answers as long as the process runs. `/status` returns the
//! snapshot the scheduler publishes once per second.

use anyhow::{Context, Result};
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio::net::TcpListener;
use tracing::info;

use crate::channel::migration::MigrationPhase;

/// Process state as seen from outside.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    pub role: String,
    pub name: String,
    pub channel_id: Option<u8>,
    pub migration_phase: Option<MigrationPhase>,
    pub connections: usize,
    pub players: usize,
    pub pending_handoffs: usize,
    pub registered_channels: usize,
    pub scheduler_backlog: usize,
    pub presence_running_normally: bool,
    pub shutting_down: bool,
}

/// Snapshot written by the scheduler thread and read by the handlers.
pub type SharedStatus = Arc<RwLock<StatusSnapshot>>;

#[must_use]
pub fn shared_status(role: &str, name: &str) -> SharedStatus {
    Arc::new(RwLock::new(StatusSnapshot {
        role: role.to_string(),
        name: name.to_string(),
        ..StatusSnapshot::default()
    }))
}

/// Apply `update` to the shared snapshot.
pub fn publish(status: &SharedStatus, update: impl FnOnce(&mut StatusSnapshot)) {
    let mut snapshot = match status.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    update(&mut snapshot);
}

pub fn router(status: SharedStatus) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .with_state(status)
}

/// Serve the status endpoint until the process exits.
///
/// # Errors
///
/// Returns an error if the port cannot be bound or the server fails.
pub async fn serve(port: u16, status: SharedStatus) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind status endpoint on {addr}"))?;

    info!("Status endpoint listening on {}", addr);
    axum::serve(listener, router(status)).await?;
    Ok(())
}

/// Health check handler.
async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn status_handler(State(status): State<SharedStatus>) -> Json<StatusSnapshot> {
    let snapshot = match status.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    Json(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_handler() {
        let Json(body) = health_handler().await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_status_handler_returns_latest_snapshot() {
        let status = shared_status("channel", "Game1");
        publish(&status, |snapshot| {
            snapshot.channel_id = Some(1);
            snapshot.migration_phase = Some(MigrationPhase::Evacuating);
            snapshot.connections = 12;
        });

        let Json(snapshot) = status_handler(State(Arc::clone(&status))).await;
        assert_eq!(snapshot.name, "Game1");
        assert_eq!(snapshot.channel_id, Some(1));
        assert_eq!(snapshot.connections, 12);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["migration_phase"], "evacuating");
    }
}
