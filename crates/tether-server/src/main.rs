//! # Tether
//!
//! Cluster core of a sharded game backend. One binary runs either role:
//! a channel process hosting players, or the center process coordinating
//! the channels of a world.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (channel role)
//! tether
//!
//! # Run with a custom config
//! TETHER_CONFIG=/path/to/tether.toml tether
//!
//! # Run center with environment overrides
//! TETHER_ROLE=center TETHER_PORT=8383 tether
//! ```

mod alert;
mod center;
mod channel;
mod config;
mod hooks;
mod http;
mod metrics;
mod net;
mod services;

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tether_core::{LivenessMonitor, PresenceStore, Scheduler, Tick};
use tether_transport::TcpAcceptor;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::alert::LogAlertSink;
use crate::center::{CenterSettings, CenterState};
use crate::channel::io::TokioChannelIo;
use crate::channel::{ChannelSettings, ChannelState};
use crate::config::{Config, Role};
use crate::hooks::NullGame;
use crate::services::Services;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load()?;
    config.validate()?;

    info!(role = ?config.role, "Starting tether on {}:{}", config.host, config.port);

    if config.metrics.enabled {
        metrics::init_metrics();
        metrics::start_metrics_server(config.metrics.port)?;
    }

    let url = config.presence.url.clone();
    let mode = config.boot_mode();
    let timeout = Duration::from_millis(config.presence.timeout_ms);
    let presence = tokio::task::spawn_blocking(move || {
        PresenceStore::connect(url.as_deref(), mode, timeout)
    })
    .await?
    .context("Presence store is required in production mode")?
    .with_online_ttl(config.liveness().online_lease_ttl());

    let name = match config.role {
        Role::Channel => config.channel.name.clone(),
        Role::Center => config.center.world_name.clone(),
    };
    let services = Services {
        presence: Arc::new(presence),
        liveness: Arc::new(LivenessMonitor::new(config.liveness())),
        alerts: Arc::new(LogAlertSink),
        status: http::shared_status(config.role.as_str(), &name),
    };

    if config.status.enabled {
        let port = config.status.port;
        let status = services.status.clone();
        tokio::spawn(async move {
            if let Err(e) = http::serve(port, status).await {
                error!("Status endpoint failed: {}", e);
            }
        });
    }

    match config.role {
        Role::Channel => run_channel(&config, services).await,
        Role::Center => run_center(&config, services).await,
    }
}

async fn run_channel(config: &Config, services: Services) -> Result<()> {
    let settings = ChannelSettings::from_config(config)?;
    let bind_addr = config.bind_addr()?;

    let (scheduler, handle) = Scheduler::new();
    let (exit_tx, mut exit_rx) = oneshot::channel();
    let io = TokioChannelIo::new(Handle::current(), handle.clone(), bind_addr, exit_tx);
    let state = ChannelState::new(
        settings,
        handle.clone(),
        Box::new(io),
        Box::new(NullGame::new()),
        services,
    );

    handle.add_callback("boot", |state: &mut ChannelState, tick: &Tick| state.boot(tick));
    let thread = scheduler
        .spawn("channel-scheduler", state)
        .context("Failed to start scheduler thread")?;

    let code = tokio::select! {
        code = &mut exit_rx => code.unwrap_or(1),
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, draining players");
            handle.add_callback("interrupt", |state: &mut ChannelState, _: &Tick| {
                state.begin_shutdown();
            });
            exit_rx.await.unwrap_or(1)
        }
    };

    handle.stop();
    let state = tokio::task::spawn_blocking(move || thread.join())
        .await?
        .map_err(|_| anyhow!("Channel scheduler panicked"))?;
    info!(channel_id = ?state.channel_id(), code, "Channel stopped");

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn run_center(config: &Config, services: Services) -> Result<()> {
    let settings = CenterSettings::from_config(config);
    let acceptor = TcpAcceptor::bind(config.bind_addr()?)
        .await
        .context("Failed to bind control port")?;

    let (scheduler, handle) = Scheduler::new();
    let state = CenterState::new(settings, handle.clone(), services);
    handle.add_callback("boot", |state: &mut CenterState, tick: &Tick| state.boot(tick));
    let thread = scheduler
        .spawn("center-scheduler", state)
        .context("Failed to start scheduler thread")?;

    let listener = tokio::spawn(net::accept_loop(
        acceptor,
        handle.clone(),
        CenterState::on_peer_connected,
        CenterState::on_peer_event,
    ));

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, stopping center");
    listener.abort();
    handle.stop();
    tokio::task::spawn_blocking(move || thread.join())
        .await?
        .map_err(|_| anyhow!("Center scheduler panicked"))?;
    Ok(())
}
