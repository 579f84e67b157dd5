//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (TETHER_*)
//! - TOML configuration file

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tether_core::handoff::{MAX_HANDOFF_AGE, REAP_INTERVAL};
use tether_core::liveness::{MAX_LOST_PINGS, PING_PERIOD};
use tether_core::{BootMode, LivenessConfig};
use tether_protocol::Rates;

/// Which process this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Channel,
    Center,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Channel => "channel",
            Role::Center => "center",
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Process role.
    #[serde(default = "default_role")]
    pub role: Role,

    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on: clients for a channel, channels for center.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Channel identity.
    #[serde(default)]
    pub channel: ChannelConfig,

    /// Center settings.
    #[serde(default)]
    pub center: CenterConfig,

    /// Shared TTL store.
    #[serde(default)]
    pub presence: PresenceConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Whole-process migration.
    #[serde(default)]
    pub migration: MigrationConfig,

    /// Inbound player buffering.
    #[serde(default)]
    pub handoff: HandoffConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Status endpoint.
    #[serde(default)]
    pub status: StatusConfig,
}

/// Identity of a channel process and how it reaches center.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Server name center knows this process by.
    #[serde(default = "default_channel_name")]
    pub name: String,

    /// Address clients are told to connect to.
    #[serde(default = "default_public_ip")]
    pub public_ip: Ipv4Addr,

    #[serde(default)]
    pub world_id: u8,

    #[serde(default = "default_world_name")]
    pub world_name: String,

    #[serde(default = "default_center_host")]
    pub center_host: String,

    #[serde(default = "default_center_port")]
    pub center_port: u16,

    /// Shared secret presented at registration.
    #[serde(default)]
    pub auth_key: String,

    /// Registration attempts before giving up.
    #[serde(default = "default_register_attempts")]
    pub register_attempts: u32,

    /// Wait per registration attempt, in milliseconds.
    #[serde(default = "default_register_wait")]
    pub register_wait_ms: u64,
}

/// A channel slot center hands out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSlot {
    pub name: String,
    pub id: u8,
}

/// Center settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CenterConfig {
    #[serde(default)]
    pub world_id: u8,

    #[serde(default = "default_world_name")]
    pub world_name: String,

    #[serde(default)]
    pub auth_key: String,

    /// Known channel servers.
    #[serde(default)]
    pub channels: Vec<ChannelSlot>,

    /// Initial world rates.
    #[serde(default)]
    pub rates: Rates,

    /// Online count lease refresh, in milliseconds.
    #[serde(default = "default_online_count_interval")]
    pub online_count_interval_ms: u64,
}

/// Shared store connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Redis URL. Missing means no store.
    #[serde(default)]
    pub url: Option<String>,

    /// Boot policy when the store is missing or unreachable.
    #[serde(default = "default_presence_mode")]
    pub mode: PresenceMode,

    /// Per-command timeout in milliseconds.
    #[serde(default = "default_presence_timeout")]
    pub timeout_ms: u64,
}

/// Boot policy of the shared store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceMode {
    Production,
    Development,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Unanswered pings before a connection is torn down.
    #[serde(default = "default_max_lost_pings")]
    pub max_lost_pings: u32,
}

/// Whole-process migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Overall timeout of a phase, in milliseconds.
    #[serde(default = "default_migration_timeout")]
    pub timeout_ms: u64,

    /// Evacuation poll interval, in milliseconds.
    #[serde(default = "default_migration_sweep")]
    pub sweep_interval_ms: u64,
}

/// Inbound player buffering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffConfig {
    /// Reap sweep interval, in milliseconds.
    #[serde(default = "default_handoff_sweep")]
    pub sweep_interval_ms: u64,

    /// Age after which an unclaimed hand-off is dropped, in milliseconds.
    #[serde(default = "default_handoff_max_age")]
    pub max_age_ms: u64,

    /// Delay before a client told to reconnect elsewhere is dropped, in
    /// milliseconds.
    #[serde(default = "default_redirect_grace")]
    pub redirect_grace_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_status_port")]
    pub port: u16,
}

// Default value functions
fn default_role() -> Role {
    match std::env::var("TETHER_ROLE").as_deref() {
        Ok("center") => Role::Center,
        _ => Role::Channel,
    }
}

fn default_host() -> String {
    std::env::var("TETHER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("TETHER_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8585)
}

fn default_true() -> bool {
    true
}

fn default_channel_name() -> String {
    "Game0".to_string()
}

fn default_public_ip() -> Ipv4Addr {
    Ipv4Addr::LOCALHOST
}

fn default_world_name() -> String {
    "Tether".to_string()
}

fn default_center_host() -> String {
    std::env::var("TETHER_CENTER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_center_port() -> u16 {
    8383
}

fn default_register_attempts() -> u32 {
    8
}

fn default_register_wait() -> u64 {
    1_000
}

fn default_online_count_interval() -> u64 {
    30_000
}

fn default_presence_mode() -> PresenceMode {
    PresenceMode::Production
}

fn default_presence_timeout() -> u64 {
    500
}

fn default_heartbeat_interval() -> u64 {
    millis(PING_PERIOD)
}

fn default_max_lost_pings() -> u32 {
    MAX_LOST_PINGS
}

fn default_migration_timeout() -> u64 {
    15_000
}

fn default_migration_sweep() -> u64 {
    5_000
}

fn default_handoff_sweep() -> u64 {
    millis(REAP_INTERVAL)
}

fn default_handoff_max_age() -> u64 {
    millis(MAX_HANDOFF_AGE)
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn default_redirect_grace() -> u64 {
    5_000
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_status_port() -> u16 {
    8080
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: default_role(),
            host: default_host(),
            port: default_port(),
            channel: ChannelConfig::default(),
            center: CenterConfig::default(),
            presence: PresenceConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            migration: MigrationConfig::default(),
            handoff: HandoffConfig::default(),
            metrics: MetricsConfig::default(),
            status: StatusConfig::default(),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: default_channel_name(),
            public_ip: default_public_ip(),
            world_id: 0,
            world_name: default_world_name(),
            center_host: default_center_host(),
            center_port: default_center_port(),
            auth_key: String::new(),
            register_attempts: default_register_attempts(),
            register_wait_ms: default_register_wait(),
        }
    }
}

impl Default for CenterConfig {
    fn default() -> Self {
        Self {
            world_id: 0,
            world_name: default_world_name(),
            auth_key: String::new(),
            channels: Vec::new(),
            rates: Rates::default(),
            online_count_interval_ms: default_online_count_interval(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("TETHER_REDIS_URL").ok(),
            mode: default_presence_mode(),
            timeout_ms: default_presence_timeout(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            max_lost_pings: default_max_lost_pings(),
        }
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_migration_timeout(),
            sweep_interval_ms: default_migration_sweep(),
        }
    }
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: default_handoff_sweep(),
            max_age_ms: default_handoff_max_age(),
            redirect_grace_ms: default_redirect_grace(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_status_port(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("TETHER_CONFIG") {
            return Self::from_file(shellexpand::tilde(&path).as_ref());
        }

        let config_paths = [
            "tether.toml",
            "/etc/tether/tether.toml",
            "~/.config/tether/tether.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form an address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Address of center as seen from a channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured center address is invalid.
    pub fn center_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.channel.center_host, self.channel.center_port)
            .parse()
            .with_context(|| {
                format!(
                    "Invalid center address {}:{}",
                    self.channel.center_host, self.channel.center_port
                )
            })
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat.interval_ms == 0 || self.heartbeat.max_lost_pings == 0 {
            bail!("heartbeat interval and max_lost_pings must be positive");
        }
        if self.role == Role::Center {
            let mut ids: Vec<u8> = self.center.channels.iter().map(|slot| slot.id).collect();
            ids.sort_unstable();
            ids.dedup();
            if ids.len() != self.center.channels.len() {
                bail!("channel ids must be unique");
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn boot_mode(&self) -> BootMode {
        match self.presence.mode {
            PresenceMode::Production => BootMode::Production,
            PresenceMode::Development => BootMode::Development,
        }
    }

    #[must_use]
    pub fn liveness(&self) -> LivenessConfig {
        LivenessConfig {
            period: Duration::from_millis(self.heartbeat.interval_ms),
            max_lost_pings: self.heartbeat.max_lost_pings,
        }
    }
}
