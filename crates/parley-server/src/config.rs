//! Server configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file (`parley.toml`)
//! - Environment variables (`PARLEY_*`, nested keys joined with `__`)

use anyhow::{Context, Result};
use ::config::{Environment, File, FileFormat};
use parley_core::HubSettings;
use parley_transport::{SyncSettings, VirtualParticipant, MIN_POLL_INTERVAL};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory for the local store and backend record.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Path for the session WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Largest accepted inbound frame in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub presence: PresenceConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Backend synchronization timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_overlap_window")]
    pub overlap_window_ms: u64,

    #[serde(default = "default_subscribe_timeout")]
    pub subscribe_timeout_ms: u64,

    /// Seen-id count above which old ids are pruned.
    #[serde(default = "default_seen_capacity")]
    pub seen_capacity: usize,

    /// Activity window for inferred presence.
    #[serde(default = "default_presence_window")]
    pub presence_window_secs: u64,

    #[serde(default = "default_history_retention")]
    pub history_retention_days: u64,

    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

/// A participant always listed as online.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualUser {
    pub username: String,
    #[serde(default)]
    pub team: String,
}

/// Presence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    #[serde(default = "default_virtual_participants")]
    pub virtual_participants: Vec<VirtualUser>,
    /// Sessions silent this long drop out of local presence. 0 disables.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

/// Local store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
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

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_data_dir() -> String {
    "~/.parley".to_string()
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_message_size() -> usize {
    1024 * 1024 // 1 MB, shared items can be large
}

fn default_poll_interval() -> u64 {
    3_000
}

fn default_overlap_window() -> u64 {
    30_000
}

fn default_subscribe_timeout() -> u64 {
    10_000
}

fn default_seen_capacity() -> usize {
    1000
}

fn default_idle_timeout() -> u64 {
    600
}

fn default_presence_window() -> u64 {
    10 * 60
}

fn default_history_retention() -> u64 {
    7
}

fn default_history_limit() -> usize {
    1000
}

fn default_virtual_participants() -> Vec<VirtualUser> {
    vec![VirtualUser {
        username: "Assistant".to_string(),
        team: "Assistant".to_string(),
    }]
}

fn default_max_messages() -> usize {
    5000
}

fn default_true() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: default_data_dir(),
            websocket_path: default_ws_path(),
            max_message_size: default_max_message_size(),
            sync: SyncConfig::default(),
            presence: PresenceConfig::default(),
            store: StoreConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            overlap_window_ms: default_overlap_window(),
            subscribe_timeout_ms: default_subscribe_timeout(),
            seen_capacity: default_seen_capacity(),
            presence_window_secs: default_presence_window(),
            history_retention_days: default_history_retention(),
            history_limit: default_history_limit(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            virtual_participants: default_virtual_participants(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
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

impl Config {
    /// Load configuration from the first config file found, with
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "parley.toml",
            "/etc/parley/parley.toml",
            "~/.config/parley/parley.toml",
        ];

        let file = config_paths
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists());

        let mut builder = ::config::Config::builder();
        if let Some(path) = &file {
            builder = builder.add_source(File::from(path.as_path()).format(FileFormat::Toml));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix("PARLEY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to parse configuration")?;
        if let Some(path) = file {
            tracing::debug!(path = %path.display(), "Loaded config file");
        }
        Ok(config)
    }

    /// Parse configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid configuration.
    pub fn from_toml(text: &str) -> Result<Self> {
        ::config::Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()?
            .try_deserialize()
            .context("Failed to parse configuration")
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

    /// Data directory with `~` expanded.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        Path::new(shellexpand::tilde(&self.data_dir).as_ref()).to_path_buf()
    }

    /// Idle timeout for local presence, if enabled.
    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.presence.idle_timeout_secs > 0)
            .then(|| Duration::from_secs(self.presence.idle_timeout_secs))
    }

    /// Hub settings derived from this configuration.
    #[must_use]
    pub fn hub_settings(&self) -> HubSettings {
        let sync = &self.sync;
        HubSettings {
            sync: SyncSettings {
                poll_interval: Duration::from_millis(sync.poll_interval_ms).max(MIN_POLL_INTERVAL),
                overlap_window: Duration::from_millis(sync.overlap_window_ms),
                subscribe_timeout: Duration::from_millis(sync.subscribe_timeout_ms),
                seen_capacity: sync.seen_capacity,
                presence_window: Duration::from_secs(sync.presence_window_secs),
                history_retention: Duration::from_secs(sync.history_retention_days * 24 * 60 * 60),
                history_limit: sync.history_limit,
                virtual_participants: self
                    .presence
                    .virtual_participants
                    .iter()
                    .map(|v| VirtualParticipant::new(v.username.as_str(), v.team.as_str()))
                    .collect(),
                ..SyncSettings::default()
            },
            max_messages: self.store.max_messages,
        }
    }
}
