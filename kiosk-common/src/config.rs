//! Bootstrap configuration and directory resolution
//!
//! Resolution order for every directory or value:
//! 1. Command-line argument (highest priority, clap handles env fallbacks)
//! 2. `agent.toml` in the config directory
//! 3. OS-dependent compiled default
//!
//! A missing `agent.toml` is not an error: the agent logs a warning and runs
//! with built-in defaults. A malformed file is a configuration error.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{info, warn};

use crate::{Error, Result};

/// Name of the bootstrap file inside the config directory
pub const CONFIG_FILE_NAME: &str = "agent.toml";

/// Bootstrap configuration loaded from `agent.toml`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlConfig {
    /// Fixed device identifier (otherwise generated and persisted)
    #[serde(default)]
    pub device_id: Option<String>,

    /// Media directory override
    #[serde(default)]
    pub media_dir: Option<PathBuf>,

    #[serde(default)]
    pub authority: AuthorityConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub connectivity: ConnectivityConfig,

    #[serde(default)]
    pub alerts: AlertConfig,

    #[serde(default)]
    pub matching: MatchingConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How the manifest is fetched from the authority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestTransport {
    /// One endpoint returns the whole manifest
    #[default]
    Combined,
    /// Playlist and triggers come from two endpoints and are merged
    Split,
}

/// Remote authority service
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorityConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub manifest_transport: ManifestTransport,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            manifest_transport: ManifestTransport::default(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Sync intervals and download retry policy
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_content_interval_secs")]
    pub content_interval_secs: u64,

    #[serde(default = "default_safety_interval_secs")]
    pub safety_interval_secs: u64,

    #[serde(default = "default_loyalty_interval_secs")]
    pub loyalty_interval_secs: u64,

    #[serde(default = "default_max_download_attempts")]
    pub max_download_attempts: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Cap on cumulative backoff sleep for one call
    #[serde(default = "default_backoff_total_cap_ms")]
    pub backoff_total_cap_ms: u64,

    /// Pairing status poll while waiting to be claimed
    #[serde(default = "default_pairing_poll_secs")]
    pub pairing_poll_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            content_interval_secs: default_content_interval_secs(),
            safety_interval_secs: default_safety_interval_secs(),
            loyalty_interval_secs: default_loyalty_interval_secs(),
            max_download_attempts: default_max_download_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_total_cap_ms: default_backoff_total_cap_ms(),
            pairing_poll_secs: default_pairing_poll_secs(),
        }
    }
}

/// Connectivity checks
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectivityConfig {
    /// Check target; defaults to the authority base URL
    #[serde(default)]
    pub target: Option<String>,

    #[serde(default = "default_online_interval_secs")]
    pub online_interval_secs: u64,

    #[serde(default = "default_offline_interval_secs")]
    pub offline_interval_secs: u64,

    #[serde(default = "default_check_timeout_secs")]
    pub check_timeout_secs: u64,

    #[serde(default = "default_health_paths")]
    pub health_paths: Vec<String>,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            target: None,
            online_interval_secs: default_online_interval_secs(),
            offline_interval_secs: default_offline_interval_secs(),
            check_timeout_secs: default_check_timeout_secs(),
            health_paths: default_health_paths(),
        }
    }
}

/// Safety alert queue
#[derive(Debug, Clone, Deserialize)]
pub struct AlertConfig {
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,

    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// Opt-in directory for encrypted snapshots; snapshots are dropped when unset
    #[serde(default)]
    pub snapshot_dir: Option<PathBuf>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            max_pending: default_max_pending(),
            flush_interval_secs: default_flush_interval_secs(),
            snapshot_dir: None,
        }
    }
}

/// Similarity search thresholds
#[derive(Debug, Clone, Deserialize)]
pub struct MatchingConfig {
    #[serde(default = "default_safety_threshold")]
    pub safety_threshold: f32,

    #[serde(default = "default_loyalty_threshold")]
    pub loyalty_threshold: f32,

    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            safety_threshold: default_safety_threshold(),
            loyalty_threshold: default_loyalty_threshold(),
            max_results: default_max_results(),
        }
    }
}

/// Local status server
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_content_interval_secs() -> u64 {
    300
}
fn default_safety_interval_secs() -> u64 {
    6 * 3600
}
fn default_loyalty_interval_secs() -> u64 {
    4 * 3600
}
fn default_max_download_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_backoff_max_ms() -> u64 {
    16_000
}
fn default_backoff_total_cap_ms() -> u64 {
    60_000
}
fn default_pairing_poll_secs() -> u64 {
    10
}
fn default_online_interval_secs() -> u64 {
    30
}
fn default_offline_interval_secs() -> u64 {
    10
}
fn default_check_timeout_secs() -> u64 {
    5
}
fn default_health_paths() -> Vec<String> {
    vec!["/health".to_string(), "/api/health".to_string(), "/".to_string()]
}
fn default_max_pending() -> usize {
    1000
}
fn default_flush_interval_secs() -> u64 {
    60
}
fn default_safety_threshold() -> f32 {
    0.85
}
fn default_loyalty_threshold() -> f32 {
    0.80
}
fn default_max_results() -> usize {
    5
}
fn default_port() -> u16 {
    5780
}
fn default_log_level() -> String {
    "info".to_string()
}

impl TomlConfig {
    /// Load `agent.toml` from `config_dir`
    ///
    /// Missing file → warning + defaults. Unreadable or malformed file → error.
    pub fn load(config_dir: &Path) -> Result<Self> {
        let path = config_dir.join(CONFIG_FILE_NAME);
        if !path.exists() {
            warn!(
                path = %path.display(),
                "Config file not found, using built-in defaults"
            );
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        let config = Self::from_toml_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Parse and validate configuration text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.sync.max_download_attempts == 0 {
            return Err(Error::Config(
                "sync.max_download_attempts must be at least 1".to_string(),
            ));
        }
        if self.connectivity.check_timeout_secs == 0 {
            return Err(Error::Config(
                "connectivity.check_timeout_secs must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("matching.safety_threshold", self.matching.safety_threshold),
            ("matching.loyalty_threshold", self.matching.loyalty_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!("{} must be within 0.0..=1.0", name)));
            }
        }
        Ok(())
    }

    /// Check target, falling back to the authority base URL
    pub fn connectivity_target(&self) -> &str {
        self.connectivity
            .target
            .as_deref()
            .unwrap_or(&self.authority.base_url)
    }
}

/// Resolve a directory: CLI argument, then config value, then OS default
pub fn resolve_dir(cli_arg: Option<&Path>, config_value: Option<&Path>, leaf: &str) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }
    if let Some(path) = config_value {
        return path.to_path_buf();
    }
    default_data_root().join(leaf)
}

/// OS-dependent default data root
pub fn default_data_root() -> PathBuf {
    if cfg!(target_os = "linux") {
        dirs::data_local_dir()
            .map(|d| d.join("kiosk-agent"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/kiosk-agent"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("kiosk-agent"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/kiosk-agent"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("kiosk-agent"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\kiosk-agent"))
    } else {
        PathBuf::from("./kiosk_data")
    }
}
