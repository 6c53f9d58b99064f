//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/shelfsync/config.toml)
//! 3. Environment variables (SHELFSYNC_* prefix)
//!
//! Environment variables take precedence over config file values.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Environment variable prefix
const ENV_PREFIX: &str = "SHELFSYNC";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for data storage (SQLite db, device id)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Base URL of the reading API (optional)
    #[serde(default)]
    pub api_url: Option<String>,

    /// Whether sync is enabled
    #[serde(default)]
    pub sync_enabled: bool,

    /// Log file for long-running commands
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Sync engine tuning
    #[serde(default)]
    pub sync: SyncTuning,
}

/// Timing and sizing knobs for the sync engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncTuning {
    /// Liveness probe interval while online
    pub probe_interval_secs: u64,
    /// Upper bound for the probe interval while offline
    pub max_probe_interval_secs: u64,
    /// Consecutive probe failures before declaring offline
    pub offline_failure_threshold: u32,
    /// First retry delay for a failed mutation
    pub retry_base_ms: u64,
    /// Retry delay cap
    pub retry_max_ms: u64,
    /// Attempts before a mutation is parked
    pub max_attempts: u32,
    /// Relative jitter applied to retry delays (0.0 - 1.0)
    pub retry_jitter: f64,
    /// Interval of the safety drain that catches stuck state
    pub safety_sync_secs: u64,
    /// Mutations taken per entity family per drain round
    pub batch_size: usize,
    /// Clock skew tolerance when ordering timestamps
    pub ambiguity_window_ms: u64,
    /// Per-request timeout handed to the transport
    pub request_timeout_secs: u64,
}

impl Default for SyncTuning {
    fn default() -> Self {
        Self {
            probe_interval_secs: 5,
            max_probe_interval_secs: 60,
            offline_failure_threshold: 3,
            retry_base_ms: 1_000,
            retry_max_ms: 5 * 60 * 1_000,
            max_attempts: 8,
            retry_jitter: 0.2,
            safety_sync_secs: 120,
            batch_size: 25,
            ambiguity_window_ms: 2_000,
            request_timeout_secs: 15,
        }
    }
}

impl SyncTuning {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }

    pub fn max_probe_interval(&self) -> Duration {
        Duration::from_secs(self.max_probe_interval_secs.max(self.probe_interval_secs).max(1))
    }

    pub fn safety_sync_interval(&self) -> Duration {
        Duration::from_secs(self.safety_sync_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            api_url: None,
            sync_enabled: false,
            log_file: None,
            sync: SyncTuning::default(),
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (SHELFSYNC_DATA_DIR, SHELFSYNC_API_URL, SHELFSYNC_SYNC_ENABLED)
    /// 2. Config file (~/.config/shelfsync/config.toml or SHELFSYNC_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration, preferring an explicit path over the default one
    pub fn load_with_cli_override(path: Option<&PathBuf>) -> Result<Self> {
        match path {
            Some(p) => Self::load_from_path(p),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        // Empty string clears the URL
        if let Ok(val) = std::env::var(format!("{}_API_URL", ENV_PREFIX)) {
            self.api_url = if val.is_empty() { None } else { Some(val) };
        }

        if let Ok(val) = std::env::var(format!("{}_SYNC_ENABLED", ENV_PREFIX)) {
            self.sync_enabled = val.eq_ignore_ascii_case("true") || val == "1";
        }

        if let Ok(val) = std::env::var(format!("{}_LOG_FILE", ENV_PREFIX)) {
            self.log_file = if val.is_empty() {
                None
            } else {
                Some(PathBuf::from(val))
            };
        }
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to a file
    pub fn save_to(&self, config_path: &PathBuf) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with SHELFSYNC_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("shelfsync")
            .join("config.toml")
    }

    /// Get the path to the SQLite database holding queue and store journals
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("shelfsync.db")
    }

    /// Get the path to the device identity file
    pub fn device_id_path(&self) -> PathBuf {
        self.data_dir.join("device_id")
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("shelfsync")
}
