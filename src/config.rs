use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from healthcheck.toml.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct HealthConfig {
    pub monitor: MonitorConfig,
    pub watcher: WatcherConfig,
    pub disk: DiskConfig,
    pub pm2: Pm2Config,
    pub chain: ChainConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_secs: u64,
    pub stale_timeout_mins: u64,
    /// Process names to monitor. Empty means everything pm2 reports.
    pub processes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    pub limit_percent: u8,
    pub min_partition_gb: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Pm2Config {
    pub command: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub default_network: String,
    pub block_threshold: u64,
    pub connect_attempts: u32,
    pub connect_initial_delay_secs: u64,
    pub request_timeout_secs: u64,
    /// Fixed SS58 hotkey to look up instead of reading wallet files.
    pub hotkey_address: Option<String>,
}

// --- Default implementations ---

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 150,
            stale_timeout_mins: 15,
            processes: Vec::new(),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
        }
    }
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            limit_percent: 90,
            min_partition_gb: 30.0,
        }
    }
}

impl Default for Pm2Config {
    fn default() -> Self {
        Self {
            command: "pm2".to_string(),
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            default_network: "finney".to_string(),
            block_threshold: 500,
            connect_attempts: 3,
            connect_initial_delay_secs: 1,
            request_timeout_secs: 30,
            hotkey_address: None,
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_mins.saturating_mul(60))
    }
}

impl WatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl ChainConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config {}: {reason}", path.display())]
    Invalid { path: PathBuf, reason: String },
}

impl HealthConfig {
    /// Load configuration from a TOML file.
    ///
    /// A missing file yields defaults. A file that exists but cannot be read
    /// or parsed is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        let config: Self = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate().map_err(|reason| ConfigError::Invalid {
            path: path.to_path_buf(),
            reason,
        })?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.monitor.interval_secs == 0 {
            return Err("monitor.interval_secs must be at least 1".to_string());
        }
        Ok(())
    }
}
