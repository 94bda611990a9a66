use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::services::capture::PoolSettings;
use crate::services::sync::SyncSettings;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000").
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Verbose logging and a visible browser window.
    #[serde(default)]
    pub debug: bool,

    /// Token refill rate per client, in requests per second.
    #[serde(default = "default_rate")]
    pub rate: f64,

    /// Token bucket capacity per client.
    #[serde(default = "default_bursts")]
    pub bursts: u32,

    /// How long job records are kept, in seconds.
    #[serde(default = "default_image_retention_secs")]
    pub image_retention_secs: u64,

    /// SQLite database file for job records.
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    /// Append logs to this file instead of stdout.
    #[serde(default)]
    pub log_path: Option<PathBuf>,

    /// Chrome/Chromium executable.
    #[serde(default = "default_chrome_bin")]
    pub chrome_bin: PathBuf,

    /// Parent directory for per-render browser profiles.
    #[serde(default = "default_chrome_data_dir")]
    pub chrome_data_dir: PathBuf,

    /// Number of concurrent renders.
    #[serde(default = "default_render_workers")]
    pub render_workers: usize,

    /// Accepted jobs waiting for a render worker before submissions are rejected.
    #[serde(default = "default_render_queue_capacity")]
    pub render_queue_capacity: usize,

    /// Per-render browser timeout, in seconds.
    #[serde(default = "default_render_timeout_secs")]
    pub render_timeout_secs: u64,

    /// Period of the eviction loop, in seconds.
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    /// Time allowed for draining in-flight renders on shutdown, in seconds.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_rate() -> f64 {
    1.0
}

fn default_bursts() -> u32 {
    10
}

fn default_image_retention_secs() -> u64 {
    3600
}

fn default_store_path() -> PathBuf {
    PathBuf::from("screenshots.db")
}

fn default_chrome_bin() -> PathBuf {
    PathBuf::from("chromium")
}

fn default_chrome_data_dir() -> PathBuf {
    std::env::temp_dir().join("url-capture")
}

fn default_render_workers() -> usize {
    4
}

fn default_render_queue_capacity() -> usize {
    64
}

fn default_render_timeout_secs() -> u64 {
    30
}

fn default_sync_interval_secs() -> u64 {
    60
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.rate.is_finite() && self.rate > 0.0) {
            return Err(ConfigError::Invalid("RATE must be a positive number".into()));
        }
        if self.render_workers == 0 {
            return Err(ConfigError::Invalid("RENDER_WORKERS must be at least 1".into()));
        }
        if self.render_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "RENDER_QUEUE_CAPACITY must be at least 1".into(),
            ));
        }
        if self.sync_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "SYNC_INTERVAL_SECS must be at least 1".into(),
            ));
        }
        if self.render_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "RENDER_TIMEOUT_SECS must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            workers: self.render_workers,
            queue_capacity: self.render_queue_capacity,
        }
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            interval: Duration::from_secs(self.sync_interval_secs),
            image_retention: Duration::from_secs(self.image_retention_secs),
        }
    }

    pub fn render_timeout(&self) -> Duration {
        Duration::from_secs(self.render_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Default `tracing` filter when `RUST_LOG` is unset.
    pub fn default_log_filter(&self) -> &'static str {
        if self.debug {
            "debug"
        } else {
            "info"
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
