//! Application configuration.
//!
//! Configuration is read from a TOML file and then overlaid with
//! `REPLICA_SYNC_*` environment variables. Every field has a default, so an
//! empty or missing file yields a working configuration.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable pointing at an explicit config file.
pub const CONFIG_PATH_ENV: &str = "REPLICA_SYNC_CONFIG";

/// Upper bound for concurrent last-message probes
pub const MAX_ACTIVITY_PROBE_BATCH: usize = 5;

const MAX_FULL_SYNC_AGE_DAYS: i64 = 3650;
const MAX_STALE_SYNCING_MINUTES: i64 = 7 * 24 * 60;
const MAX_ACTIVITY_WINDOW_HOURS: i64 = 30 * 24;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub sync: SyncConfig,
    pub logging: LoggingConfig,
}

/// Replica database settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the DuckDB file holding the replica
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let path = ProjectDirs::from("dev", "replica-sync", "replica-sync")
            .map(|dirs| dirs.data_dir().join("replica.duckdb"))
            .unwrap_or_else(|| PathBuf::from("replica.duckdb"));
        Self { path }
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "replica_sync=info,replica_sync_engine=info".to_string(),
        }
    }
}

/// Tuning knobs for the synchronization engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Seconds between scheduled sync passes
    pub interval_secs: u64,
    /// Seconds between drift checks
    pub drift_interval_secs: u64,
    /// Days after which a full resync is forced
    pub full_sync_max_age_days: i64,
    /// Minutes after which a `syncing` status is considered wedged
    pub stale_syncing_minutes: i64,
    /// Relative replica/live count difference that flags `needs_healing`
    pub drift_threshold: f64,
    /// A channel is active if its newest message is younger than this
    pub activity_window_hours: i64,
    /// Concurrent last-message probes for channels without a cached signal
    pub activity_probe_batch: usize,
    /// Messages fetched per channel by the healer and per backfill page
    pub message_window: usize,
    /// Concurrent message lookups within one channel
    pub message_sub_batch: usize,
    /// Lower bound for the number of channels healed concurrently
    pub channel_batch_min: usize,
    /// Upper bound for the number of channels healed concurrently
    pub channel_batch_max: usize,
    /// Pages fetched per channel during full-sync backfill
    pub backfill_max_pages: usize,
    /// Members processed concurrently during full sync
    pub member_chunk_size: usize,
    /// Rows per bulk upsert
    pub bulk_batch_size: usize,
    /// Pause between pages of the same channel
    pub page_delay_ms: u64,
    /// Pause between consecutive batches
    pub batch_delay_ms: u64,
    /// Grace period awaited by shutdown after raising the flag
    pub shutdown_grace_ms: u64,
    /// Maximum profile history entries kept per member
    pub profile_history_limit: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 900,
            drift_interval_secs: 3600,
            full_sync_max_age_days: 7,
            stale_syncing_minutes: 30,
            drift_threshold: 0.10,
            activity_window_hours: 24,
            activity_probe_batch: 5,
            message_window: 100,
            message_sub_batch: 10,
            channel_batch_min: 2,
            channel_batch_max: 5,
            backfill_max_pages: 10,
            member_chunk_size: 20,
            bulk_batch_size: 100,
            page_delay_ms: 250,
            batch_delay_ms: 100,
            shutdown_grace_ms: 50,
            profile_history_limit: 100,
        }
    }
}

impl AppConfig {
    /// Load configuration from `$REPLICA_SYNC_CONFIG` or the platform config
    /// directory, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = match Self::config_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            Some(path) => {
                debug!("No config file at {}, using defaults", path.display());
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the config file location
    pub fn config_path() -> Option<PathBuf> {
        if let Ok(path) = env::var(CONFIG_PATH_ENV) {
            return Some(PathBuf::from(path));
        }
        ProjectDirs::from("dev", "replica-sync", "replica-sync")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Parse a config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Parse config from a TOML string
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).context("Invalid TOML configuration")?;
        Ok(config)
    }

    /// Overlay `REPLICA_SYNC_*` environment variables
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(path) = env::var("REPLICA_SYNC_DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(secs) = env_parse::<u64>("REPLICA_SYNC_INTERVAL_SECS")? {
            self.sync.interval_secs = secs;
        }
        if let Some(secs) = env_parse::<u64>("REPLICA_SYNC_DRIFT_INTERVAL_SECS")? {
            self.sync.drift_interval_secs = secs;
        }
        if let Some(days) = env_parse::<i64>("REPLICA_SYNC_FULL_SYNC_MAX_AGE_DAYS")? {
            self.sync.full_sync_max_age_days = days;
        }
        if let Ok(filter) = env::var("REPLICA_SYNC_LOG") {
            self.logging.filter = filter;
        }
        Ok(())
    }

    /// Reject values the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        let sync = &self.sync;
        if sync.channel_batch_min == 0 || sync.channel_batch_min > sync.channel_batch_max {
            anyhow::bail!(
                "channel_batch_min ({}) must be between 1 and channel_batch_max ({})",
                sync.channel_batch_min,
                sync.channel_batch_max
            );
        }
        if !(1..=MAX_ACTIVITY_PROBE_BATCH).contains(&sync.activity_probe_batch) {
            anyhow::bail!(
                "activity_probe_batch must be within 1..={}, got {}",
                MAX_ACTIVITY_PROBE_BATCH,
                sync.activity_probe_batch
            );
        }
        if sync.message_sub_batch == 0
            || sync.member_chunk_size == 0
            || sync.bulk_batch_size == 0
        {
            anyhow::bail!("batch sizes must be greater than zero");
        }
        if !(0.0..=1.0).contains(&sync.drift_threshold) {
            anyhow::bail!(
                "drift_threshold must be within 0.0..=1.0, got {}",
                sync.drift_threshold
            );
        }
        if sync.interval_secs == 0 || sync.drift_interval_secs == 0 {
            anyhow::bail!("intervals must be greater than zero");
        }
        for (name, value, max) in [
            ("full_sync_max_age_days", sync.full_sync_max_age_days, MAX_FULL_SYNC_AGE_DAYS),
            ("stale_syncing_minutes", sync.stale_syncing_minutes, MAX_STALE_SYNCING_MINUTES),
            ("activity_window_hours", sync.activity_window_hours, MAX_ACTIVITY_WINDOW_HOURS),
        ] {
            if !(1..=max).contains(&value) {
                anyhow::bail!("{} must be within 1..={}, got {}", name, max, value);
            }
        }
        Ok(())
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
        Err(_) => Ok(None),
    }
}
