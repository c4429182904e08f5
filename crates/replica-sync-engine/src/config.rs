//! Engine-side view of the sync configuration.

use chrono::Duration as ChronoDuration;
use replica_sync_config::{SyncConfig, MAX_ACTIVITY_PROBE_BATCH};
use std::time::Duration;
use tracing::warn;

/// Resolved engine settings
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub sync_interval: Duration,
    pub drift_interval: Duration,
    pub full_sync_max_age: ChronoDuration,
    pub stale_syncing_after: ChronoDuration,
    pub drift_threshold: f64,
    pub activity_window: ChronoDuration,
    pub activity_probe_batch: usize,
    pub message_window: usize,
    pub message_sub_batch: usize,
    pub channel_batch_min: usize,
    pub channel_batch_max: usize,
    pub backfill_max_pages: usize,
    pub member_chunk_size: usize,
    pub bulk_batch_size: usize,
    pub page_delay: Duration,
    pub batch_delay: Duration,
    pub shutdown_grace: Duration,
    pub profile_history_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for EngineConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            sync_interval: Duration::from_secs(config.interval_secs.max(1)),
            drift_interval: Duration::from_secs(config.drift_interval_secs.max(1)),
            full_sync_max_age: positive_or(
                "full_sync_max_age_days",
                ChronoDuration::try_days(config.full_sync_max_age_days),
                ChronoDuration::days(7),
            ),
            stale_syncing_after: positive_or(
                "stale_syncing_minutes",
                ChronoDuration::try_minutes(config.stale_syncing_minutes),
                ChronoDuration::minutes(30),
            ),
            drift_threshold: config.drift_threshold,
            activity_window: positive_or(
                "activity_window_hours",
                ChronoDuration::try_hours(config.activity_window_hours),
                ChronoDuration::hours(24),
            ),
            activity_probe_batch: config.activity_probe_batch.clamp(1, MAX_ACTIVITY_PROBE_BATCH),
            message_window: config.message_window.max(1),
            message_sub_batch: config.message_sub_batch.max(1),
            channel_batch_min: config.channel_batch_min.max(1),
            channel_batch_max: config.channel_batch_max.max(config.channel_batch_min.max(1)),
            backfill_max_pages: config.backfill_max_pages,
            member_chunk_size: config.member_chunk_size.max(1),
            bulk_batch_size: config.bulk_batch_size.max(1),
            page_delay: Duration::from_millis(config.page_delay_ms),
            batch_delay: Duration::from_millis(config.batch_delay_ms),
            shutdown_grace: Duration::from_millis(config.shutdown_grace_ms),
            profile_history_limit: config.profile_history_limit.max(1),
        }
    }
}

/// Unvalidated configs can carry durations chrono cannot represent
fn positive_or(name: &str, value: Option<ChronoDuration>, fallback: ChronoDuration) -> ChronoDuration {
    match value {
        Some(value) if value > ChronoDuration::zero() => value,
        _ => {
            warn!(setting = name, "Out of range, using {} seconds", fallback.num_seconds());
            fallback
        }
    }
}

impl EngineConfig {
    /// Zero delays, for tests and for embedding in hosts that pace calls themselves
    pub fn without_delays(mut self) -> Self {
        self.page_delay = Duration::ZERO;
        self.batch_delay = Duration::ZERO;
        self.shutdown_grace = Duration::ZERO;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_thresholds() {
        let config = EngineConfig::default();
        assert_eq!(config.full_sync_max_age, ChronoDuration::days(7));
        assert_eq!(config.activity_window, ChronoDuration::hours(24));
        assert_eq!(config.activity_probe_batch, 5);
        assert_eq!(config.channel_batch_min, 2);
        assert_eq!(config.channel_batch_max, 5);
        assert_eq!(config.message_sub_batch, 10);
        assert_eq!(config.member_chunk_size, 20);
        assert_eq!(config.profile_history_limit, 100);
        assert!((config.drift_threshold - 0.10).abs() < f64::EPSILON);
    }

    #[test]
    fn out_of_range_durations_fall_back_instead_of_panicking() {
        let raw = SyncConfig {
            full_sync_max_age_days: 1_000_000_000_000,
            stale_syncing_minutes: -1,
            activity_window_hours: i64::MAX,
            activity_probe_batch: 64,
            ..SyncConfig::default()
        };
        let config = EngineConfig::from(&raw);
        assert_eq!(config.full_sync_max_age, ChronoDuration::days(7));
        assert_eq!(config.stale_syncing_after, ChronoDuration::minutes(30));
        assert_eq!(config.activity_window, ChronoDuration::hours(24));
        assert_eq!(config.activity_probe_batch, MAX_ACTIVITY_PROBE_BATCH);
    }

    #[test]
    fn zero_batch_sizes_are_clamped() {
        let raw = SyncConfig {
            message_sub_batch: 0,
            channel_batch_min: 0,
            channel_batch_max: 0,
            ..SyncConfig::default()
        };
        let config = EngineConfig::from(&raw);
        assert_eq!(config.message_sub_batch, 1);
        assert_eq!(config.channel_batch_min, 1);
        assert_eq!(config.channel_batch_max, 1);
    }
}
