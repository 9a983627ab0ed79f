//! Cache configuration.
//!
//! Controls store capacity, per-class stale times, dedup window, retry policy
//! and background timers via `beekeeper.toml`:
//!
//! ```toml
//! [cache]
//! max_entries = 2000
//! dedup_window_ms = 5000
//!
//! [cache.stale_time_ms]
//! articles = 300000
//! ```

use std::num::NonZeroUsize;

use serde::Deserialize;
use tokio::time::Duration;

use super::keys::EntityClass;
use super::retry::RetryPolicy;

const DEFAULT_MAX_ENTRIES: usize = 2000;
const DEFAULT_DEDUP_WINDOW_MS: u64 = 5_000;
const DEFAULT_GC_TIME_MS: u64 = 30 * 60 * 1000;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 60_000;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_BASE_MS: u64 = 1_000;
const DEFAULT_RETRY_MAX_MS: u64 = 30_000;
const DEFAULT_RETRY_JITTER: f64 = 0.1;
const DEFAULT_HOURLY_TICK_SECS: u64 = 60 * 60;
const DEFAULT_DAILY_TICK_SECS: u64 = 24 * 60 * 60;
const DEFAULT_BATCH_DELAY_MS: u64 = 50;
const DEFAULT_BATCH_LIMIT: usize = 100;
const DEFAULT_IDLE_PREFETCH_MS: u64 = 3_000;
const DEFAULT_MAX_PREDICTIONS: usize = 5;
const DEFAULT_SNAPSHOT_MAX_AGE_SECS: u64 = 10 * 60;

/// Default stale time per entity class, in milliseconds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StaleTimes {
    pub articles: u64,
    pub comments: u64,
    pub tags: u64,
    pub users: u64,
    pub search: u64,
    pub applications: u64,
    pub other: u64,
}

impl Default for StaleTimes {
    fn default() -> Self {
        Self {
            articles: 5 * 60 * 1000,
            comments: 2 * 60 * 1000,
            tags: 15 * 60 * 1000,
            users: 10 * 60 * 1000,
            search: 1000,
            applications: 5 * 60 * 1000,
            other: 5 * 60 * 1000,
        }
    }
}

impl StaleTimes {
    pub fn for_class(&self, class: EntityClass) -> Duration {
        let ms = match class {
            EntityClass::Articles => self.articles,
            EntityClass::Comments => self.comments,
            EntityClass::Tags => self.tags,
            EntityClass::Users => self.users,
            EntityClass::Search => self.search,
            EntityClass::Applications => self.applications,
            EntityClass::Other => self.other,
        };
        Duration::from_millis(ms)
    }
}

/// Cache configuration from `beekeeper.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Master switch; a disabled cache still fetches but never emits events.
    pub enabled: bool,
    /// Maximum entries before LRU eviction.
    pub max_entries: usize,
    /// Grace window after settlement during which duplicates reuse the result.
    pub dedup_window_ms: u64,
    /// Default hard-expiry time.
    pub gc_time_ms: u64,
    /// Default soft-expiry time per entity class.
    pub stale_time_ms: StaleTimes,
    /// Interval of the optional background GC sweep.
    pub sweep_interval_ms: u64,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub retry_jitter: f64,
    /// Cadence of the `time.hourly` invalidation tick.
    pub hourly_tick_secs: u64,
    /// Cadence of the `time.daily` invalidation tick.
    pub daily_tick_secs: u64,
    /// Delay before queued events are flushed as one batch.
    pub batch_delay_ms: u64,
    /// Maximum events drained per flush.
    pub batch_limit: usize,
    /// Idle period before the idle-prefetch strategy runs.
    pub idle_prefetch_ms: u64,
    /// Predictions per trigger.
    pub max_predictions: usize,
    /// Critical entry snapshots older than this are discarded on restore.
    pub snapshot_max_age_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: DEFAULT_MAX_ENTRIES,
            dedup_window_ms: DEFAULT_DEDUP_WINDOW_MS,
            gc_time_ms: DEFAULT_GC_TIME_MS,
            stale_time_ms: StaleTimes::default(),
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_ms: DEFAULT_RETRY_BASE_MS,
            retry_max_ms: DEFAULT_RETRY_MAX_MS,
            retry_jitter: DEFAULT_RETRY_JITTER,
            hourly_tick_secs: DEFAULT_HOURLY_TICK_SECS,
            daily_tick_secs: DEFAULT_DAILY_TICK_SECS,
            batch_delay_ms: DEFAULT_BATCH_DELAY_MS,
            batch_limit: DEFAULT_BATCH_LIMIT,
            idle_prefetch_ms: DEFAULT_IDLE_PREFETCH_MS,
            max_predictions: DEFAULT_MAX_PREDICTIONS,
            snapshot_max_age_secs: DEFAULT_SNAPSHOT_MAX_AGE_SECS,
        }
    }
}

impl CacheConfig {
    /// Store capacity, clamped to 1 if zero.
    pub fn max_entries_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_entries).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    pub fn gc_time(&self) -> Duration {
        Duration::from_millis(self.gc_time_ms)
    }

    pub fn stale_time(&self, class: EntityClass) -> Duration {
        self.stale_time_ms.for_class(class)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn hourly_tick(&self) -> Duration {
        Duration::from_secs(self.hourly_tick_secs)
    }

    pub fn daily_tick(&self) -> Duration {
        Duration::from_secs(self.daily_tick_secs)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn idle_prefetch_delay(&self) -> Duration {
        Duration::from_millis(self.idle_prefetch_ms)
    }

    pub fn snapshot_max_age(&self) -> Duration {
        Duration::from_secs(self.snapshot_max_age_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_ms),
            max_delay: Duration::from_millis(self.retry_max_ms),
            jitter_ratio: self.retry_jitter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.max_entries, 2000);
        assert_eq!(config.dedup_window(), Duration::from_secs(5));
        assert_eq!(config.stale_time(EntityClass::Articles), Duration::from_secs(300));
        assert_eq!(config.stale_time(EntityClass::Comments), Duration::from_secs(120));
        assert_eq!(config.stale_time(EntityClass::Tags), Duration::from_secs(900));
        assert!(config.stale_time(EntityClass::Search) <= Duration::from_secs(1));
        assert_eq!(config.idle_prefetch_delay(), Duration::from_secs(3));
        assert_eq!(config.max_predictions, 5);
        assert_eq!(config.snapshot_max_age(), Duration::from_secs(600));
    }

    #[test]
    fn retry_policy_mirrors_config() {
        let config = CacheConfig {
            max_retries: 1,
            retry_base_ms: 10,
            ..Default::default()
        };
        let policy = config.retry_policy();
        assert_eq!(policy.max_retries, 1);
        assert_eq!(policy.backoff(1), Duration::from_millis(20));
    }

    #[test]
    fn non_zero_clamps_to_min() {
        let config = CacheConfig {
            max_entries: 0,
            ..Default::default()
        };
        assert_eq!(config.max_entries_non_zero().get(), 1);
    }

    #[test]
    fn stale_times_deserialize_partially() {
        let times: StaleTimes =
            serde_json::from_str(r#"{"tags": 1000}"#).expect("partial stale table");
        assert_eq!(times.tags, 1000);
        assert_eq!(times.articles, StaleTimes::default().articles);
    }
}
