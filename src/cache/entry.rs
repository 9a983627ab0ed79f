//! Cache entries.

use std::sync::Arc;

use serde_json::Value;
use tokio::time::{Duration, Instant};

use super::keys::QueryKey;
use super::retry::FetchError;

/// Lifecycle of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Pending,
    Success,
    Error,
}

/// A cached result with its staleness and GC deadlines.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: QueryKey,
    pub data: Arc<Value>,
    pub status: EntryStatus,
    pub created_at: Instant,
    pub updated_at: Instant,
    pub stale_at: Instant,
    pub gc_at: Instant,
    /// Last error seen for this key. On a success entry this is the
    /// non-blocking error of a failed background refresh.
    pub error: Option<FetchError>,
}

impl CacheEntry {
    /// Create a success entry. `gc_time` is clamped so `stale_at <= gc_at`.
    pub fn success(
        key: QueryKey,
        data: Arc<Value>,
        now: Instant,
        stale_time: Duration,
        gc_time: Duration,
    ) -> Self {
        let gc_time = gc_time.max(stale_time);
        Self {
            key,
            data,
            status: EntryStatus::Success,
            created_at: now,
            updated_at: now,
            stale_at: now + stale_time,
            gc_at: now + gc_time,
            error: None,
        }
    }

    /// Placeholder for a first fetch in progress. Born stale, holds no data.
    pub fn pending(key: QueryKey, now: Instant, gc_time: Duration) -> Self {
        Self {
            key,
            data: Arc::new(Value::Null),
            status: EntryStatus::Pending,
            created_at: now,
            updated_at: now,
            stale_at: now,
            gc_at: now + gc_time,
            error: None,
        }
    }

    /// Record a failed fetch. A pending entry becomes `Error`; a success
    /// entry keeps its data and status and carries the error as a secondary signal.
    pub fn fail(&mut self, error: FetchError, now: Instant) {
        if self.status != EntryStatus::Success {
            self.status = EntryStatus::Error;
        }
        self.error = Some(error);
        self.updated_at = now;
    }

    pub fn has_data(&self) -> bool {
        self.status == EntryStatus::Success
    }

    /// Overwrite data in place, keeping `created_at` and the success status.
    pub fn refresh(&mut self, data: Arc<Value>, now: Instant, stale_time: Duration, gc_time: Duration) {
        let gc_time = gc_time.max(stale_time);
        self.data = data;
        self.status = EntryStatus::Success;
        self.updated_at = now;
        self.stale_at = now + stale_time;
        self.gc_at = now + gc_time;
        self.error = None;
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        now >= self.stale_at
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.gc_at
    }

    /// Force staleness without touching data; never moves `stale_at` past `gc_at`.
    pub fn mark_stale(&mut self, now: Instant) {
        self.stale_at = now.min(self.gc_at);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::query_key;

    #[test]
    fn gc_never_precedes_stale() {
        let now = Instant::now();
        let entry = CacheEntry::success(
            query_key!["tags"],
            Arc::new(json!([])),
            now,
            Duration::from_secs(600),
            Duration::from_secs(60),
        );
        assert!(entry.stale_at <= entry.gc_at);
        assert_eq!(entry.stale_at, entry.gc_at);
    }

    #[test]
    fn mark_stale_keeps_data() {
        let now = Instant::now();
        let mut entry = CacheEntry::success(
            query_key!["tags"],
            Arc::new(json!(["rust"])),
            now,
            Duration::from_secs(60),
            Duration::from_secs(120),
        );
        assert!(!entry.is_stale(now));
        entry.mark_stale(now);
        assert!(entry.is_stale(now));
        assert_eq!(*entry.data, json!(["rust"]));
        assert!(!entry.is_expired(now));
    }
}
