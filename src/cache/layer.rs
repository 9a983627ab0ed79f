//! Result cache.
//!
//! Wraps the entry store with soft (stale) and hard (GC) expiry, routes misses
//! through the request deduplicator and retry policy, and exposes the
//! invalidate/patch contract used by the invalidation manager.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;
use metrics::counter;
use serde_json::Value;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Duration, Instant, MissedTickBehavior, interval};
use tracing::{debug, info, instrument, warn};

use super::config::CacheConfig;
use super::dedup::{DedupStats, FetchResult, RequestDeduplicator};
use super::entry::CacheEntry;
use super::keys::QueryKey;
use super::lock;
use super::retry::{FetchError, RetryPolicy};
use super::store::EntryStore;

const SOURCE: &str = "cache::layer";
const METRIC_CACHE_HIT_TOTAL: &str = "beekeeper_cache_hit_total";
const METRIC_CACHE_MISS_TOTAL: &str = "beekeeper_cache_miss_total";
const METRIC_CACHE_STALE_TOTAL: &str = "beekeeper_cache_stale_total";

/// Per-write TTL overrides; `None` falls back to the class default.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    pub stale_time: Option<Duration>,
    pub gc_time: Option<Duration>,
}

impl WriteOptions {
    pub fn stale_time(stale_time: Duration) -> Self {
        Self {
            stale_time: Some(stale_time),
            gc_time: None,
        }
    }
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stale_hits: u64,
    pub writes: u64,
    pub invalidated: u64,
    pub patches: u64,
    pub evictions: u64,
    pub fetches: u64,
    pub entries: usize,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    stale_hits: AtomicU64,
    writes: AtomicU64,
    invalidated: AtomicU64,
    patches: AtomicU64,
    evictions: AtomicU64,
    fetches: AtomicU64,
}

/// Query cache with staleness, GC, deduplication and retries.
pub struct CacheLayer {
    config: CacheConfig,
    store: EntryStore,
    dedup: RequestDeduplicator,
    retry: RetryPolicy,
    counters: Counters,
    /// Invalidations that landed while a fetch for the key was in flight.
    invalidated_in_flight: DashMap<String, Instant>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    pub(super) background: Mutex<JoinSet<()>>,
}

impl CacheLayer {
    /// Construct an isolated cache instance.
    pub fn create(config: CacheConfig) -> Arc<Self> {
        Arc::new(Self {
            store: EntryStore::new(config.max_entries_non_zero()),
            dedup: RequestDeduplicator::new(config.dedup_window()),
            retry: config.retry_policy(),
            counters: Counters::default(),
            invalidated_in_flight: DashMap::new(),
            sweeper: Mutex::new(None),
            background: Mutex::new(JoinSet::new()),
            config,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    // ========================================================================
    // Read / write
    // ========================================================================

    /// Look up an entry. Entries past their GC deadline are removed and reported absent.
    pub fn read(&self, key: &QueryKey) -> Option<CacheEntry> {
        let entry = self.store.get(key)?;
        if entry.is_expired(Instant::now()) {
            debug!(%key, "entry past gc deadline; removing");
            self.store.remove(key);
            return None;
        }
        Some(entry)
    }

    pub fn is_stale(&self, entry: &CacheEntry) -> bool {
        entry.is_stale(Instant::now())
    }

    /// Store `data` under `key` as a success entry.
    pub fn write(&self, key: &QueryKey, data: Value, options: WriteOptions) {
        self.write_arc(key, Arc::new(data), options);
    }

    fn write_arc(&self, key: &QueryKey, data: Arc<Value>, options: WriteOptions) {
        let now = Instant::now();
        let stale_time = options
            .stale_time
            .unwrap_or_else(|| self.config.stale_time(key.class()));
        let gc_time = options.gc_time.unwrap_or_else(|| self.config.gc_time());

        let refreshed = self.store.update(key, |entry| {
            entry.refresh(Arc::clone(&data), now, stale_time, gc_time);
        });
        if refreshed.is_some() {
            self.store.index_article(key, &data);
        } else {
            let entry = CacheEntry::success(key.clone(), data, now, stale_time, gc_time);
            if self.store.set(entry).is_some() {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark every entry under `prefix` stale. Data is kept so it can be shown
    /// while a refresh is pending. Returns the number of entries with data
    /// affected. A fetch already in flight under `prefix` settles as stale.
    pub fn invalidate(&self, prefix: &QueryKey) -> usize {
        let now = Instant::now();
        let count = self.store.update_prefix(prefix, |entry| {
            if !entry.has_data() {
                return false;
            }
            entry.mark_stale(now);
            true
        });
        for key in self.dedup.pending_under(prefix) {
            self.invalidated_in_flight
                .insert(key.serialized().to_string(), now);
        }
        self.dedup.forget_settled(prefix);
        self.counters
            .invalidated
            .fetch_add(count as u64, Ordering::Relaxed);
        debug!(%prefix, count, "invalidated prefix");
        count
    }

    /// Hard-remove every entry under `prefix`.
    pub fn remove_prefix(&self, prefix: &QueryKey) -> usize {
        self.dedup.forget_settled(prefix);
        self.store.remove_prefix(prefix)
    }

    /// Transform an entry's data in place. Status and staleness window are
    /// preserved, `updated_at` is bumped. Returns `false` when no data is cached.
    pub fn patch(&self, key: &QueryKey, mutator: impl FnOnce(&mut Value)) -> bool {
        let now = Instant::now();
        let patched = self.store.update(key, |entry| {
            if !entry.has_data() {
                return None;
            }
            mutator(Arc::make_mut(&mut entry.data));
            entry.updated_at = now;
            Some(Arc::clone(&entry.data))
        });

        match patched.flatten() {
            Some(data) => {
                self.store.index_article(key, &data);
                self.counters.patches.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => {
                warn!(%key, warning = "cache_consistency", "patch targeted a missing entry");
                false
            }
        }
    }

    /// Slug key of the article cached under `["articles","detail",id]`.
    pub fn slug_key_for_id(&self, id: i64) -> Option<QueryKey> {
        self.store.slug_key_for_id(id)
    }

    /// Id key of the article cached under `["articles","slug",slug]`.
    pub fn id_key_for_slug(&self, slug: &str) -> Option<QueryKey> {
        self.store.id_key_for_slug(slug)
    }

    /// Record an article id/slug pair learned outside a cache write.
    pub fn link_article(&self, id: i64, slug: &str) {
        self.store.link_article(id, slug);
    }

    /// Keys currently cached under `prefix`.
    pub fn keys_with_prefix(&self, prefix: &QueryKey) -> Vec<QueryKey> {
        self.store
            .find_by_prefix(prefix)
            .into_iter()
            .map(|entry| entry.key)
            .collect()
    }

    pub(crate) fn entries(&self) -> Vec<CacheEntry> {
        self.store.entries()
    }

    // ========================================================================
    // Fetch path
    // ========================================================================

    /// Return fresh cached data, or fetch through the deduplicator and retry policy.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn fetch<F, Fut>(self: &Arc<Self>, key: &QueryKey, fetch_fn: F) -> FetchResult
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
    {
        if let Some(entry) = self.read(key)
            && entry.has_data()
            && !self.is_stale(&entry)
        {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            counter!(METRIC_CACHE_HIT_TOTAL).increment(1);
            return Ok(entry.data);
        }
        self.refetch(key, fetch_fn).await
    }

    /// Fetch regardless of freshness. Still deduplicated against in-flight requests.
    pub async fn refetch<F, Fut>(self: &Arc<Self>, key: &QueryKey, fetch_fn: F) -> FetchResult
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
    {
        match self.store.get(key) {
            Some(entry) if entry.has_data() => {
                self.counters.stale_hits.fetch_add(1, Ordering::Relaxed);
                counter!(METRIC_CACHE_STALE_TOTAL).increment(1);
            }
            Some(_) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                counter!(METRIC_CACHE_MISS_TOTAL).increment(1);
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                counter!(METRIC_CACHE_MISS_TOTAL).increment(1);
                self.store.set(CacheEntry::pending(
                    key.clone(),
                    Instant::now(),
                    self.config.gc_time(),
                ));
            }
        }

        let layer = Arc::downgrade(self);
        let retry = self.retry.clone();
        let fetch_key = key.clone();
        self.dedup
            .dedupe(key, move || async move {
                let started = Instant::now();
                let result = retry
                    .run(&fetch_key, || {
                        if let Some(layer) = layer.upgrade() {
                            layer.counters.fetches.fetch_add(1, Ordering::Relaxed);
                        }
                        fetch_fn()
                    })
                    .await
                    .map(Arc::new);
                settle(&layer, &fetch_key, started, &result);
                result
            })
            .await
    }

    fn record_failure(&self, key: &QueryKey, error: &FetchError) {
        let now = Instant::now();
        let updated = self.store.update(key, |entry| entry.fail(error.clone(), now));
        if updated.is_none() {
            let mut entry = CacheEntry::pending(key.clone(), now, self.config.gc_time());
            entry.fail(error.clone(), now);
            self.store.set(entry);
        }
    }

    pub fn is_fetching(&self, key: &QueryKey) -> bool {
        self.dedup.is_in_flight(key)
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Remove entries past their GC deadline. Reads already do this lazily.
    pub fn sweep(&self) -> usize {
        let removed = self.store.remove_expired(Instant::now());
        if removed > 0 {
            debug!(removed, "gc sweep removed expired entries");
        }
        removed
    }

    /// Start the periodic GC sweep. Restarting replaces the previous task.
    pub fn start_sweeper(self: &Arc<Self>) {
        let layer = Arc::downgrade(self);
        let period = self.config.sweep_interval();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(layer) = layer.upgrade() else {
                    break;
                };
                layer.sweep();
            }
        });
        if let Some(previous) = lock::lock(&self.sweeper, SOURCE, "start_sweeper").replace(handle) {
            previous.abort();
        }
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            stale_hits: c.stale_hits.load(Ordering::Relaxed),
            writes: c.writes.load(Ordering::Relaxed),
            invalidated: c.invalidated.load(Ordering::Relaxed),
            patches: c.patches.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            fetches: c.fetches.load(Ordering::Relaxed),
            entries: self.store.len(),
        }
    }

    pub fn dedup_stats(&self) -> DedupStats {
        self.dedup.stats()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn clear(&self) {
        self.store.clear();
        self.invalidated_in_flight.clear();
        self.dedup.dispose();
    }

    /// Stop every timer and background task owned by this instance.
    pub fn dispose(&self) {
        if let Some(handle) = lock::lock(&self.sweeper, SOURCE, "dispose").take() {
            handle.abort();
        }
        lock::lock(&self.background, SOURCE, "dispose.background").abort_all();
        self.dedup.dispose();
        self.invalidated_in_flight.clear();
        info!(entries = self.store.len(), "cache layer disposed");
    }
}

fn settle(layer: &Weak<CacheLayer>, key: &QueryKey, started: Instant, result: &FetchResult) {
    let Some(layer) = layer.upgrade() else {
        return;
    };
    let invalidated = layer
        .invalidated_in_flight
        .remove(key.serialized())
        .is_some_and(|(_, at)| at >= started);
    match result {
        Ok(data) if invalidated => {
            debug!(%key, "invalidated while in flight; settling stale");
            layer.dedup.forget(key);
            layer.write_arc(key, Arc::clone(data), WriteOptions::stale_time(Duration::ZERO));
        }
        Ok(data) => layer.write_arc(key, Arc::clone(data), WriteOptions::default()),
        Err(error) => layer.record_failure(key, error),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;
    use tokio::time::{advance, sleep};

    use super::*;
    use crate::cache::entry::EntryStatus;
    use crate::cache::keys;
    use crate::query_key;

    fn layer() -> Arc<CacheLayer> {
        CacheLayer::create(CacheConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn write_then_read_is_fresh() {
        let cache = layer();
        let key = keys::article_detail(1);
        cache.write(&key, json!({"id": 1}), WriteOptions::default());

        let entry = cache.read(&key).expect("entry");
        assert_eq!(entry.status, EntryStatus::Success);
        assert!(!cache.is_stale(&entry));
        assert_eq!(entry.stale_at - entry.created_at, Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_marks_stale_but_keeps_data() {
        let cache = layer();
        let key = query_key!["articles", "list", {}];
        cache.write(&key, json!([1, 2]), WriteOptions::default());

        assert_eq!(cache.invalidate(&keys::article_lists()), 1);
        let entry = cache.read(&key).expect("still present");
        assert!(cache.is_stale(&entry));
        assert_eq!(*entry.data, json!([1, 2]));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_removed_lazily() {
        let cache = layer();
        let key = query_key!["tags"];
        cache.write(
            &key,
            json!([]),
            WriteOptions {
                stale_time: Some(Duration::from_secs(1)),
                gc_time: Some(Duration::from_secs(2)),
            },
        );
        advance(Duration::from_secs(3)).await;
        assert!(cache.read(&key).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_reclaims_expired_entries() {
        let cache = layer();
        cache.write(
            &query_key!["a"],
            json!(1),
            WriteOptions {
                stale_time: Some(Duration::from_secs(1)),
                gc_time: Some(Duration::from_secs(1)),
            },
        );
        cache.write(&query_key!["b"], json!(2), WriteOptions::default());
        advance(Duration::from_secs(2)).await;
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn patch_preserves_status_and_window() {
        let cache = layer();
        let key = keys::article_detail(42);
        cache.write(&key, json!({"id": 42, "likes": 10}), WriteOptions::default());
        let before = cache.read(&key).expect("entry");

        advance(Duration::from_secs(1)).await;
        assert!(cache.patch(&key, |data| data["likes"] = json!(11)));

        let after = cache.read(&key).expect("entry");
        assert_eq!(after.data["likes"], json!(11));
        assert_eq!(after.status, before.status);
        assert_eq!(after.stale_at, before.stale_at);
        assert_eq!(after.gc_at, before.gc_at);
        assert!(after.updated_at > before.updated_at);
    }

    #[tokio::test]
    async fn patch_missing_entry_returns_false() {
        let cache = layer();
        assert!(!cache.patch(&query_key!["nothing"], |_| {}));
        assert_eq!(cache.stats().patches, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_hits_cache_when_fresh() {
        let cache = layer();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = keys::popular_tags();

        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            let data = cache
                .fetch(&key, move || {
                    let calls = Arc::clone(&calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(json!(["bees"]))
                    }
                })
                .await
                .expect("fetch");
            assert_eq!(*data, json!(["bees"]));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_after_invalidate_goes_to_network() {
        let cache = layer();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = keys::popular_tags();
        let fetcher = {
            let calls = Arc::clone(&calls);
            move || {
                let calls = Arc::clone(&calls);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(n))
                }
            }
        };

        cache.fetch(&key, fetcher.clone()).await.expect("first");
        cache.invalidate(&keys::tags());
        let data = cache.fetch(&key, fetcher).await.expect("second");
        assert_eq!(*data, json!(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_first_fetch_leaves_error_entry() {
        let cache = layer();
        let key = keys::article_detail(404);
        let result = cache
            .fetch(&key, || async { Err(FetchError::from_status(404, "missing")) })
            .await;
        assert!(matches!(result, Err(FetchError::Client { status: 404, .. })));

        let entry = cache.read(&key).expect("error entry");
        assert_eq!(entry.status, EntryStatus::Error);
        assert!(entry.error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn invalidation_during_fetch_settles_stale() {
        let cache = layer();
        let key = query_key!["articles", "list", {}];
        let fetching = {
            let cache = Arc::clone(&cache);
            let key = key.clone();
            tokio::spawn(async move {
                cache
                    .fetch(&key, || async {
                        sleep(Duration::from_millis(100)).await;
                        Ok(json!(["before-mutation"]))
                    })
                    .await
            })
        };
        sleep(Duration::from_millis(10)).await;
        assert!(cache.is_fetching(&key));

        assert_eq!(cache.invalidate(&keys::article_lists()), 0);
        fetching.await.expect("join").expect("fetch");

        let entry = cache.read(&key).expect("settled entry");
        assert_eq!(*entry.data, json!(["before-mutation"]));
        assert!(cache.is_stale(&entry));

        let data = cache
            .fetch(&key, || async { Ok(json!(["after-mutation"])) })
            .await
            .expect("refetch");
        assert_eq!(*data, json!(["after-mutation"]));
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_started_after_invalidation_settles_fresh() {
        let cache = layer();
        let key = keys::popular_tags();
        cache.invalidate(&keys::tags());
        cache
            .fetch(&key, || async { Ok(json!(["honey"])) })
            .await
            .expect("fetch");
        assert!(!cache.is_stale(&cache.read(&key).expect("entry")));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_stops_on_dispose() {
        let cache = CacheLayer::create(CacheConfig {
            sweep_interval_ms: 100,
            ..Default::default()
        });
        cache.write(
            &query_key!["a"],
            json!(1),
            WriteOptions {
                stale_time: Some(Duration::from_millis(10)),
                gc_time: Some(Duration::from_millis(10)),
            },
        );
        cache.start_sweeper();
        sleep(Duration::from_millis(250)).await;
        assert!(cache.is_empty());

        cache.dispose();
        assert!(lock::lock(&cache.sweeper, SOURCE, "test").is_none());
    }
}
