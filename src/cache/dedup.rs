//! Request deduplication.
//!
//! Concurrent callers for the same key share one underlying fetch. The shared
//! future is driven by its own task so the fetch completes even if every
//! caller stops waiting. After settlement the record lingers for a grace
//! window so back-to-back duplicates still reuse the settled result.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use metrics::counter;
use serde_json::Value;
use tokio::task::JoinSet;
use tokio::time::{Duration, sleep};
use tracing::debug;

use super::keys::QueryKey;
use super::lock;
use super::retry::FetchError;

const SOURCE: &str = "cache::dedup";
const METRIC_CACHE_DEDUP_TOTAL: &str = "beekeeper_cache_dedup_total";

pub type FetchResult = Result<Arc<Value>, FetchError>;
type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

struct InFlight {
    key: QueryKey,
    fetch: SharedFetch,
    subscribers: usize,
    generation: u64,
}

/// Observability counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct DedupStats {
    pub total_requests: u64,
    pub deduplicated_requests: u64,
    pub in_flight: usize,
}

/// Tracks in-flight requests by key.
pub struct RequestDeduplicator {
    in_flight: Arc<DashMap<String, InFlight>>,
    grace: Duration,
    generation: AtomicU64,
    total_requests: AtomicU64,
    deduplicated_requests: AtomicU64,
    timers: Mutex<JoinSet<()>>,
}

impl RequestDeduplicator {
    pub fn new(grace: Duration) -> Self {
        Self {
            in_flight: Arc::new(DashMap::new()),
            grace,
            generation: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
            deduplicated_requests: AtomicU64::new(0),
            timers: Mutex::new(JoinSet::new()),
        }
    }

    /// Run `fetch_fn` unless a fetch for `key` is in flight or settled within
    /// the grace window, in which case its result is shared.
    pub async fn dedupe<F, Fut>(&self, key: &QueryKey, fetch_fn: F) -> FetchResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchResult> + Send + 'static,
    {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let fetch = match self.in_flight.entry(key.serialized().to_string()) {
            Entry::Occupied(mut occupied) => {
                self.deduplicated_requests.fetch_add(1, Ordering::Relaxed);
                counter!(METRIC_CACHE_DEDUP_TOTAL).increment(1);
                let record = occupied.get_mut();
                record.subscribers += 1;
                debug!(%key, subscribers = record.subscribers, "joined in-flight request");
                record.fetch.clone()
            }
            Entry::Vacant(vacant) => {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                let fetch = fetch_fn().boxed().shared();
                vacant.insert(InFlight {
                    key: key.clone(),
                    fetch: fetch.clone(),
                    subscribers: 1,
                    generation,
                });
                self.spawn_driver(key.serialized().to_string(), fetch.clone(), generation);
                fetch
            }
        };

        fetch.await
    }

    fn spawn_driver(&self, serialized: String, fetch: SharedFetch, generation: u64) {
        let in_flight = Arc::clone(&self.in_flight);
        let grace = self.grace;
        let mut timers = lock::lock(&self.timers, SOURCE, "spawn_driver");
        while timers.try_join_next().is_some() {}
        timers.spawn(async move {
            let _ = fetch.await;
            sleep(grace).await;
            in_flight.remove_if(&serialized, |_, record| record.generation == generation);
        });
    }

    /// Drop settled records under `prefix` so the next call fetches fresh.
    /// Records still in flight are kept.
    pub fn forget_settled(&self, prefix: &QueryKey) -> usize {
        let before = self.in_flight.len();
        self.in_flight
            .retain(|_, record| !(record.key.starts_with(prefix) && record.fetch.peek().is_some()));
        before - self.in_flight.len()
    }

    /// Drop the record for `key` whatever its state; callers already
    /// subscribed still receive the result.
    pub fn forget(&self, key: &QueryKey) -> bool {
        self.in_flight.remove(key.serialized()).is_some()
    }

    /// Keys under `prefix` whose fetch has not settled yet.
    pub fn pending_under(&self, prefix: &QueryKey) -> Vec<QueryKey> {
        self.in_flight
            .iter()
            .filter(|record| record.key.starts_with(prefix) && record.fetch.peek().is_none())
            .map(|record| record.key.clone())
            .collect()
    }

    pub fn is_in_flight(&self, key: &QueryKey) -> bool {
        self.in_flight
            .get(key.serialized())
            .is_some_and(|record| record.fetch.peek().is_none())
    }

    pub fn subscribers(&self, key: &QueryKey) -> usize {
        self.in_flight
            .get(key.serialized())
            .map_or(0, |record| record.subscribers)
    }

    pub fn stats(&self) -> DedupStats {
        DedupStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            deduplicated_requests: self.deduplicated_requests.load(Ordering::Relaxed),
            in_flight: self.in_flight.len(),
        }
    }

    /// Abort grace timers and forget every record.
    pub fn dispose(&self) {
        lock::lock(&self.timers, SOURCE, "dispose").abort_all();
        self.in_flight.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use futures::future::join_all;
    use serde_json::json;

    use super::*;
    use crate::query_key;

    fn counting_fetch(
        calls: &Arc<AtomicUsize>,
        result: FetchResult,
    ) -> impl FnOnce() -> BoxFuture<'static, FetchResult> {
        let calls = Arc::clone(calls);
        move || {
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_millis(50)).await;
                result
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_calls_share_one_fetch() {
        let dedup = RequestDeduplicator::new(Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));
        let key = query_key!["articles", "detail", 1];

        let results = join_all((0..5).map(|_| {
            dedup.dedupe(&key, counting_fetch(&calls, Ok(Arc::new(json!({"id": 1})))))
        }))
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(*result.expect("shared success"), json!({"id": 1}));
        }
        let stats = dedup.stats();
        assert_eq!(stats.total_requests, 5);
        assert_eq!(stats.deduplicated_requests, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_fans_out_to_every_caller() {
        let dedup = RequestDeduplicator::new(Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));
        let key = query_key!["articles", "detail", 2];
        let error = FetchError::from_status(500, "boom");

        let results = join_all(
            (0..3).map(|_| dedup.dedupe(&key, counting_fetch(&calls, Err(error.clone())))),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r.as_ref().err() == Some(&error)));
    }

    #[tokio::test(start_paused = true)]
    async fn grace_window_reuses_settled_result() {
        let dedup = RequestDeduplicator::new(Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));
        let key = query_key!["tags"];

        dedup
            .dedupe(&key, counting_fetch(&calls, Ok(Arc::new(json!([])))))
            .await
            .expect("first fetch");
        sleep(Duration::from_secs(1)).await;
        dedup
            .dedupe(&key, counting_fetch(&calls, Ok(Arc::new(json!([])))))
            .await
            .expect("within grace window");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        sleep(Duration::from_secs(6)).await;
        dedup
            .dedupe(&key, counting_fetch(&calls, Ok(Arc::new(json!([])))))
            .await
            .expect("after grace window");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn forget_settled_drops_only_completed_records() {
        let dedup = RequestDeduplicator::new(Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));
        let key = query_key!["tags", "popular"];

        dedup
            .dedupe(&key, counting_fetch(&calls, Ok(Arc::new(json!([])))))
            .await
            .expect("fetch");
        assert_eq!(dedup.forget_settled(&query_key!["tags"]), 1);
        assert!(!dedup.is_in_flight(&key));
        assert_eq!(dedup.stats().in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_clears_records() {
        let dedup = RequestDeduplicator::new(Duration::from_secs(5));
        let calls = Arc::new(AtomicUsize::new(0));
        dedup
            .dedupe(&query_key!["a"], counting_fetch(&calls, Ok(Arc::new(json!(1)))))
            .await
            .expect("fetch");
        dedup.dispose();
        assert_eq!(dedup.stats().in_flight, 0);
    }
}
