//! Query and mutation accessors for feature code.
//!
//! `CacheLayer::query` is the stale-while-revalidate read path: fresh data is
//! returned as-is, stale data is returned immediately while a background
//! refresh runs, and only a miss waits on the network. `Mutation` wraps a
//! write call with success/error hooks, which is where feature code announces
//! domain events or patches cached entries.

use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, warn};

use super::entry::EntryStatus;
use super::keys::QueryKey;
use super::layer::CacheLayer;
use super::lock;
use super::retry::FetchError;

const SOURCE: &str = "cache::query";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Pending,
    Success,
    Error,
}

impl From<EntryStatus> for QueryStatus {
    fn from(status: EntryStatus) -> Self {
        match status {
            EntryStatus::Pending => Self::Pending,
            EntryStatus::Success => Self::Success,
            EntryStatus::Error => Self::Error,
        }
    }
}

/// What a view renders for a key.
#[derive(Debug, Clone)]
pub struct QueryState {
    pub data: Option<Arc<Value>>,
    pub status: QueryStatus,
    /// On a success state, the error of a failed background refresh.
    pub error: Option<FetchError>,
    pub is_stale: bool,
    pub is_fetching: bool,
}

impl QueryState {
    fn pending() -> Self {
        Self {
            data: None,
            status: QueryStatus::Pending,
            error: None,
            is_stale: false,
            is_fetching: false,
        }
    }
}

impl CacheLayer {
    /// Current state of `key` without triggering a fetch.
    pub fn peek(&self, key: &QueryKey) -> QueryState {
        let Some(entry) = self.read(key) else {
            return QueryState::pending();
        };
        let has_data = entry.has_data();
        QueryState {
            is_stale: self.is_stale(&entry),
            status: entry.status.into(),
            error: entry.error,
            data: has_data.then_some(entry.data),
            is_fetching: self.is_fetching(key),
        }
    }

    /// Stale-while-revalidate read.
    pub async fn query<F, Fut>(self: &Arc<Self>, key: &QueryKey, fetch_fn: F) -> QueryState
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
    {
        if let Some(entry) = self.read(key)
            && entry.has_data()
        {
            if !self.is_stale(&entry) {
                return QueryState {
                    data: Some(entry.data),
                    status: QueryStatus::Success,
                    error: entry.error,
                    is_stale: false,
                    is_fetching: self.is_fetching(key),
                };
            }
            self.revalidate_in_background(key, fetch_fn);
            return QueryState {
                data: Some(entry.data),
                status: QueryStatus::Success,
                error: entry.error,
                is_stale: true,
                is_fetching: true,
            };
        }

        match self.fetch(key, fetch_fn).await {
            Ok(data) => QueryState {
                data: Some(data),
                status: QueryStatus::Success,
                error: None,
                is_stale: false,
                is_fetching: false,
            },
            Err(error) => QueryState {
                data: None,
                status: QueryStatus::Error,
                error: Some(error),
                is_stale: false,
                is_fetching: false,
            },
        }
    }

    fn revalidate_in_background<F, Fut>(self: &Arc<Self>, key: &QueryKey, fetch_fn: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, FetchError>> + Send + 'static,
    {
        let layer = Arc::clone(self);
        let key = key.clone();
        let mut background = lock::lock(&self.background, SOURCE, "revalidate");
        while background.try_join_next().is_some() {}
        background.spawn(async move {
            match layer.refetch(&key, fetch_fn).await {
                Ok(_) => debug!(%key, "background refresh complete"),
                Err(error) => {
                    warn!(%key, error = %error, "background refresh failed; serving stale data")
                }
            }
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    Idle,
    Pending,
    Success,
    Error,
}

type MutateFn<I, O> = Box<dyn Fn(I) -> BoxFuture<'static, Result<O, FetchError>> + Send + Sync>;
type SuccessHook<I, O> = Box<dyn Fn(&O, &I) + Send + Sync>;
type ErrorHook<I> = Box<dyn Fn(&FetchError, &I) + Send + Sync>;

/// Write-side accessor with lifecycle hooks.
pub struct Mutation<I, O> {
    run: MutateFn<I, O>,
    on_success: Vec<SuccessHook<I, O>>,
    on_error: Vec<ErrorHook<I>>,
    status: Mutex<MutationStatus>,
    last_error: Mutex<Option<FetchError>>,
}

impl<I, O> Mutation<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub fn new<F, Fut>(run: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, FetchError>> + Send + 'static,
    {
        Self {
            run: Box::new(move |input| Box::pin(run(input))),
            on_success: Vec::new(),
            on_error: Vec::new(),
            status: Mutex::new(MutationStatus::Idle),
            last_error: Mutex::new(None),
        }
    }

    /// Runs after a successful mutation; typically emits a domain event.
    pub fn on_success(mut self, hook: impl Fn(&O, &I) + Send + Sync + 'static) -> Self {
        self.on_success.push(Box::new(hook));
        self
    }

    pub fn on_error(mut self, hook: impl Fn(&FetchError, &I) + Send + Sync + 'static) -> Self {
        self.on_error.push(Box::new(hook));
        self
    }

    pub async fn mutate(&self, input: I) -> Result<O, FetchError>
    where
        I: Clone,
    {
        *lock::lock(&self.status, SOURCE, "mutate.pending") = MutationStatus::Pending;
        let result = (self.run)(input.clone()).await;
        match &result {
            Ok(output) => {
                *lock::lock(&self.last_error, SOURCE, "mutate.ok") = None;
                *lock::lock(&self.status, SOURCE, "mutate.ok") = MutationStatus::Success;
                for hook in &self.on_success {
                    hook(output, &input);
                }
            }
            Err(error) => {
                *lock::lock(&self.last_error, SOURCE, "mutate.err") = Some(error.clone());
                *lock::lock(&self.status, SOURCE, "mutate.err") = MutationStatus::Error;
                for hook in &self.on_error {
                    hook(error, &input);
                }
            }
        }
        result
    }

    pub fn status(&self) -> MutationStatus {
        *lock::lock(&self.status, SOURCE, "status")
    }

    pub fn last_error(&self) -> Option<FetchError> {
        lock::lock(&self.last_error, SOURCE, "last_error").clone()
    }

    pub fn reset(&self) {
        *lock::lock(&self.status, SOURCE, "reset") = MutationStatus::Idle;
        *lock::lock(&self.last_error, SOURCE, "reset") = None;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use tokio::time::{Duration, sleep};

    use super::*;
    use crate::cache::config::CacheConfig;
    use crate::cache::keys;
    use crate::cache::layer::WriteOptions;

    #[tokio::test(start_paused = true)]
    async fn miss_waits_for_data() {
        let cache = CacheLayer::create(CacheConfig::default());
        let state = cache
            .query(&keys::popular_tags(), || async { Ok(json!(["honey"])) })
            .await;
        assert_eq!(state.status, QueryStatus::Success);
        assert_eq!(state.data.as_deref(), Some(&json!(["honey"])));
        assert!(!state.is_stale);
    }

    #[tokio::test(start_paused = true)]
    async fn miss_failure_surfaces_real_error() {
        let cache = CacheLayer::create(CacheConfig::default());
        let state = cache
            .query(&keys::article_detail(9), || async {
                Err(FetchError::from_status(403, "forbidden"))
            })
            .await;
        assert_eq!(state.status, QueryStatus::Error);
        assert!(state.data.is_none());
        assert_eq!(state.error, Some(FetchError::from_status(403, "forbidden")));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_data_is_served_while_refreshing() {
        let cache = CacheLayer::create(CacheConfig::default());
        let key = keys::popular_tags();
        cache.write(&key, json!(["old"]), WriteOptions::default());
        cache.invalidate(&key);

        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let state = cache
            .query(&key, move || {
                let counted = Arc::clone(&counted);
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(["new"]))
                }
            })
            .await;
        assert!(state.is_stale);
        assert_eq!(state.data.as_deref(), Some(&json!(["old"])));

        sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let refreshed = cache.peek(&key);
        assert!(!refreshed.is_stale);
        assert_eq!(refreshed.data.as_deref(), Some(&json!(["new"])));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_background_refresh_keeps_stale_value() {
        let cache = CacheLayer::create(CacheConfig {
            max_retries: 0,
            ..Default::default()
        });
        let key = keys::popular_tags();
        cache.write(&key, json!(["kept"]), WriteOptions::default());
        cache.invalidate(&key);

        let state = cache
            .query(&key, || async { Err(FetchError::network("offline")) })
            .await;
        assert_eq!(state.data.as_deref(), Some(&json!(["kept"])));

        sleep(Duration::from_millis(10)).await;
        let after = cache.peek(&key);
        assert_eq!(after.status, QueryStatus::Success);
        assert_eq!(after.data.as_deref(), Some(&json!(["kept"])));
        assert_eq!(after.error, Some(FetchError::network("offline")));
    }

    #[tokio::test]
    async fn mutation_runs_hooks() {
        let successes = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&successes);
        let f = Arc::clone(&failures);

        let mutation = Mutation::new(|likes: i64| async move {
            if likes >= 0 {
                Ok(likes + 1)
            } else {
                Err(FetchError::from_status(400, "negative"))
            }
        })
        .on_success(move |output, _| {
            assert_eq!(*output, 11);
            s.fetch_add(1, Ordering::SeqCst);
        })
        .on_error(move |_, _| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(mutation.status(), MutationStatus::Idle);
        assert_eq!(mutation.mutate(10).await, Ok(11));
        assert_eq!(mutation.status(), MutationStatus::Success);

        assert!(mutation.mutate(-1).await.is_err());
        assert_eq!(mutation.status(), MutationStatus::Error);
        assert!(mutation.last_error().is_some());

        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert_eq!(failures.load(Ordering::SeqCst), 1);

        mutation.reset();
        assert_eq!(mutation.status(), MutationStatus::Idle);
    }
}
