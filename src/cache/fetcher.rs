//! Key-to-network resolution.
//!
//! The warming engine and the CLI only know query keys; a `Fetcher` turns a key
//! into the JSON the REST API returns for it.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::dedup::FetchResult;
use super::keys::QueryKey;
use super::layer::CacheLayer;
use super::retry::FetchError;

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, key: &QueryKey) -> Result<Value, FetchError>;
}

/// Adapts an async closure into a `Fetcher`.
pub struct FnFetcher<F>(pub F);

#[async_trait]
impl<F, Fut> Fetcher for FnFetcher<F>
where
    F: Fn(QueryKey) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, FetchError>> + Send,
{
    async fn fetch(&self, key: &QueryKey) -> Result<Value, FetchError> {
        (self.0)(key.clone()).await
    }
}

impl CacheLayer {
    /// `fetch` with the network call delegated to `fetcher`.
    pub async fn fetch_with(self: &Arc<Self>, key: &QueryKey, fetcher: Arc<dyn Fetcher>) -> FetchResult {
        let target = key.clone();
        self.fetch(key, move || {
            let fetcher = Arc::clone(&fetcher);
            let target = target.clone();
            async move { fetcher.fetch(&target).await }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::cache::config::CacheConfig;
    use crate::cache::keys;

    #[tokio::test(start_paused = true)]
    async fn fetch_with_routes_through_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let fetcher: Arc<dyn Fetcher> = Arc::new(FnFetcher(move |key: QueryKey| {
            counted.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, FetchError>(json!({"key": key.serialized()})) }
        }));
        let cache = CacheLayer::create(CacheConfig::default());

        let first = cache
            .fetch_with(&keys::popular_tags(), Arc::clone(&fetcher))
            .await
            .expect("first");
        let second = cache
            .fetch_with(&keys::popular_tags(), fetcher)
            .await
            .expect("second");

        assert_eq!(first, second);
        assert_eq!(*first, json!({"key": "[\"tags\",\"popular\"]"}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
