use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use beekeeper::cache::events::UserUpdated;
use beekeeper::cache::{
    CacheConfig, CacheLayer, DomainEvent, FetchError, Fetcher, FnFetcher, InvalidationManager,
    MemoryStorage, QueryKey, WarmingEngine, WriteOptions, keys,
};
use beekeeper::infra::telemetry;
use metrics_util::debugging::DebuggingRecorder;
use serde_json::{Value, json};
use serial_test::serial;

#[tokio::test(start_paused = true)]
#[serial]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");
    telemetry::describe_metrics();

    let layer = CacheLayer::create(CacheConfig {
        max_entries: 2,
        ..Default::default()
    });
    let ok = || async { Ok::<_, FetchError>(json!({"id": 1})) };

    // miss, then hit
    layer.fetch(&keys::article_detail(1), ok).await.expect("miss");
    layer.fetch(&keys::article_detail(1), ok).await.expect("hit");

    // settled record reused within the grace window
    layer.refetch(&keys::article_detail(1), ok).await.expect("dedup");

    // stale hit after invalidation, through the manager
    let manager = InvalidationManager::create(Arc::clone(&layer));
    layer.write(&keys::user_profile(3), json!({"id": 3}), WriteOptions::default());
    manager.emit(DomainEvent::UserUpdated(UserUpdated { user_id: 3 }));
    layer
        .fetch(&keys::user_profile(3), || async {
            Ok::<_, FetchError>(json!({"id": 3, "name": "Ada"}))
        })
        .await
        .expect("stale refresh");

    // capacity eviction
    layer.write(&keys::tags(), json!([]), WriteOptions::default());
    layer.write(&keys::popular_tags(), json!([]), WriteOptions::default());

    // retries
    let _ = layer
        .fetch(&keys::article_detail(2), || async {
            Err::<Value, _>(FetchError::from_status(503, "unavailable"))
        })
        .await;

    // warm latency
    let fetcher: Arc<dyn Fetcher> = Arc::new(FnFetcher(|key: QueryKey| async move {
        Ok::<_, FetchError>(json!({"key": key.serialized()}))
    }));
    let engine = WarmingEngine::create(Arc::clone(&layer), fetcher, MemoryStorage::new());
    let report = engine.app_init().await;
    assert!(report.succeeded > 0);
    tokio::time::sleep(Duration::from_millis(10)).await;

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "beekeeper_cache_hit_total",
        "beekeeper_cache_miss_total",
        "beekeeper_cache_stale_total",
        "beekeeper_cache_evict_total",
        "beekeeper_cache_dedup_total",
        "beekeeper_cache_invalidation_total",
        "beekeeper_cache_fetch_retry_total",
        "beekeeper_cache_warm_ms",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
