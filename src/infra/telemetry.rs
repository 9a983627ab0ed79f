use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "beekeeper_cache_hit_total",
            Unit::Count,
            "Total number of fresh cache hits."
        );
        describe_counter!(
            "beekeeper_cache_miss_total",
            Unit::Count,
            "Total number of cache misses that went to the network."
        );
        describe_counter!(
            "beekeeper_cache_stale_total",
            Unit::Count,
            "Total number of stale hits served while revalidating."
        );
        describe_counter!(
            "beekeeper_cache_evict_total",
            Unit::Count,
            "Total number of entries evicted due to capacity."
        );
        describe_counter!(
            "beekeeper_cache_dedup_total",
            Unit::Count,
            "Total number of requests served by an in-flight or settled fetch."
        );
        describe_counter!(
            "beekeeper_cache_invalidation_total",
            Unit::Count,
            "Total number of prefix invalidations executed."
        );
        describe_counter!(
            "beekeeper_cache_fetch_retry_total",
            Unit::Count,
            "Total number of fetch retries after network or server errors."
        );
        describe_histogram!(
            "beekeeper_cache_warm_ms",
            Unit::Milliseconds,
            "Prefetch latency in milliseconds, labelled by strategy."
        );
    });
}
