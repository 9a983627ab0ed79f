//! Fetch error taxonomy and retry policy.
//!
//! Network and 5xx failures are retried with exponential backoff plus jitter;
//! 4xx failures are terminal on the first attempt.

use std::future::Future;

use metrics::counter;
use thiserror::Error;
use tokio::time::{Duration, sleep};
use tracing::{debug, warn};

use super::keys::QueryKey;

const METRIC_FETCH_RETRY_TOTAL: &str = "beekeeper_cache_fetch_retry_total";

/// Failure of an underlying fetch.
///
/// `Clone` because one settled result fans out to every deduplicated caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// No response reached the server.
    #[error("network error: {0}")]
    Network(String),
    /// 5xx response.
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },
    /// 4xx response.
    #[error("client error {status}: {message}")]
    Client { status: u16, message: String },
    /// Successful response whose body could not be decoded.
    #[error("undecodable response body (status {status}): {message}")]
    Decode { status: u16, message: String },
}

impl FetchError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    /// Classify an HTTP status. Anything below 500 that is an error is a client error.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if status >= 500 {
            Self::Server { status, message }
        } else {
            Self::Client { status, message }
        }
    }

    pub fn decode(status: u16, message: impl Into<String>) -> Self {
        Self::Decode {
            status,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Client { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Network(_) => None,
            Self::Server { status, .. }
            | Self::Client { status, .. }
            | Self::Decode { status, .. } => Some(*status),
        }
    }
}

/// Exponential backoff with bounded jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of random jitter as a fraction of the backoff (0.1 = 10%).
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            jitter_ratio: 0.1,
        }
    }
}

impl RetryPolicy {
    /// `min(base * 2^attempt, max)` without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Backoff plus up to `jitter_ratio` of random extra delay.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let backoff = self.backoff(attempt);
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        backoff + backoff.mul_f64(rand::random::<f64>() * ratio)
    }

    /// Run `fetch_fn` until it succeeds, fails terminally, or retries run out.
    pub async fn run<T, F, Fut>(&self, key: &QueryKey, fetch_fn: F) -> Result<T, FetchError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut attempt = 0;
        loop {
            match fetch_fn().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => {
                    debug!(%key, error = %err, "fetch failed with client error; not retrying");
                    return Err(err);
                }
                Err(err) if attempt >= self.max_retries => {
                    warn!(%key, error = %err, attempts = attempt + 1, "fetch failed; retries exhausted");
                    return Err(err);
                }
                Err(err) => {
                    let delay = self.delay_for(attempt);
                    debug!(
                        %key,
                        error = %err,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "fetch failed; retrying"
                    );
                    counter!(METRIC_FETCH_RETRY_TOTAL).increment(1);
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
