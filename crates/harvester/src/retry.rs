//! Retry policy shared by every retryable API call.
//!
//! Waits grow as `base_wait * 2^i` for retry `i` (0-based). There is no jitter:
//! the schedule is exact so runs are reproducible under a paused clock.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: usize = 5;

/// Default wait before the first retry.
pub const DEFAULT_BASE_WAIT: Duration = Duration::from_secs(2);

/// Exponential backoff configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt.
    pub max_retries: usize,
    /// Wait before the first retry; doubled for each one after.
    pub base_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_wait: DEFAULT_BASE_WAIT,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_retries: usize, base_wait: Duration) -> Self {
        Self {
            max_retries,
            base_wait,
        }
    }

    /// Wait before retry number `retry` (0-based).
    #[must_use]
    pub fn wait_for(&self, retry: u32) -> Duration {
        self.base_wait.saturating_mul(2u32.saturating_pow(retry))
    }

    /// Total attempts including the first one.
    #[must_use]
    pub fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }

    /// Build the backon strategy for this policy.
    #[must_use]
    pub fn into_backoff(self) -> ExponentialBuilder {
        let ceiling = self.wait_for(u32::try_from(self.max_retries).unwrap_or(u32::MAX));
        ExponentialBuilder::default()
            .with_min_delay(self.base_wait)
            .with_factor(2.0)
            .with_max_delay(ceiling)
            .with_max_times(self.max_retries)
    }
}

/// Run `operation`, retrying errors accepted by `is_retryable` under `policy`.
///
/// Each retry is logged with the attempt number and the wait before it.
/// Errors not accepted by `is_retryable` are returned immediately.
pub async fn with_retry<T, E, F, Fut, IsRetryable>(
    policy: RetryPolicy,
    mut operation: F,
    is_retryable: IsRetryable,
    route: &str,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
    IsRetryable: Fn(&E) -> bool + Send + Sync + 'static,
{
    let attempt = AtomicU32::new(0);

    let retry_op = || {
        attempt.fetch_add(1, Ordering::SeqCst);
        operation()
    };

    retry_op
        .retry(policy.into_backoff())
        .when(is_retryable)
        .notify(|err, dur| {
            tracing::warn!(
                route = %route,
                attempt = attempt.load(Ordering::SeqCst),
                wait_ms = dur.as_millis() as u64,
                error = %crate::error::short_error_message(err),
                "Retrying request"
            );
        })
        .await
}
