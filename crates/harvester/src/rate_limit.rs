use std::num::NonZeroU32;
use std::sync::Arc;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

type GovernorRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Default request ceiling per minute across all workers.
pub const DEFAULT_REQUESTS_PER_MINUTE: u32 = 60;

/// A process-wide API rate limiter.
///
/// Clones share the same underlying governor state, so handing a clone to
/// every worker enforces one global ceiling.
///
/// ```ignore
/// let limiter = ApiRateLimiter::per_minute(60);
///
/// // Before each API call:
/// limiter.wait().await;
/// ```
#[derive(Clone)]
pub struct ApiRateLimiter {
    inner: Arc<GovernorRateLimiter>,
    per_minute: NonZeroU32,
}

impl ApiRateLimiter {
    /// Create a limiter allowing `requests_per_minute` requests (minimum 1).
    pub fn per_minute(requests_per_minute: u32) -> Self {
        let rpm = NonZeroU32::new(requests_per_minute).unwrap_or(NonZeroU32::MIN);
        Self {
            inner: Arc::new(RateLimiter::direct(Quota::per_minute(rpm))),
            per_minute: rpm,
        }
    }

    /// Configured ceiling in requests per minute.
    pub fn requests_per_minute(&self) -> u32 {
        self.per_minute.get()
    }

    /// Wait until the limiter admits another request.
    pub async fn wait(&self) {
        self.inner.until_ready().await;
    }

    /// Admit a request without waiting, if capacity is available.
    pub fn try_acquire(&self) -> bool {
        self.inner.check().is_ok()
    }
}

impl std::fmt::Debug for ApiRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiRateLimiter")
            .field("per_minute", &self.per_minute)
            .finish()
    }
}
