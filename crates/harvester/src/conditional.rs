//! Types for conditional HTTP fetching with ETag revalidation.
//!
//! When a cached entry has gone stale but still carries an ETag, the client
//! sends `If-None-Match` and may get `304 Not Modified` back, in which case the
//! cached payload is reused and only its timestamp is refreshed.

use std::sync::atomic::{AtomicU64, Ordering};

/// Result of a single GET that may have been conditional.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchResult<T> {
    /// Server returned 304; the cached data is still valid.
    NotModified,
    /// Server returned new data with an optional ETag for future revalidation.
    Fetched { data: T, etag: Option<String> },
}

impl<T> FetchResult<T> {
    #[inline]
    pub fn is_not_modified(&self) -> bool {
        matches!(self, FetchResult::NotModified)
    }

    pub fn into_data(self) -> Option<T> {
        match self {
            FetchResult::NotModified => None,
            FetchResult::Fetched { data, .. } => Some(data),
        }
    }

    pub fn etag(&self) -> Option<&str> {
        match self {
            FetchResult::NotModified => None,
            FetchResult::Fetched { etag, .. } => etag.as_deref(),
        }
    }
}

/// Cache effectiveness over a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Served from a fresh cache entry without a request.
    pub hits: u64,
    /// Stale entries confirmed unchanged by a 304.
    pub revalidated: u64,
    /// Responses downloaded with a 200.
    pub fetched: u64,
}

impl CacheStats {
    /// Requests actually sent to the API.
    #[inline]
    pub fn requests(&self) -> u64 {
        self.revalidated + self.fetched
    }

    /// True when nothing had to be downloaded.
    #[inline]
    pub fn all_cached(&self) -> bool {
        self.fetched == 0 && (self.hits > 0 || self.revalidated > 0)
    }

    /// Share of lookups that avoided a full download (0.0 to 1.0).
    ///
    /// Returns 0.0 if nothing was looked up.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.revalidated + self.fetched;
        if total == 0 {
            0.0
        } else {
            (self.hits + self.revalidated) as f64 / total as f64
        }
    }
}

/// Thread-safe counters behind [`CacheStats`], shared by client clones.
#[derive(Debug, Default)]
pub struct CacheCounters {
    hits: AtomicU64,
    revalidated: AtomicU64,
    fetched: AtomicU64,
}

impl CacheCounters {
    #[inline]
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_revalidated(&self) {
        self.revalidated.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_fetched(&self) {
        self.fetched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            revalidated: self.revalidated.load(Ordering::Relaxed),
            fetched: self.fetched.load(Ordering::Relaxed),
        }
    }
}
