//! Run configuration.
//!
//! One [`HarvestConfig`] is built by the caller and passed explicitly to every
//! component; nothing here reads the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::rate_limit::DEFAULT_REQUESTS_PER_MINUTE;
use crate::retry::{DEFAULT_BASE_WAIT, DEFAULT_MAX_RETRIES, RetryPolicy};

/// Default size of the per-repository worker pool.
pub const DEFAULT_MAX_WORKERS: usize = 5;

/// Default page size for list endpoints (GitHub's maximum).
pub const DEFAULT_PER_PAGE: u32 = 100;

/// Default cache size budget (512 MiB).
pub const DEFAULT_MAX_CACHE_BYTES: u64 = 512 * 1024 * 1024;

/// Default history depth for a fresh mirror clone.
pub const DEFAULT_MIRROR_DEPTH: u32 = 500;

/// Window used for an incremental run that has no previous run to resume from.
pub const DEFAULT_WINDOW_DAYS: u32 = 7;

/// Number of rate-limited repositories after which a run gives up.
pub const DEFAULT_RATE_LIMIT_ABORT_THRESHOLD: usize = 3;

pub const DEFAULT_API_BASE_URL: &str = "https://api.github.com";
pub const DEFAULT_GIT_BASE_URL: &str = "https://github.com";

/// Everything a run needs to know, resolved up front.
#[derive(Clone)]
pub struct HarvestConfig {
    /// Bearer token for the GitHub API and mirror clones.
    pub token: String,
    pub api_base_url: String,
    /// Base URL clone URLs are built from (`{git_base_url}/{org}/{name}.git`).
    pub git_base_url: String,
    pub cache_dir: PathBuf,
    pub state_file: PathBuf,
    pub mirror_dir: PathBuf,
    pub output_dir: PathBuf,
    pub max_workers: usize,
    pub requests_per_minute: u32,
    pub max_retries: usize,
    pub base_wait: Duration,
    /// Deadline for a single HTTP request.
    pub request_timeout: Duration,
    /// Deadline for a single git invocation.
    pub git_timeout: Duration,
    pub per_page: u32,
    pub max_cache_bytes: u64,
    /// Read commits from local mirrors instead of the commits API.
    pub use_git_mirror: bool,
    pub mirror_depth: u32,
    pub default_window_days: u32,
    pub rate_limit_abort_threshold: usize,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self::with_data_dir(String::new(), "harvester-data")
    }
}

impl HarvestConfig {
    /// Defaults with every storage path placed under `data_dir`.
    pub fn with_data_dir(token: impl Into<String>, data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            token: token.into(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            git_base_url: DEFAULT_GIT_BASE_URL.to_string(),
            cache_dir: data_dir.join("cache"),
            state_file: data_dir.join("state.json"),
            mirror_dir: data_dir.join("mirrors"),
            output_dir: data_dir.join("output"),
            max_workers: DEFAULT_MAX_WORKERS,
            requests_per_minute: DEFAULT_REQUESTS_PER_MINUTE,
            max_retries: DEFAULT_MAX_RETRIES,
            base_wait: DEFAULT_BASE_WAIT,
            request_timeout: Duration::from_secs(30),
            git_timeout: Duration::from_secs(300),
            per_page: DEFAULT_PER_PAGE,
            max_cache_bytes: DEFAULT_MAX_CACHE_BYTES,
            use_git_mirror: true,
            mirror_depth: DEFAULT_MIRROR_DEPTH,
            default_window_days: DEFAULT_WINDOW_DAYS,
            rate_limit_abort_threshold: DEFAULT_RATE_LIMIT_ABORT_THRESHOLD,
        }
    }

    /// The retry policy shared by every retryable call.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.base_wait)
    }

    /// Worker pool size, never zero.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.max_workers.max(1)
    }

    /// Page size clamped to what the API accepts.
    #[must_use]
    pub fn page_size(&self) -> u32 {
        self.per_page.clamp(1, 100)
    }
}

// Hand-written so the token never ends up in logs.
impl std::fmt::Debug for HarvestConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HarvestConfig")
            .field("token", &if self.token.is_empty() { "" } else { "<redacted>" })
            .field("api_base_url", &self.api_base_url)
            .field("git_base_url", &self.git_base_url)
            .field("cache_dir", &self.cache_dir)
            .field("state_file", &self.state_file)
            .field("mirror_dir", &self.mirror_dir)
            .field("output_dir", &self.output_dir)
            .field("max_workers", &self.max_workers)
            .field("requests_per_minute", &self.requests_per_minute)
            .field("max_retries", &self.max_retries)
            .field("base_wait", &self.base_wait)
            .field("request_timeout", &self.request_timeout)
            .field("git_timeout", &self.git_timeout)
            .field("per_page", &self.per_page)
            .field("max_cache_bytes", &self.max_cache_bytes)
            .field("use_git_mirror", &self.use_git_mirror)
            .field("mirror_depth", &self.mirror_depth)
            .field("default_window_days", &self.default_window_days)
            .field(
                "rate_limit_abort_threshold",
                &self.rate_limit_abort_threshold,
            )
            .finish()
    }
}
