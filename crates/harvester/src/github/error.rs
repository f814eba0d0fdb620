//! GitHub API error types.

use std::time::Duration;

use thiserror::Error;

use crate::api_cache::CacheError;
use crate::error::{HarvestError, Unavailable};
use crate::http::{HttpHeaders, header_get};

/// Errors that can occur when talking to the GitHub REST API.
///
/// Variants are derived from the HTTP status and headers only; response text
/// is never inspected.
#[derive(Debug, Error)]
pub enum GitHubError {
    #[error("Rate limited by GitHub (status {status})")]
    RateLimited { status: u16 },

    #[error("Rate limit exceeded after {attempts} attempts")]
    RateLimitExceeded { attempts: usize },

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Authentication failed")]
    Unauthorized,

    #[error("Access forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Repository is empty: {0}")]
    EmptyRepository(String),

    #[error("Resource blocked or disabled: {0}")]
    Blocked(String),

    #[error("GitHub server error (status {status}) for {route}")]
    Server { status: u16, route: String },

    #[error("Unexpected status {status} for {route}")]
    Status { status: u16, route: String },

    #[error("Malformed response from {route}: {message}")]
    Malformed { route: String, message: String },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Check if an error is worth retrying under the shared policy.
pub fn is_retryable(e: &GitHubError) -> bool {
    matches!(
        e,
        GitHubError::RateLimited { .. }
            | GitHubError::Timeout(_)
            | GitHubError::Transport(_)
            | GitHubError::Server { .. }
    )
}

/// A 403 counts as a rate limit only when GitHub says so in its headers.
fn is_rate_limit_403(headers: &HttpHeaders) -> bool {
    header_get(headers, "x-ratelimit-remaining").is_some_and(|v| v.trim() == "0")
        || header_get(headers, "retry-after").is_some()
}

/// Map a non-success status to an error. Returns `None` for 200 and 304.
pub fn classify_status(status: u16, headers: &HttpHeaders, route: &str) -> Option<GitHubError> {
    let err = match status {
        200..=299 | 304 => return None,
        401 => GitHubError::Unauthorized,
        403 if is_rate_limit_403(headers) => GitHubError::RateLimited { status },
        403 => GitHubError::Forbidden(route.to_string()),
        404 => GitHubError::NotFound(route.to_string()),
        409 => GitHubError::EmptyRepository(route.to_string()),
        410 | 451 => GitHubError::Blocked(route.to_string()),
        429 => GitHubError::RateLimited { status },
        500..=599 => GitHubError::Server {
            status,
            route: route.to_string(),
        },
        _ => GitHubError::Status {
            status,
            route: route.to_string(),
        },
    };
    Some(err)
}

impl GitHubError {
    /// Convert into a run-level error for a specific repository.
    ///
    /// Not-found, empty, disabled, and forbidden become skips.
    pub fn for_repo(self, repo: &str) -> HarvestError {
        let reason = match &self {
            GitHubError::NotFound(_) => Unavailable::NotFound,
            GitHubError::EmptyRepository(_) => Unavailable::Empty,
            GitHubError::Blocked(_) => Unavailable::Disabled,
            GitHubError::Forbidden(_) => Unavailable::Forbidden,
            _ => return self.into(),
        };
        HarvestError::unavailable(repo, reason)
    }
}

impl From<GitHubError> for HarvestError {
    fn from(e: GitHubError) -> Self {
        match e {
            GitHubError::Unauthorized => HarvestError::Authentication {
                message: e.to_string(),
            },
            GitHubError::RateLimitExceeded { attempts } => {
                HarvestError::RateLimitExceeded { attempts }
            }
            GitHubError::Malformed { .. } => HarvestError::malformed(e.to_string()),
            GitHubError::Cache(inner) => inner.into(),
            GitHubError::Timeout(_) | GitHubError::Transport(_) => HarvestError::Network {
                message: e.to_string(),
            },
            other => HarvestError::Api {
                message: other.to_string(),
            },
        }
    }
}
