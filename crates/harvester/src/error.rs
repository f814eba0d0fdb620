use thiserror::Error;

use crate::api_cache::CacheError;
use crate::mirror::MirrorError;
use crate::output::OutputError;
use crate::state::StateError;

/// Why a repository could not be extracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unavailable {
    NotFound,
    Empty,
    Disabled,
    Forbidden,
}

impl std::fmt::Display for Unavailable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Unavailable::NotFound => "not found",
            Unavailable::Empty => "empty repository",
            Unavailable::Disabled => "disabled",
            Unavailable::Forbidden => "access forbidden",
        })
    }
}

/// Errors surfaced by an extraction run.
#[derive(Debug, Error)]
pub enum HarvestError {
    /// Invalid or expired token.
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    /// Backoff retries exhausted on rate-limit responses.
    #[error("Rate limit exceeded after {attempts} attempts")]
    RateLimitExceeded { attempts: usize },

    /// Repository not found, empty, or disabled.
    #[error("Repository {repo} unavailable: {reason}")]
    RepositoryUnavailable { repo: String, reason: Unavailable },

    /// The organization itself does not exist or is not visible.
    #[error("Organization not found: {0}")]
    OrganizationNotFound(String),

    /// Unparsable API response.
    #[error("Malformed response: {message}")]
    MalformedResponse { message: String },

    /// Cache, state, or output write failure.
    #[error("Storage failure: {message}")]
    Storage { message: String },

    /// Timeout or connection failure that outlasted the retry policy.
    #[error("Network error: {message}")]
    Network { message: String },

    /// Unexpected API status.
    #[error("API error: {message}")]
    Api { message: String },

    /// Local git mirror failure.
    #[error("Git error: {message}")]
    Git { message: String },

    /// The run was cancelled before completion.
    #[error("Run cancelled")]
    Cancelled,
}

impl HarvestError {
    #[inline]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    #[inline]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedResponse {
            message: message.into(),
        }
    }

    #[inline]
    pub fn unavailable(repo: impl Into<String>, reason: Unavailable) -> Self {
        Self::RepositoryUnavailable {
            repo: repo.into(),
            reason,
        }
    }

    /// Whether this error aborts the whole run.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Authentication { .. }
                | Self::Storage { .. }
                | Self::OrganizationNotFound(_)
                | Self::Cancelled
        )
    }

    /// Whether this error means the repository should be skipped rather than failed.
    #[inline]
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::RepositoryUnavailable { .. })
    }

    #[inline]
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimitExceeded { .. })
    }
}

impl From<CacheError> for HarvestError {
    fn from(e: CacheError) -> Self {
        Self::storage(e.to_string())
    }
}

impl From<StateError> for HarvestError {
    fn from(e: StateError) -> Self {
        Self::storage(e.to_string())
    }
}

impl From<OutputError> for HarvestError {
    fn from(e: OutputError) -> Self {
        Self::storage(e.to_string())
    }
}

impl From<MirrorError> for HarvestError {
    fn from(e: MirrorError) -> Self {
        match e {
            MirrorError::EmptyRepository(repo) => Self::unavailable(repo, Unavailable::Empty),
            MirrorError::Io { .. } => Self::storage(e.to_string()),
            other => Self::Git {
                message: other.to_string(),
            },
        }
    }
}

/// Extract a short error message suitable for display.
///
/// Takes the first line of an error message, which is useful for errors that
/// include stderr output or multi-line details.
#[inline]
pub fn short_error_message(e: &impl std::error::Error) -> String {
    let full = e.to_string();
    full.lines().next().unwrap_or(&full).to_string()
}

/// Result type for harvester operations.
pub type Result<T> = std::result::Result<T, HarvestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification_matches_taxonomy() {
        assert!(
            HarvestError::Authentication {
                message: "bad token".into()
            }
            .is_fatal()
        );
        assert!(HarvestError::storage("disk full").is_fatal());
        assert!(HarvestError::Cancelled.is_fatal());
        assert!(HarvestError::OrganizationNotFound("acme".into()).is_fatal());

        assert!(!HarvestError::RateLimitExceeded { attempts: 6 }.is_fatal());
        assert!(!HarvestError::unavailable("acme/a", Unavailable::Empty).is_fatal());
        assert!(!HarvestError::malformed("bad json").is_fatal());
    }

    #[test]
    fn unavailable_is_a_skip() {
        let err = HarvestError::unavailable("acme/a", Unavailable::Disabled);
        assert!(err.is_skip());
        assert_eq!(err.to_string(), "Repository acme/a unavailable: disabled");
        assert!(!HarvestError::Cancelled.is_skip());
    }

    #[test]
    fn cache_errors_become_storage_failures() {
        let err: HarvestError = CacheError::Io {
            path: "/tmp/x".into(),
            source: std::io::Error::other("disk full"),
        }
        .into();
        assert!(matches!(err, HarvestError::Storage { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn empty_mirror_becomes_skip() {
        let err: HarvestError = MirrorError::EmptyRepository("acme/a".into()).into();
        assert!(err.is_skip());
    }

    #[test]
    fn short_error_message_takes_first_line() {
        let err = HarvestError::Git {
            message: "clone failed\nfatal: details".into(),
        };
        assert_eq!(short_error_message(&err), "Git error: clone failed");
    }
}
