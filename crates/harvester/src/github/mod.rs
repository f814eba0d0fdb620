//! GitHub REST API access.
//!
//! # Module Structure
//!
//! - [`error`] - Status classification and error types
//! - [`types`] - Response payloads
//! - [`client`] - Rate-limited, cache-aware client
//! - [`pagination`] - Page walking over list endpoints
//! - [`convert`] - Payload to record conversion

mod client;
mod convert;
mod error;
mod pagination;
mod types;

pub use client::{API_VERSION, FetchOne, GitHubClient, Page};
pub use convert::{FALLBACK_BRANCH, to_commit_record, to_pr_record, to_repository};
pub use error::{GitHubError, classify_status, is_retryable};
pub use pagination::{PaginatedFetchConfig, PaginatedFetchResult};
pub use types::{
    ApiCommit, ApiCommitBody, ApiCommitFile, ApiCommitStats, ApiGitIdentity, ApiParent,
    ApiPullRequest, ApiRepository, ApiUser,
};
