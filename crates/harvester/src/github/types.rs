//! GitHub REST API payloads.
//!
//! Only the fields the extractor reads are modelled; everything else in the
//! response is ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An entry of `GET /orgs/{org}/repos`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiRepository {
    pub name: String,
    pub full_name: String,
    #[serde(default)]
    pub pushed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub disabled: bool,
    /// Missing on some empty repositories.
    #[serde(default)]
    pub default_branch: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiUser {
    pub login: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiGitIdentity {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiCommitBody {
    pub author: ApiGitIdentity,
    pub committer: ApiGitIdentity,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiParent {
    pub sha: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ApiCommitStats {
    #[serde(default)]
    pub additions: u64,
    #[serde(default)]
    pub deletions: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiCommitFile {
    pub filename: String,
}

/// An entry of `GET /repos/{full}/commits`, or the full `GET
/// /repos/{full}/commits/{sha}` response (which adds `stats` and `files`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiCommit {
    pub sha: String,
    pub commit: ApiCommitBody,
    /// GitHub account matched to the author email, if any.
    #[serde(default)]
    pub author: Option<ApiUser>,
    #[serde(default)]
    pub committer: Option<ApiUser>,
    #[serde(default)]
    pub parents: Vec<ApiParent>,
    #[serde(default)]
    pub stats: Option<ApiCommitStats>,
    #[serde(default)]
    pub files: Option<Vec<ApiCommitFile>>,
}

/// An entry of `GET /repos/{full}/pulls`, or a single pull request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiPullRequest {
    pub id: u64,
    pub number: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub user: Option<ApiUser>,
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub merged_at: Option<DateTime<Utc>>,
}
