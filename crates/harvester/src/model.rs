//! Domain records produced by extraction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A repository in the organization being harvested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,
    /// `{org}/{name}`.
    pub full_name: String,
    pub pushed_at: Option<DateTime<Utc>>,
    pub archived: bool,
    pub disabled: bool,
    pub default_branch: String,
}

impl Repository {
    /// Whether the repository should be extracted by default.
    #[inline]
    pub fn is_active(&self) -> bool {
        !self.archived && !self.disabled
    }

    /// The owning organization, taken from `full_name`.
    pub fn owner(&self) -> &str {
        self.full_name
            .split_once('/')
            .map_or(self.full_name.as_str(), |(owner, _)| owner)
    }
}

/// One commit on a repository's default branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    /// Repository name (without the organization).
    pub repo: String,
    pub sha: String,
    pub author_login: Option<String>,
    pub author_email: String,
    pub author_name: String,
    pub committer_login: Option<String>,
    /// Committer date, used for window membership.
    pub date: DateTime<Utc>,
    pub message: String,
    pub is_merge_commit: bool,
    pub pr_number: Option<u64>,
    pub files_changed: u32,
    pub additions: u64,
    pub deletions: u64,
    /// `Name <email>` for every `Co-authored-by:` trailer.
    pub co_authors: Vec<String>,
}

/// Pull request state as exported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrState {
    Open,
    Closed,
    Merged,
}

impl PrState {
    /// Derive the exported state from the API `state` field and merge time.
    pub fn from_api(state: &str, merged_at: Option<DateTime<Utc>>) -> Self {
        if merged_at.is_some() {
            PrState::Merged
        } else if state.eq_ignore_ascii_case("open") {
            PrState::Open
        } else {
            PrState::Closed
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PrState::Open => "open",
            PrState::Closed => "closed",
            PrState::Merged => "merged",
        }
    }

    /// Closed and merged pull requests no longer change.
    #[inline]
    pub fn is_final(self) -> bool {
        !matches!(self, PrState::Open)
    }
}

impl std::fmt::Display for PrState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrRecord {
    /// Repository name (without the organization).
    pub repo: String,
    /// GitHub's global pull request id.
    pub id: u64,
    pub number: u64,
    pub title: String,
    pub body: String,
    pub author_login: Option<String>,
    pub created_at: DateTime<Utc>,
    pub merged_at: Option<DateTime<Utc>>,
    pub state: PrState,
}

impl PrRecord {
    /// Key recorded in the processed-id set.
    pub fn dedup_key(&self) -> String {
        self.id.to_string()
    }
}
