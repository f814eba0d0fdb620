//! Conversion from GitHub API payloads to harvester records.

use crate::message;
use crate::model::{CommitRecord, PrRecord, PrState, Repository};

use super::types::{ApiCommit, ApiPullRequest, ApiRepository};

/// Branch assumed when the API omits `default_branch`.
pub const FALLBACK_BRANCH: &str = "main";

pub fn to_repository(repo: ApiRepository) -> Repository {
    Repository {
        name: repo.name,
        full_name: repo.full_name,
        pushed_at: repo.pushed_at,
        archived: repo.archived,
        disabled: repo.disabled,
        default_branch: repo
            .default_branch
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| FALLBACK_BRANCH.to_string()),
    }
}

/// Convert a commit payload. Diff stats are zero unless the payload is a
/// commit detail response.
pub fn to_commit_record(repo: &str, commit: ApiCommit) -> CommitRecord {
    let stats = commit.stats.unwrap_or_default();
    let files_changed = commit
        .files
        .as_ref()
        .map_or(0, |files| u32::try_from(files.len()).unwrap_or(u32::MAX));
    let text = commit.commit.message;

    CommitRecord {
        repo: repo.to_string(),
        sha: commit.sha,
        author_login: commit.author.map(|u| u.login),
        author_email: commit.commit.author.email,
        author_name: commit.commit.author.name,
        committer_login: commit.committer.map(|u| u.login),
        date: commit.commit.committer.date,
        is_merge_commit: commit.parents.len() > 1,
        pr_number: message::pr_number(&text),
        files_changed,
        additions: stats.additions,
        deletions: stats.deletions,
        co_authors: message::co_authors(&text),
        message: text,
    }
}

pub fn to_pr_record(repo: &str, pr: ApiPullRequest) -> PrRecord {
    PrRecord {
        repo: repo.to_string(),
        id: pr.id,
        number: pr.number,
        title: pr.title,
        body: pr.body.unwrap_or_default(),
        author_login: pr.user.map(|u| u.login),
        created_at: pr.created_at,
        merged_at: pr.merged_at,
        state: PrState::from_api(&pr.state, pr.merged_at),
    }
}
