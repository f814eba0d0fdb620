//! CSV export of a run's novel records.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::fsutil::write_atomic;
use crate::model::{CommitRecord, PrRecord};

pub const COMMITS_FILE: &str = "commits.csv";
pub const PULL_REQUESTS_FILE: &str = "pull_requests.csv";

const CO_AUTHOR_SEPARATOR: &str = "; ";

const COMMIT_COLUMNS: [&str; 14] = [
    "repo",
    "sha",
    "author_login",
    "author_email",
    "author_name",
    "committer_login",
    "date",
    "message",
    "is_merge_commit",
    "pr_number",
    "files_changed",
    "additions",
    "deletions",
    "co_authors",
];

const PR_COLUMNS: [&str; 9] = [
    "repo",
    "id",
    "number",
    "title",
    "body",
    "author_login",
    "created_at",
    "merged_at",
    "state",
];

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("failed to encode CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Files produced by [`write_outputs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFiles {
    pub commits: PathBuf,
    pub pull_requests: PathBuf,
}

/// Order commits by `(date, repo, sha)`.
pub fn sort_commits(commits: &mut [CommitRecord]) {
    commits.sort_by(|a, b| {
        a.date
            .cmp(&b.date)
            .then_with(|| a.repo.cmp(&b.repo))
            .then_with(|| a.sha.cmp(&b.sha))
    });
}

/// Order pull requests by `(created_at, repo, number)`.
pub fn sort_prs(prs: &mut [PrRecord]) {
    prs.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.repo.cmp(&b.repo))
            .then_with(|| a.number.cmp(&b.number))
    });
}

#[derive(Serialize)]
struct CommitRow<'a> {
    repo: &'a str,
    sha: &'a str,
    author_login: &'a str,
    author_email: &'a str,
    author_name: &'a str,
    committer_login: &'a str,
    date: String,
    message: &'a str,
    is_merge_commit: bool,
    pr_number: Option<u64>,
    files_changed: u32,
    additions: u64,
    deletions: u64,
    co_authors: String,
}

impl<'a> From<&'a CommitRecord> for CommitRow<'a> {
    fn from(c: &'a CommitRecord) -> Self {
        Self {
            repo: &c.repo,
            sha: &c.sha,
            author_login: c.author_login.as_deref().unwrap_or_default(),
            author_email: &c.author_email,
            author_name: &c.author_name,
            committer_login: c.committer_login.as_deref().unwrap_or_default(),
            date: timestamp(c.date),
            message: &c.message,
            is_merge_commit: c.is_merge_commit,
            pr_number: c.pr_number,
            files_changed: c.files_changed,
            additions: c.additions,
            deletions: c.deletions,
            co_authors: c.co_authors.join(CO_AUTHOR_SEPARATOR),
        }
    }
}

#[derive(Serialize)]
struct PrRow<'a> {
    repo: &'a str,
    id: u64,
    number: u64,
    title: &'a str,
    body: &'a str,
    author_login: &'a str,
    created_at: String,
    merged_at: Option<String>,
    state: &'static str,
}

impl<'a> From<&'a PrRecord> for PrRow<'a> {
    fn from(p: &'a PrRecord) -> Self {
        Self {
            repo: &p.repo,
            id: p.id,
            number: p.number,
            title: &p.title,
            body: &p.body,
            author_login: p.author_login.as_deref().unwrap_or_default(),
            created_at: timestamp(p.created_at),
            merged_at: p.merged_at.map(timestamp),
            state: p.state.as_str(),
        }
    }
}

fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Header first, so a run without records still yields a well-formed file.
fn encode<'a, T, R>(columns: &[&str], records: &'a [T]) -> Result<Vec<u8>, OutputError>
where
    R: Serialize + From<&'a T>,
{
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(columns)?;
    for record in records {
        writer.serialize(R::from(record))?;
    }
    writer
        .into_inner()
        .map_err(|e| OutputError::Csv(e.into_error().into()))
}

/// Write `commits.csv` and `pull_requests.csv` into `dir`.
///
/// Records are written in the order given. Each file is replaced atomically.
pub async fn write_outputs(
    dir: &Path,
    commits: &[CommitRecord],
    prs: &[PrRecord],
) -> Result<OutputFiles, OutputError> {
    let files = OutputFiles {
        commits: dir.join(COMMITS_FILE),
        pull_requests: dir.join(PULL_REQUESTS_FILE),
    };

    let commit_bytes = encode::<_, CommitRow>(&COMMIT_COLUMNS, commits)?;
    let pr_bytes = encode::<_, PrRow>(&PR_COLUMNS, prs)?;

    for (path, bytes) in [(&files.commits, commit_bytes), (&files.pull_requests, pr_bytes)] {
        write_atomic(path, &bytes)
            .await
            .map_err(|source| OutputError::Write {
                path: path.clone(),
                source,
            })?;
    }

    tracing::info!(
        dir = %dir.display(),
        commits = commits.len(),
        prs = prs.len(),
        "Wrote output files"
    );
    Ok(files)
}
