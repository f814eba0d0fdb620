//! Per-repository commit and pull request extraction.
//!
//! Commits are read from the local git mirror when one is configured, with
//! the commits API as the fallback. Pull requests always come from the API:
//! the list endpoint, walked newest-updated first, plus one detail request per
//! merge commit whose PR the walk did not reach.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::api_cache::{ResourceType, ttl};
use crate::error::{HarvestError, Result};
use crate::github::{
    ApiCommit, ApiPullRequest, GitHubClient, GitHubError, PaginatedFetchConfig, to_commit_record,
    to_pr_record,
};
use crate::mirror::{GitMirror, MirrorError};
use crate::model::{CommitRecord, PrRecord, Repository};
use crate::state::Window;

/// Where a repository's commits were read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitSource {
    Mirror,
    Api,
}

impl std::fmt::Display for CommitSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CommitSource::Mirror => "mirror",
            CommitSource::Api => "api",
        })
    }
}

/// Records extracted from one repository.
#[derive(Debug, Clone)]
pub struct Extraction {
    /// Ordered by `(date, sha)`.
    pub commits: Vec<CommitRecord>,
    /// Ordered by `(created_at, number)`.
    pub prs: Vec<PrRecord>,
    /// Mirror head after the fetch; `None` when commits came from the API.
    pub head_sha: Option<String>,
    pub source: CommitSource,
    /// Why the mirror was abandoned, when it was.
    pub mirror_error: Option<String>,
}

#[derive(Clone)]
pub struct Extractor {
    client: GitHubClient,
    mirror: Option<Arc<GitMirror>>,
}

impl Extractor {
    /// `mirror` is `None` when commits should come from the API only.
    pub fn new(client: GitHubClient, mirror: Option<Arc<GitMirror>>) -> Self {
        Self { client, mirror }
    }

    /// Extract commits and pull requests of `repo` inside `window`.
    ///
    /// `since_sha` is the mirror head recorded by the last committed run; with
    /// it only newer history is read from the mirror.
    #[tracing::instrument(skip(self, repo, window), fields(repo = %repo.full_name))]
    pub async fn extract(
        &self,
        repo: &Repository,
        window: Window,
        since_sha: Option<&str>,
    ) -> Result<Extraction> {
        let mut mirror_error = None;
        let (mut commits, head_sha, source) = match &self.mirror {
            Some(mirror) => match commits_from_mirror(mirror, repo, window, since_sha).await {
                Ok((mut commits, head)) => {
                    self.attach_logins(repo, window, &mut commits).await?;
                    (commits, Some(head), CommitSource::Mirror)
                }
                Err(e) => {
                    let err = HarvestError::from(e);
                    if err.is_skip() {
                        return Err(err);
                    }
                    tracing::warn!(error = %err, "Git mirror failed, reading commits from the API");
                    mirror_error = Some(err.to_string());
                    (self.commits_from_api(repo, window).await?, None, CommitSource::Api)
                }
            },
            None => (self.commits_from_api(repo, window).await?, None, CommitSource::Api),
        };
        commits.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.sha.cmp(&b.sha)));

        let mut prs = self.prs_from_api(repo, window, &commits).await?;
        prs.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.number.cmp(&b.number))
        });

        tracing::debug!(
            commits = commits.len(),
            prs = prs.len(),
            %source,
            "Extracted repository"
        );
        Ok(Extraction {
            commits,
            prs,
            head_sha,
            source,
            mirror_error,
        })
    }

    /// Fill logins of mirror-read commits from the commit list pages.
    ///
    /// Git only knows names and emails; the account GitHub matched them to is
    /// in the list payload, one request per page. The listed values replace
    /// the ones guessed from noreply addresses, so a commit reads the same
    /// from either source. When the listing fails for a reason that does not
    /// stop the run, the guessed values are kept.
    async fn attach_logins(
        &self,
        repo: &Repository,
        window: Window,
        commits: &mut [CommitRecord],
    ) -> Result<()> {
        if commits.is_empty() {
            return Ok(());
        }
        let full = repo.full_name.as_str();
        let config =
            PaginatedFetchConfig::commits(full, &repo.default_branch, window.start, window.end);
        let listed = match self.client.fetch_pages::<ApiCommit>(&config).await {
            Ok(listed) => listed,
            Err(e) => {
                let err = e.for_repo(full);
                if err.is_fatal() || err.is_rate_limited() {
                    return Err(err);
                }
                tracing::warn!(error = %err, "Could not list commits, keeping logins from emails");
                return Ok(());
            }
        };

        let logins: HashMap<String, (Option<String>, Option<String>)> = listed
            .items
            .into_iter()
            .map(|c| {
                (
                    c.sha,
                    (c.author.map(|u| u.login), c.committer.map(|u| u.login)),
                )
            })
            .collect();
        for commit in commits.iter_mut() {
            if let Some((author, committer)) = logins.get(&commit.sha) {
                commit.author_login.clone_from(author);
                commit.committer_login.clone_from(committer);
            }
        }
        Ok(())
    }

    async fn commits_from_api(&self, repo: &Repository, window: Window) -> Result<Vec<CommitRecord>> {
        let full = repo.full_name.as_str();
        let config =
            PaginatedFetchConfig::commits(full, &repo.default_branch, window.start, window.end);
        let listed = self
            .client
            .fetch_pages::<ApiCommit>(&config)
            .await
            .map_err(|e| e.for_repo(full))?;

        let mut commits = Vec::with_capacity(listed.items.len());
        for summary in listed.items {
            let detail = self
                .client
                .fetch_one_cached(
                    ResourceType::CommitDetail,
                    &format!("{full}/{}", summary.sha),
                    &format!("/repos/{full}/commits/{}", summary.sha),
                    |_| ttl::PERMANENT,
                )
                .await;

            // The list payload lacks stats and files; keep it if the detail is unusable.
            let commit = match detail {
                Ok(value) => match serde_json::from_value::<ApiCommit>(value) {
                    Ok(commit) => commit,
                    Err(e) => {
                        tracing::warn!(sha = %summary.sha, error = %e, "Skipping malformed commit detail");
                        summary
                    }
                },
                Err(GitHubError::Malformed { message, .. }) => {
                    tracing::warn!(sha = %summary.sha, error = %message, "Skipping malformed commit detail");
                    summary
                }
                Err(e) => return Err(e.for_repo(full)),
            };

            let record = to_commit_record(&repo.name, commit);
            if window.contains(record.date) {
                commits.push(record);
            }
        }
        Ok(commits)
    }

    async fn prs_from_api(
        &self,
        repo: &Repository,
        window: Window,
        commits: &[CommitRecord],
    ) -> Result<Vec<PrRecord>> {
        let full = repo.full_name.as_str();
        let start = window.start;
        let config = PaginatedFetchConfig::pulls(full)
            .stop_after(move |page: &[Value]| last_updated_before(page, start));
        let listed = self
            .client
            .fetch_pages::<ApiPullRequest>(&config)
            .await
            .map_err(|e| e.for_repo(full))?;

        let mut seen: BTreeSet<u64> = BTreeSet::new();
        let mut prs = Vec::new();
        for pr in listed.items {
            if !seen.insert(pr.number) {
                continue;
            }
            let in_window = window.contains(pr.created_at)
                || pr.merged_at.is_some_and(|t| window.contains(t));
            if in_window {
                prs.push(to_pr_record(&repo.name, pr));
            }
        }

        let referenced: BTreeSet<u64> = commits
            .iter()
            .filter(|c| c.is_merge_commit)
            .filter_map(|c| c.pr_number)
            .filter(|n| !seen.contains(n))
            .collect();
        for number in referenced {
            if let Some(pr) = self.pr_detail(repo, number).await? {
                prs.push(pr);
            }
        }
        Ok(prs)
    }

    /// Detail of a pull request referenced by a merge commit.
    ///
    /// `None` when the number turns out not to be a pull request.
    async fn pr_detail(&self, repo: &Repository, number: u64) -> Result<Option<PrRecord>> {
        let full = repo.full_name.as_str();
        let fetched = self
            .client
            .fetch_one_cached(
                ResourceType::PullDetail,
                &format!("{full}/{number}"),
                &format!("/repos/{full}/pulls/{number}"),
                pull_ttl,
            )
            .await;

        let value = match fetched {
            Ok(value) => value,
            Err(GitHubError::NotFound(_)) => {
                tracing::debug!(number, "Referenced number is not a pull request");
                return Ok(None);
            }
            Err(GitHubError::Malformed { message, .. }) => {
                tracing::warn!(number, error = %message, "Skipping malformed pull request");
                return Ok(None);
            }
            Err(e) => return Err(e.for_repo(full)),
        };

        match serde_json::from_value::<ApiPullRequest>(value) {
            Ok(pr) => Ok(Some(to_pr_record(&repo.name, pr))),
            Err(e) => {
                tracing::warn!(number, error = %e, "Skipping malformed pull request");
                Ok(None)
            }
        }
    }
}

async fn commits_from_mirror(
    mirror: &GitMirror,
    repo: &Repository,
    window: Window,
    since_sha: Option<&str>,
) -> std::result::Result<(Vec<CommitRecord>, String), MirrorError> {
    mirror.ensure_mirror(repo).await?;
    let commits = mirror.commits_in_window(repo, since_sha, window).await?;
    let head = mirror.head_sha(repo).await?;
    Ok((commits, head))
}

/// Closed and merged pull requests are immutable.
fn pull_ttl(value: &Value) -> u64 {
    let merged = value.get("merged_at").is_some_and(|m| !m.is_null());
    let closed = value.get("state").and_then(Value::as_str) == Some("closed");
    if merged || closed {
        ttl::PERMANENT
    } else {
        ttl::OPEN_PULL
    }
}

/// True once the list has walked past pull requests updated inside the window.
fn last_updated_before(page: &[Value], start: DateTime<Utc>) -> bool {
    page.last()
        .and_then(|pr| pr.get("updated_at"))
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .is_some_and(|updated| updated.with_timezone(&Utc) < start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_cache::CacheStore;
    use crate::config::HarvestConfig;
    use crate::error::Unavailable;
    use crate::http::{HttpResponse, MockTransport};
    use serde_json::json;
    use tempfile::TempDir;

    const BASE: &str = "https://api.test";

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn window() -> Window {
        Window {
            start: ts("2025-05-01T00:00:00Z"),
            end: ts("2025-05-08T00:00:00Z"),
        }
    }

    fn repo() -> Repository {
        Repository {
            name: "a".to_string(),
            full_name: "acme/a".to_string(),
            pushed_at: None,
            archived: false,
            disabled: false,
            default_branch: "main".to_string(),
        }
    }

    async fn extractor(mock: &MockTransport) -> (Extractor, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut config = HarvestConfig::with_data_dir("tkn", dir.path());
        config.api_base_url = BASE.to_string();
        config.requests_per_minute = 6000;
        config.per_page = 2;
        let cache = Arc::new(
            CacheStore::open(&config.cache_dir, config.max_cache_bytes)
                .await
                .unwrap(),
        );
        let client = GitHubClient::new(&config, Arc::new(mock.clone()), cache);
        (Extractor::new(client, None), dir)
    }

    fn commits_url(page: u32) -> String {
        format!(
            "{BASE}/repos/acme/a/commits?sha=main&since=2025-05-01T00%3A00%3A00Z&until=2025-05-08T00%3A00%3A00Z&per_page=2&page={page}"
        )
    }

    fn pulls_url(page: u32) -> String {
        format!("{BASE}/repos/acme/a/pulls?state=all&sort=updated&direction=desc&per_page=2&page={page}")
    }

    fn commit(sha: &str, date: &str, message: &str, parents: usize) -> Value {
        let parents: Vec<Value> = (0..parents).map(|i| json!({"sha": format!("p{i}")})).collect();
        json!({
            "sha": sha,
            "commit": {
                "author": {"name": "Ada", "email": "ada@example.com", "date": date},
                "committer": {"name": "Ada", "email": "ada@example.com", "date": date},
                "message": message,
            },
            "author": {"login": "ada"},
            "committer": {"login": "ada"},
            "parents": parents,
        })
    }

    fn with_stats(mut commit: Value, files: &[&str], additions: u64, deletions: u64) -> Value {
        commit["stats"] = json!({"additions": additions, "deletions": deletions});
        commit["files"] = Value::Array(files.iter().map(|f| json!({"filename": f})).collect());
        commit
    }

    fn pull(id: u64, number: u64, created: &str, updated: &str, merged: Option<&str>) -> Value {
        json!({
            "id": id,
            "number": number,
            "title": format!("PR {number}"),
            "body": null,
            "user": {"login": "ada"},
            "state": if merged.is_some() { "closed" } else { "open" },
            "created_at": created,
            "updated_at": updated,
            "merged_at": merged,
        })
    }

    #[tokio::test]
    async fn api_extraction_reads_details_and_orders_records() {
        let mock = MockTransport::new();
        let merge = commit("m1", "2025-05-03T00:00:00Z", "Merge pull request #42 from acme/x", 2);
        let fix = commit("c1", "2025-05-02T00:00:00Z", "Fix (#41)", 1);
        mock.push_response(commits_url(1), HttpResponse::json(&json!([merge.clone(), fix.clone()])));
        mock.push_response(commits_url(2), HttpResponse::json(&json!([])));
        mock.push_response(
            format!("{BASE}/repos/acme/a/commits/m1"),
            HttpResponse::json(&with_stats(merge.clone(), &["a.rs", "b.rs"], 10, 2)),
        );
        mock.push_response(
            format!("{BASE}/repos/acme/a/commits/c1"),
            HttpResponse::json(&with_stats(fix.clone(), &["a.rs"], 1, 1)),
        );

        mock.push_response(
            pulls_url(1),
            HttpResponse::json(&json!([
                pull(1041, 41, "2025-05-01T12:00:00Z", "2025-05-02T00:00:00Z", Some("2025-05-02T00:00:00Z")),
                pull(1030, 30, "2025-03-01T00:00:00Z", "2025-04-01T00:00:00Z", None),
            ])),
        );
        mock.push_response(
            format!("{BASE}/repos/acme/a/pulls/42"),
            HttpResponse::json(&pull(1042, 42, "2025-04-28T00:00:00Z", "2025-05-03T00:00:00Z", Some("2025-05-03T00:00:00Z"))),
        );
        let (extractor, _dir) = extractor(&mock).await;

        let extraction = extractor.extract(&repo(), window(), None).await.unwrap();

        assert_eq!(extraction.source, CommitSource::Api);
        assert_eq!(extraction.head_sha, None);
        let shas: Vec<_> = extraction.commits.iter().map(|c| c.sha.as_str()).collect();
        assert_eq!(shas, ["c1", "m1"]);
        let merge = &extraction.commits[1];
        assert!(merge.is_merge_commit);
        assert_eq!(merge.pr_number, Some(42));
        assert_eq!(merge.files_changed, 2);
        assert_eq!(merge.additions, 10);

        let numbers: Vec<_> = extraction.prs.iter().map(|p| p.number).collect();
        assert_eq!(numbers, [42, 41]);

        // The list walk stopped after the first page.
        assert_eq!(mock.request_count(&pulls_url(2)), 0);
    }

    #[tokio::test]
    async fn referenced_issue_number_is_ignored() {
        let mock = MockTransport::new();
        let merge = commit("m1", "2025-05-03T00:00:00Z", "Merge pull request #7 from acme/x", 2);
        mock.push_response(commits_url(1), HttpResponse::json(&json!([merge.clone()])));
        mock.push_response(
            format!("{BASE}/repos/acme/a/commits/m1"),
            HttpResponse::json(&merge),
        );
        mock.push_response(pulls_url(1), HttpResponse::json(&json!([])));
        mock.push_response(format!("{BASE}/repos/acme/a/pulls/7"), HttpResponse::status(404));
        let (extractor, _dir) = extractor(&mock).await;

        let extraction = extractor.extract(&repo(), window(), None).await.unwrap();
        assert_eq!(extraction.commits.len(), 1);
        assert!(extraction.prs.is_empty());
    }

    #[tokio::test]
    async fn empty_repository_is_unavailable() {
        let mock = MockTransport::new();
        mock.push_response(commits_url(1), HttpResponse::status(409));
        let (extractor, _dir) = extractor(&mock).await;

        let err = extractor.extract(&repo(), window(), None).await.unwrap_err();
        assert!(matches!(
            err,
            HarvestError::RepositoryUnavailable {
                reason: Unavailable::Empty,
                ..
            }
        ));
        assert!(err.is_skip());
    }

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .is_ok_and(|o| o.status.success())
    }

    fn git(dir: &std::path::Path, args: &[&str], email: &str) -> String {
        let date = "2025-05-02T10:00:00Z";
        let out = std::process::Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .env("GIT_AUTHOR_NAME", "Ada")
            .env("GIT_AUTHOR_EMAIL", email)
            .env("GIT_COMMITTER_NAME", "Ada")
            .env("GIT_COMMITTER_EMAIL", email)
            .env("GIT_AUTHOR_DATE", date)
            .env("GIT_COMMITTER_DATE", date)
            .output()
            .unwrap();
        assert!(out.status.success(), "git {args:?}: {}", String::from_utf8_lossy(&out.stderr));
        String::from_utf8_lossy(&out.stdout).trim().to_string()
    }

    /// A remote `acme/a` with one commit inside [`window`]; returns its sha.
    fn local_remote(root: &std::path::Path, email: &str) -> String {
        let work = root.join("work");
        let remote = root.join("remotes/acme/a.git");
        std::fs::create_dir_all(&work).unwrap();
        std::fs::create_dir_all(&remote).unwrap();
        git(&work, &["init", "-q", "-b", "main"], email);
        std::fs::write(work.join("a.txt"), "one\n").unwrap();
        git(&work, &["add", "."], email);
        git(&work, &["commit", "-q", "-m", "Add a"], email);
        git(&remote, &["init", "-q", "--bare", "-b", "main"], email);
        let remote_arg = remote.to_string_lossy().into_owned();
        git(&work, &["push", "-q", &remote_arg, "main"], email);
        git(&work, &["rev-parse", "HEAD"], email)
    }

    async fn mirror_extractor(mock: &MockTransport, root: &std::path::Path) -> Extractor {
        let mut config = HarvestConfig::with_data_dir("", root.join("data"));
        config.api_base_url = BASE.to_string();
        config.git_base_url = format!("file://{}", root.join("remotes").display());
        config.requests_per_minute = 6000;
        config.per_page = 2;
        config.max_retries = 0;
        let cache = Arc::new(
            CacheStore::open(&config.cache_dir, config.max_cache_bytes)
                .await
                .unwrap(),
        );
        let client = GitHubClient::new(&config, Arc::new(mock.clone()), cache);
        Extractor::new(client, Some(Arc::new(GitMirror::new(&config))))
    }

    #[tokio::test]
    async fn mirror_commits_take_logins_from_the_listing() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let head = local_remote(dir.path(), "ada@example.com");

        let mock = MockTransport::new();
        let mut listed = commit(&head, "2025-05-02T10:00:00Z", "Add a", 1);
        listed["author"] = json!({"login": "ada-gh"});
        listed["committer"] = Value::Null;
        mock.push_response(commits_url(1), HttpResponse::json(&json!([listed])));
        mock.push_response(pulls_url(1), HttpResponse::json(&json!([])));
        let extractor = mirror_extractor(&mock, dir.path()).await;

        let extraction = extractor.extract(&repo(), window(), None).await.unwrap();

        assert_eq!(extraction.source, CommitSource::Mirror);
        assert_eq!(extraction.head_sha.as_deref(), Some(head.as_str()));
        assert_eq!(extraction.commits.len(), 1);
        let commit = &extraction.commits[0];
        assert_eq!(commit.author_login.as_deref(), Some("ada-gh"));
        assert_eq!(commit.committer_login, None);
        assert_eq!(commit.additions, 1);
        // Logins come from the list page; no per-commit detail is fetched.
        assert_eq!(mock.request_count(&format!("{BASE}/repos/acme/a/commits/{head}")), 0);
    }

    #[tokio::test]
    async fn failed_listing_keeps_logins_from_noreply_emails() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        local_remote(dir.path(), "77+ada@users.noreply.github.com");

        let mock = MockTransport::new();
        mock.push_response(commits_url(1), HttpResponse::status(500));
        mock.push_response(pulls_url(1), HttpResponse::json(&json!([])));
        let extractor = mirror_extractor(&mock, dir.path()).await;

        let extraction = extractor.extract(&repo(), window(), None).await.unwrap();

        assert_eq!(extraction.source, CommitSource::Mirror);
        assert_eq!(extraction.commits[0].author_login.as_deref(), Some("ada"));
        assert_eq!(extraction.commits[0].committer_login.as_deref(), Some("ada"));
    }

    #[test]
    fn open_pulls_expire_and_closed_ones_do_not() {
        assert_eq!(pull_ttl(&json!({"state": "open", "merged_at": null})), ttl::OPEN_PULL);
        assert_eq!(pull_ttl(&json!({"state": "closed", "merged_at": null})), ttl::PERMANENT);
        assert_eq!(
            pull_ttl(&json!({"state": "closed", "merged_at": "2025-05-01T00:00:00Z"})),
            ttl::PERMANENT
        );
    }

    #[test]
    fn stops_once_the_page_predates_the_window() {
        let start = ts("2025-05-01T00:00:00Z");
        let page = [json!({"updated_at": "2025-05-02T00:00:00Z"}), json!({"updated_at": "2025-04-30T00:00:00Z"})];
        assert!(last_updated_before(&page, start));
        assert!(!last_updated_before(&page[..1], start));
        assert!(!last_updated_before(&[], start));
    }
}
