//! End-to-end runs against an in-memory GitHub.
//!
//! The fake answers the REST routes the harvester uses from a small data set,
//! paginating, filtering commits by `since`/`until` and honouring ETags, so the
//! full run (enumeration, extraction, dedup, CSV output and state commit) is
//! exercised without a network.

use std::collections::{BTreeSet, HashMap};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use harvester::http::{HttpError, HttpRequest, HttpResponse, HttpTransport};
use harvester::{HarvestConfig, HarvestError, Harvester, RunMode, RunOptions};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::watch;
use url::Url;

/// Upper bound for any single run; exceeding it means the run hung.
const RUN_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Clone)]
struct FakeCommit {
    sha: String,
    date: DateTime<Utc>,
    message: String,
    parents: usize,
}

#[derive(Clone)]
struct FakePull {
    id: u64,
    number: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    merged_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
struct FakeRepo {
    name: String,
    pushed_at: DateTime<Utc>,
    archived: bool,
    empty: bool,
    commits: Vec<FakeCommit>,
    pulls: Vec<FakePull>,
}

impl FakeRepo {
    fn new(name: &str, pushed_at: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            pushed_at,
            archived: false,
            empty: false,
            commits: Vec::new(),
            pulls: Vec::new(),
        }
    }

    fn commit(mut self, sha: &str, date: DateTime<Utc>, message: &str, parents: usize) -> Self {
        self.commits.push(FakeCommit {
            sha: sha.to_string(),
            date,
            message: message.to_string(),
            parents,
        });
        self
    }

    fn pull(
        mut self,
        id: u64,
        number: u64,
        created_at: DateTime<Utc>,
        merged_at: Option<DateTime<Utc>>,
    ) -> Self {
        self.pulls.push(FakePull {
            id,
            number,
            created_at,
            updated_at: merged_at.unwrap_or(created_at),
            merged_at,
        });
        self
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CommitsBehavior {
    Normal,
    /// Never answer commit listings.
    Stall,
    /// Answer commit listings with 429.
    RateLimit,
}

struct FakeGitHub {
    org: String,
    repos: Vec<FakeRepo>,
    commits_behavior: CommitsBehavior,
    requests: AtomicUsize,
    not_modified: AtomicUsize,
}

impl FakeGitHub {
    fn new(org: &str, repos: Vec<FakeRepo>) -> Self {
        Self {
            org: org.to_string(),
            repos,
            commits_behavior: CommitsBehavior::Normal,
            requests: AtomicUsize::new(0),
            not_modified: AtomicUsize::new(0),
        }
    }

    fn with_commits(mut self, behavior: CommitsBehavior) -> Self {
        self.commits_behavior = behavior;
        self
    }

    fn repo(&self, name: &str) -> Option<&FakeRepo> {
        self.repos.iter().find(|r| r.name == name)
    }

    fn repo_json(&self, repo: &FakeRepo) -> Value {
        json!({
            "name": repo.name,
            "full_name": format!("{}/{}", self.org, repo.name),
            "pushed_at": ts(repo.pushed_at),
            "archived": repo.archived,
            "disabled": false,
            "default_branch": "main",
        })
    }

    fn commit_json(commit: &FakeCommit, detail: bool) -> Value {
        let parents: Vec<Value> = (0..commit.parents)
            .map(|i| json!({"sha": format!("{}-parent{i}", commit.sha)}))
            .collect();
        let identity = json!({
            "name": "Ada Lovelace",
            "email": "ada@example.com",
            "date": ts(commit.date),
        });
        let mut value = json!({
            "sha": commit.sha,
            "commit": {
                "author": identity,
                "committer": identity,
                "message": commit.message,
            },
            "author": {"login": "ada"},
            "committer": {"login": "web-flow"},
            "parents": parents,
        });
        if detail {
            value["stats"] = json!({"additions": 5, "deletions": 1});
            value["files"] = json!([{"filename": "src/lib.rs"}, {"filename": "README.md"}]);
        }
        value
    }

    fn pull_json(pull: &FakePull) -> Value {
        json!({
            "id": pull.id,
            "number": pull.number,
            "title": format!("Change {}", pull.number),
            "body": "Details",
            "user": {"login": "ada"},
            "state": if pull.merged_at.is_some() { "closed" } else { "open" },
            "created_at": ts(pull.created_at),
            "updated_at": ts(pull.updated_at),
            "merged_at": pull.merged_at.map(ts),
        })
    }

    fn respond(&self, request: &HttpRequest, body: Value) -> HttpResponse {
        let mut hasher = DefaultHasher::new();
        body.to_string().hash(&mut hasher);
        let etag = format!("\"{:x}\"", hasher.finish());
        if request.header_value("if-none-match") == Some(etag.as_str()) {
            self.not_modified.fetch_add(1, Ordering::SeqCst);
            return HttpResponse::status(304).with_header("etag", etag);
        }
        HttpResponse::json(&body).with_header("etag", etag)
    }
}

fn paginate(items: Vec<Value>, query: &HashMap<String, String>) -> Value {
    let per_page: usize = query
        .get("per_page")
        .and_then(|v| v.parse().ok())
        .unwrap_or(30);
    let page: usize = query.get("page").and_then(|v| v.parse().ok()).unwrap_or(1);
    Value::Array(
        items
            .into_iter()
            .skip((page - 1) * per_page)
            .take(per_page)
            .collect(),
    )
}

fn parse_time(query: &HashMap<String, String>, key: &str) -> Option<DateTime<Utc>> {
    query
        .get(key)
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}

#[async_trait]
impl HttpTransport for FakeGitHub {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let url = Url::parse(&request.url).map_err(|e| HttpError::Transport(e.to_string()))?;
        let segments: Vec<String> = url
            .path_segments()
            .map(|s| s.map(String::from).collect())
            .unwrap_or_default();
        let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
        let query: HashMap<String, String> = url.query_pairs().into_owned().collect();

        let response = match segments.as_slice() {
            ["orgs", org, "repos"] if *org == self.org => {
                let repos = self.repos.iter().map(|r| self.repo_json(r)).collect();
                self.respond(&request, paginate(repos, &query))
            }
            ["repos", _, name, "commits"] => {
                let Some(repo) = self.repo(name) else {
                    return Ok(HttpResponse::status(404));
                };
                match self.commits_behavior {
                    CommitsBehavior::Stall => {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        return Ok(HttpResponse::status(504));
                    }
                    CommitsBehavior::RateLimit => {
                        return Ok(HttpResponse::status(429).with_header("retry-after", "0"));
                    }
                    CommitsBehavior::Normal => {}
                }
                if repo.empty {
                    return Ok(HttpResponse::status(409));
                }
                let since = parse_time(&query, "since");
                let until = parse_time(&query, "until");
                let mut commits: Vec<&FakeCommit> = repo
                    .commits
                    .iter()
                    .filter(|c| since.is_none_or(|s| c.date >= s))
                    .filter(|c| until.is_none_or(|u| c.date <= u))
                    .collect();
                commits.sort_by(|a, b| b.date.cmp(&a.date));
                let items = commits
                    .into_iter()
                    .map(|c| Self::commit_json(c, false))
                    .collect();
                self.respond(&request, paginate(items, &query))
            }
            ["repos", _, name, "commits", sha] => {
                match self
                    .repo(name)
                    .and_then(|r| r.commits.iter().find(|c| c.sha == *sha))
                {
                    Some(commit) => self.respond(&request, Self::commit_json(commit, true)),
                    None => HttpResponse::status(404),
                }
            }
            ["repos", _, name, "pulls"] => {
                let Some(repo) = self.repo(name) else {
                    return Ok(HttpResponse::status(404));
                };
                let mut pulls: Vec<&FakePull> = repo.pulls.iter().collect();
                pulls.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
                let items = pulls.into_iter().map(Self::pull_json).collect();
                self.respond(&request, paginate(items, &query))
            }
            ["repos", _, name, "pulls", number] => {
                let number: u64 = number.parse().unwrap_or_default();
                match self
                    .repo(name)
                    .and_then(|r| r.pulls.iter().find(|p| p.number == number))
                {
                    Some(pull) => self.respond(&request, Self::pull_json(pull)),
                    None => HttpResponse::status(404),
                }
            }
            _ => HttpResponse::status(404),
        };
        Ok(response)
    }
}

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn ago(hours: i64) -> DateTime<Utc> {
    let t = Utc::now() - TimeDelta::hours(hours);
    DateTime::from_timestamp(t.timestamp(), 0).unwrap_or(t)
}

fn test_config(dir: &TempDir) -> HarvestConfig {
    let mut config = HarvestConfig::with_data_dir("test-token", dir.path());
    config.api_base_url = "https://api.github.test".to_string();
    config.requests_per_minute = 60_000;
    config.per_page = 2;
    config.use_git_mirror = false;
    config.base_wait = Duration::from_millis(1);
    config
}

async fn run(
    harvester: &Harvester,
    org: &str,
    mode: RunMode,
) -> Result<harvester::RunReport, HarvestError> {
    let (_tx, rx) = watch::channel(false);
    let options = RunOptions {
        mode,
        include_archived: false,
    };
    tokio::time::timeout(RUN_TIMEOUT, harvester.run(org, options, rx))
        .await
        .expect("run should not hang")
}

/// `acme` with an active `a` (merge commit for #42), an active `b`, and an
/// archived `c`.
fn acme() -> FakeGitHub {
    let a = FakeRepo::new("a", ago(2))
        .commit("a1", ago(100), "Initial import", 1)
        .commit("a2", ago(72), "Fix parser (#41)", 1)
        .commit(
            "a3",
            ago(48),
            "Merge pull request #42 from acme/feature\n\nAdd feature\n\nCo-authored-by: Grace Hopper <grace@example.com>",
            2,
        )
        .commit("a4", ago(1), "Tidy up", 1)
        .pull(9041, 41, ago(80), Some(ago(72)))
        .pull(9042, 42, ago(60), Some(ago(48)))
        .pull(9010, 10, ago(24 * 30), None);
    let b = FakeRepo::new("b", ago(5))
        .commit("b1", ago(30), "Bump deps", 1)
        .pull(9050, 5, ago(2), None);
    let mut c = FakeRepo::new("c", ago(24 * 400)).commit("c1", ago(10), "Old", 1);
    c.archived = true;
    FakeGitHub::new("acme", vec![a, b, c])
}

#[tokio::test]
async fn acme_full_run_then_incremental_rerun() {
    let dir = TempDir::new().unwrap();
    let fake = Arc::new(acme());
    let harvester = Harvester::new(test_config(&dir), fake.clone()).await.unwrap();

    let report = run(&harvester, "acme", RunMode::Full { days: 7 })
        .await
        .unwrap();
    let summary = &report.summary;
    assert_eq!(summary.repos_selected, 2);
    assert_eq!(summary.processed, 2);
    assert!(summary.skipped.is_empty());
    assert!(summary.failed.is_empty());

    let shas: Vec<_> = report.commits.iter().map(|c| c.sha.as_str()).collect();
    assert_eq!(shas, ["a1", "a2", "a3", "b1", "a4"]);
    let merge = report.commits.iter().find(|c| c.sha == "a3").unwrap();
    assert!(merge.is_merge_commit);
    assert_eq!(merge.pr_number, Some(42));
    assert_eq!(merge.co_authors, vec!["Grace Hopper <grace@example.com>"]);
    assert_eq!(merge.files_changed, 2);
    assert_eq!(merge.author_login.as_deref(), Some("ada"));

    let prs: Vec<_> = report.prs.iter().map(|p| (p.repo.as_str(), p.number)).collect();
    assert_eq!(prs, [("a", 41), ("a", 42), ("b", 5)]);
    assert!(report.commits.iter().all(|c| c.repo != "c"));

    assert_eq!(summary.total_records_processed, 8);
    let commits_csv = std::fs::read_to_string(&report.output.commits).unwrap();
    assert_eq!(commits_csv.lines().filter(|l| l.contains(",ada@example.com,")).count(), 5);

    let state: Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("state.json")).unwrap())
            .unwrap();
    assert_eq!(state["total_records_processed"], 8);
    assert_eq!(state["processed_commit_shas"].as_array().unwrap().len(), 5);
    assert_eq!(state["processed_pr_ids"].as_array().unwrap().len(), 3);

    // Nothing changed upstream: the overlap re-reads a4 and PR 5 but emits nothing.
    let rerun = run(&harvester, "acme", RunMode::Incremental).await.unwrap();
    assert_eq!(rerun.summary.novel_commits, 0);
    assert_eq!(rerun.summary.novel_prs, 0);
    assert!(rerun.summary.duplicate_commits >= 1);
    assert_eq!(rerun.summary.total_records_processed, 8);
    assert!(rerun.summary.cache.hits > 0);

    let rerun_csv = std::fs::read_to_string(&rerun.output.commits).unwrap();
    assert_eq!(rerun_csv.lines().count(), 1);
}

#[tokio::test]
async fn late_pushed_commit_is_picked_up_by_the_next_incremental_run() {
    let dir = TempDir::new().unwrap();
    let first = FakeGitHub::new(
        "acme",
        vec![FakeRepo::new("a", ago(3)).commit("a1", ago(3), "First", 1)],
    );
    let harvester = Harvester::new(test_config(&dir), Arc::new(first)).await.unwrap();
    let report = run(&harvester, "acme", RunMode::Full { days: 7 })
        .await
        .unwrap();
    assert_eq!(report.summary.novel_commits, 1);

    // A commit authored before the previous run, pushed after it.
    let second = FakeGitHub::new(
        "acme",
        vec![
            FakeRepo::new("a", ago(0))
                .commit("a1", ago(3), "First", 1)
                .commit("a0", ago(4), "Rebased in late", 1),
        ],
    );
    let mut config = test_config(&dir);
    config.cache_dir = dir.path().join("cache-second");
    let harvester = Harvester::new(config, Arc::new(second)).await.unwrap();
    let report = run(&harvester, "acme", RunMode::Incremental).await.unwrap();

    let shas: Vec<_> = report.commits.iter().map(|c| c.sha.as_str()).collect();
    assert_eq!(shas, ["a0"]);
    assert_eq!(report.summary.total_records_processed, 2);
}

#[tokio::test]
async fn unchanged_window_yields_identical_records_from_a_fresh_start() {
    let first_dir = TempDir::new().unwrap();
    let second_dir = TempDir::new().unwrap();
    let fake = Arc::new(acme());

    let first = Harvester::new(test_config(&first_dir), fake.clone())
        .await
        .unwrap();
    let first = run(&first, "acme", RunMode::Full { days: 7 }).await.unwrap();

    let second = Harvester::new(test_config(&second_dir), fake.clone())
        .await
        .unwrap();
    let second = run(&second, "acme", RunMode::Full { days: 7 }).await.unwrap();

    assert!(!first.commits.is_empty());
    assert_eq!(first.commits, second.commits);
    assert_eq!(first.prs, second.prs);
    assert_eq!(
        first.summary.total_records_processed,
        second.summary.total_records_processed
    );
    assert_eq!(
        std::fs::read_to_string(&first.output.commits).unwrap(),
        std::fs::read_to_string(&second.output.commits).unwrap()
    );
}

#[tokio::test]
async fn consecutive_incremental_runs_cover_the_full_window_once() {
    let before = FakeRepo::new("a", ago(40))
        .commit("a1", ago(100), "Initial import", 1)
        .commit("a2", ago(40), "Second", 1)
        .pull(9001, 1, ago(90), Some(ago(40)));
    let after = before
        .clone()
        .commit("a3", ago(12), "Pushed after the first run", 1)
        .commit("a0", ago(20), "Authored earlier, pushed late", 1)
        .pull(9002, 2, ago(6), None);
    let b = FakeRepo::new("b", ago(2)).commit("b1", ago(2), "New repo work", 1);

    let dir = TempDir::new().unwrap();
    let r1 = Harvester::new(
        test_config(&dir),
        Arc::new(FakeGitHub::new("acme", vec![before])),
    )
    .await
    .unwrap();
    let r1 = run(&r1, "acme", RunMode::Incremental).await.unwrap();

    let mut config = test_config(&dir);
    config.cache_dir = dir.path().join("cache-r2");
    let upstream = vec![after.clone(), b.clone()];
    let r2 = Harvester::new(config, Arc::new(FakeGitHub::new("acme", upstream)))
        .await
        .unwrap();
    let r2 = run(&r2, "acme", RunMode::Incremental).await.unwrap();

    let full_dir = TempDir::new().unwrap();
    let full = Harvester::new(
        test_config(&full_dir),
        Arc::new(FakeGitHub::new("acme", vec![after, b])),
    )
    .await
    .unwrap();
    let full = run(&full, "acme", RunMode::Full { days: 7 }).await.unwrap();

    let shas = |report: &harvester::RunReport| -> BTreeSet<String> {
        report.commits.iter().map(|c| c.sha.clone()).collect()
    };
    let ids = |report: &harvester::RunReport| -> BTreeSet<u64> {
        report.prs.iter().map(|p| p.id).collect()
    };

    let (r1_shas, r2_shas) = (shas(&r1), shas(&r2));
    assert!(r1_shas.is_disjoint(&r2_shas));
    let union: BTreeSet<String> = r1_shas.union(&r2_shas).cloned().collect();
    assert_eq!(union, shas(&full));
    assert_eq!(r1.commits.len() + r2.commits.len(), full.commits.len());

    let (r1_ids, r2_ids) = (ids(&r1), ids(&r2));
    assert!(r1_ids.is_disjoint(&r2_ids));
    let union: BTreeSet<u64> = r1_ids.union(&r2_ids).copied().collect();
    assert_eq!(union, ids(&full));

    assert_eq!(
        r2.summary.total_records_processed,
        full.summary.total_records_processed
    );
}

#[tokio::test]
async fn one_empty_repository_is_skipped_and_the_rest_succeed() {
    let dir = TempDir::new().unwrap();
    let repos = (0..10)
        .map(|i| {
            let mut repo = FakeRepo::new(&format!("r{i}"), ago(i)).commit(
                &format!("sha{i}"),
                ago(10 + i),
                "Work",
                1,
            );
            repo.empty = i == 4;
            repo
        })
        .collect();
    let fake = Arc::new(FakeGitHub::new("acme", repos));
    let harvester = Harvester::new(test_config(&dir), fake).await.unwrap();

    let report = run(&harvester, "acme", RunMode::Full { days: 7 })
        .await
        .unwrap();

    assert_eq!(report.summary.processed, 9);
    assert!(report.summary.failed.is_empty());
    assert_eq!(report.summary.skipped.len(), 1);
    assert_eq!(report.summary.skipped[0].repo, "acme/r4");
    assert_eq!(report.summary.skipped[0].reason, "empty repository");
    assert_eq!(report.commits.len(), 9);
    assert!(report.commits.iter().all(|c| c.repo != "r4"));
}

#[tokio::test]
async fn unknown_org_is_fatal() {
    let dir = TempDir::new().unwrap();
    let harvester = Harvester::new(test_config(&dir), Arc::new(acme()))
        .await
        .unwrap();

    let err = run(&harvester, "nope", RunMode::Full { days: 7 })
        .await
        .unwrap_err();
    assert!(matches!(err, HarvestError::OrganizationNotFound(_)));
    assert!(!dir.path().join("state.json").exists());
}

#[tokio::test]
async fn repeated_rate_limiting_aborts_the_run() {
    let dir = TempDir::new().unwrap();
    let repos = (0..4)
        .map(|i| FakeRepo::new(&format!("r{i}"), ago(i)))
        .collect();
    let fake = FakeGitHub::new("acme", repos).with_commits(CommitsBehavior::RateLimit);
    let mut config = test_config(&dir);
    config.max_retries = 0;
    config.rate_limit_abort_threshold = 3;
    let harvester = Harvester::new(config, Arc::new(fake)).await.unwrap();

    let err = run(&harvester, "acme", RunMode::Full { days: 7 })
        .await
        .unwrap_err();
    assert!(matches!(err, HarvestError::RateLimitExceeded { .. }));
    assert!(!dir.path().join("state.json").exists());
}

#[tokio::test]
async fn cancellation_stops_workers_and_leaves_state_untouched() {
    let dir = TempDir::new().unwrap();
    let fake = FakeGitHub::new(
        "acme",
        vec![FakeRepo::new("a", ago(1)), FakeRepo::new("b", ago(2))],
    )
    .with_commits(CommitsBehavior::Stall);
    let mut config = test_config(&dir);
    config.request_timeout = Duration::from_secs(600);
    let harvester = Arc::new(Harvester::new(config, Arc::new(fake)).await.unwrap());

    let (tx, rx) = watch::channel(false);
    let task = {
        let harvester = Arc::clone(&harvester);
        tokio::spawn(async move {
            harvester
                .run("acme", RunOptions::default(), rx)
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    tx.send(true).unwrap();

    let result = tokio::time::timeout(RUN_TIMEOUT, task)
        .await
        .expect("cancelled run should finish promptly")
        .unwrap();
    assert!(matches!(result, Err(HarvestError::Cancelled)));
    assert!(!dir.path().join("state.json").exists());
    assert!(!dir.path().join("output").exists());
}
