//! The extraction run: enumerate, extract in parallel, merge, persist.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Semaphore, watch};
use tokio::task::{self, JoinSet};

use crate::api_cache::CacheStore;
use crate::conditional::CacheStats;
use crate::config::HarvestConfig;
use crate::enumerate::RepoEnumerator;
use crate::error::{HarvestError, Result, short_error_message};
use crate::extract::{Extraction, Extractor};
use crate::github::GitHubClient;
use crate::http::HttpTransport;
use crate::mirror::GitMirror;
use crate::model::{CommitRecord, PrRecord, Repository};
use crate::output::{OutputFiles, sort_commits, sort_prs, write_outputs};
use crate::progress::{HarvestProgress, ProgressCallback, emit};
use crate::state::{RunMode, RunPhase, StateTracker, Window};

/// What a run should cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub mode: RunMode,
    /// Also extract archived and disabled repositories.
    pub include_archived: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            mode: RunMode::Incremental,
            include_archived: false,
        }
    }
}

/// A repository that was not extracted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoIssue {
    pub repo: String,
    pub reason: String,
}

/// Counts reported at the end of a successful run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub org: String,
    pub window: Window,
    /// Repositories selected for extraction.
    pub repos_selected: usize,
    pub processed: usize,
    pub skipped: Vec<RepoIssue>,
    pub failed: Vec<RepoIssue>,
    pub novel_commits: usize,
    pub novel_prs: usize,
    pub duplicate_commits: usize,
    pub duplicate_prs: usize,
    /// Running total after this run was committed.
    pub total_records_processed: u64,
    pub cache: CacheStats,
}

/// Result of [`Harvester::run`].
#[derive(Debug, Clone)]
pub struct RunReport {
    pub summary: RunSummary,
    /// Novel commits, ordered by `(date, repo, sha)`.
    pub commits: Vec<CommitRecord>,
    /// Novel pull requests, ordered by `(created_at, repo, number)`.
    pub prs: Vec<PrRecord>,
    pub output: OutputFiles,
}

/// Drives extraction runs for one configuration.
pub struct Harvester {
    config: HarvestConfig,
    client: GitHubClient,
    mirror: Option<Arc<GitMirror>>,
    tracker: StateTracker,
    on_progress: Option<ProgressCallback>,
}

impl Harvester {
    /// Open the cache and wire up the client, mirror and state tracker.
    pub async fn new(config: HarvestConfig, transport: Arc<dyn HttpTransport>) -> Result<Self> {
        let cache = Arc::new(CacheStore::open(&config.cache_dir, config.max_cache_bytes).await?);
        let client = GitHubClient::new(&config, transport, cache);
        let mirror = config
            .use_git_mirror
            .then(|| Arc::new(GitMirror::new(&config)));
        let tracker = StateTracker::new(&config.state_file, config.default_window_days);
        Ok(Self {
            config,
            client,
            mirror,
            tracker,
            on_progress: None,
        })
    }

    #[must_use]
    pub fn with_progress(mut self, on_progress: ProgressCallback) -> Self {
        self.on_progress = Some(on_progress);
        self
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    pub fn client(&self) -> &GitHubClient {
        &self.client
    }

    /// Run one extraction over every repository of `org`.
    ///
    /// State is only committed when the whole run succeeds. When `cancel`
    /// turns `true`, workers are aborted, staged cache writes are discarded
    /// and [`HarvestError::Cancelled`] is returned.
    #[tracing::instrument(skip(self, options, cancel), fields(mode = ?options.mode))]
    pub async fn run(
        &self,
        org: &str,
        options: RunOptions,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<RunReport> {
        let result = self.run_phases(org, options, &mut cancel).await;
        match &result {
            Ok(report) => {
                self.phase(RunPhase::Idle);
                let s = &report.summary;
                tracing::info!(
                    org,
                    processed = s.processed,
                    skipped = s.skipped.len(),
                    failed = s.failed.len(),
                    novel_commits = s.novel_commits,
                    novel_prs = s.novel_prs,
                    total = s.total_records_processed,
                    cache_hits = s.cache.hits,
                    cache_revalidated = s.cache.revalidated,
                    cache_fetched = s.cache.fetched,
                    "Run complete"
                );
            }
            Err(e) => {
                self.phase(RunPhase::Failed);
                if matches!(e, HarvestError::Cancelled) {
                    match self.client.cache().discard_staged().await {
                        Ok(n) if n > 0 => tracing::debug!(discarded = n, "Discarded staged cache writes"),
                        Ok(_) => {}
                        Err(err) => tracing::warn!(error = %err, "Failed to discard staged cache writes"),
                    }
                }
                tracing::error!(org, error = %e, "Run failed");
            }
        }
        result
    }

    /// Forget all progress: the state file and every mirror sync marker.
    pub async fn reset(&self) -> Result<()> {
        self.tracker.reset().await?;
        if let Some(mirror) = &self.mirror {
            let removed = mirror.forget_synced().await?;
            tracing::debug!(removed, "Removed mirror sync markers");
        }
        Ok(())
    }

    /// Delete every cached API response.
    pub async fn clear_cache(&self) -> Result<()> {
        self.client.cache().clear().await?;
        Ok(())
    }

    async fn run_phases(
        &self,
        org: &str,
        options: RunOptions,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<RunReport> {
        self.phase(RunPhase::Enumerating);
        let state = self.tracker.load_state().await?;
        let now = Utc::now();
        let window = self.tracker.compute_window(&state, options.mode, now);
        let incremental = matches!(options.mode, RunMode::Incremental);
        tracing::info!(start = %window.start, end = %window.end, incremental, "Extraction window");
        emit(
            self.on_progress.as_ref(),
            HarvestProgress::WindowComputed {
                start: window.start,
                end: window.end,
                incremental,
            },
        );

        let enumerator = RepoEnumerator::new(self.client.clone());
        let enumeration = tokio::select! {
            biased;
            _ = cancelled(cancel) => return Err(HarvestError::Cancelled),
            listed = enumerator.list_active(org, options.include_archived) => listed?,
        };
        emit(
            self.on_progress.as_ref(),
            HarvestProgress::Enumerated {
                org: org.to_string(),
                total: enumeration.total,
                selected: enumeration.repos.len(),
            },
        );

        self.phase(RunPhase::Extracting);
        let repos_selected = enumeration.repos.len();
        let extracted = self
            .extract_all(enumeration.repos, window, incremental, cancel)
            .await?;

        self.phase(RunPhase::Merging);
        let mut novel = StateTracker::merge_novel(&state, extracted.commits, extracted.prs);
        sort_commits(&mut novel.commits);
        sort_prs(&mut novel.prs);
        emit(
            self.on_progress.as_ref(),
            HarvestProgress::Merged {
                novel_commits: novel.commits.len(),
                novel_prs: novel.prs.len(),
                duplicate_commits: novel.duplicate_commits,
                duplicate_prs: novel.duplicate_prs,
            },
        );

        if *cancel.borrow() {
            return Err(HarvestError::Cancelled);
        }

        self.phase(RunPhase::Persisting);
        let output = write_outputs(&self.config.output_dir, &novel.commits, &novel.prs).await?;
        emit(
            self.on_progress.as_ref(),
            HarvestProgress::OutputWritten {
                commits: novel.commits.len(),
                prs: novel.prs.len(),
            },
        );

        let committed = self
            .tracker
            .commit(&state, &novel.commits, &novel.prs, now)
            .await?;
        emit(
            self.on_progress.as_ref(),
            HarvestProgress::StateCommitted {
                total_records_processed: committed.total_records_processed,
            },
        );

        // Markers advance only once the records they cover are committed.
        if let Some(mirror) = &self.mirror {
            for (repo, sha) in &extracted.heads {
                if let Err(e) = mirror.mark_synced(repo, sha).await {
                    tracing::warn!(repo = %repo.full_name, error = %e, "Failed to record mirror sync");
                }
            }
        }

        let summary = RunSummary {
            org: org.to_string(),
            window,
            repos_selected,
            processed: extracted.processed,
            skipped: extracted.skipped,
            failed: extracted.failed,
            novel_commits: novel.commits.len(),
            novel_prs: novel.prs.len(),
            duplicate_commits: novel.duplicate_commits,
            duplicate_prs: novel.duplicate_prs,
            total_records_processed: committed.total_records_processed,
            cache: self.client.stats(),
        };
        Ok(RunReport {
            summary,
            commits: novel.commits,
            prs: novel.prs,
            output,
        })
    }

    /// Extract every repository on a bounded worker pool.
    async fn extract_all(
        &self,
        repos: Vec<Repository>,
        window: Window,
        incremental: bool,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Extracted> {
        let workers = self.config.workers();
        let semaphore = Arc::new(Semaphore::new(workers));
        let extractor = Extractor::new(self.client.clone(), self.mirror.clone());
        let mut join_set: JoinSet<(Repository, Result<Extraction>)> = JoinSet::new();
        // Names repositories whose task panicked; a panic loses the task's output.
        let mut task_repos: HashMap<task::Id, String> = HashMap::new();

        for repo in repos {
            emit(
                self.on_progress.as_ref(),
                HarvestProgress::RepoStarted {
                    repo: repo.full_name.clone(),
                },
            );
            let name = repo.full_name.clone();
            let handle = join_set.spawn(extract_with_permit(
                extractor.clone(),
                self.mirror.clone(),
                Arc::clone(&semaphore),
                repo,
                window,
                incremental,
            ));
            task_repos.insert(handle.id(), name);
        }

        let mut extracted = Extracted::default();
        let mut rate_limited = 0usize;

        loop {
            let joined = tokio::select! {
                biased;
                _ = cancelled(cancel) => {
                    join_set.abort_all();
                    return Err(HarvestError::Cancelled);
                }
                next = join_set.join_next() => next,
            };
            let Some(joined) = joined else {
                break;
            };

            let (repo, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    let repo = task_repos
                        .remove(&e.id())
                        .unwrap_or_else(|| String::from("<unknown>"));
                    tracing::error!(repo = %repo, error = %e, "Extraction task failed");
                    let error = format!("extraction task failed: {e}");
                    emit(
                        self.on_progress.as_ref(),
                        HarvestProgress::RepoFailed {
                            repo: repo.clone(),
                            error: error.clone(),
                        },
                    );
                    extracted.failed.push(RepoIssue {
                        repo,
                        reason: error,
                    });
                    continue;
                }
            };

            match result {
                Ok(extraction) => {
                    if let Some(error) = &extraction.mirror_error {
                        emit(
                            self.on_progress.as_ref(),
                            HarvestProgress::MirrorFallback {
                                repo: repo.full_name.clone(),
                                error: error.clone(),
                            },
                        );
                    }
                    emit(
                        self.on_progress.as_ref(),
                        HarvestProgress::RepoExtracted {
                            repo: repo.full_name.clone(),
                            commits: extraction.commits.len(),
                            prs: extraction.prs.len(),
                            source: extraction.source,
                        },
                    );
                    extracted.processed += 1;
                    extracted.commits.extend(extraction.commits);
                    extracted.prs.extend(extraction.prs);
                    if let Some(head) = extraction.head_sha {
                        extracted.heads.push((repo, head));
                    }
                }
                Err(e) if e.is_fatal() => {
                    join_set.abort_all();
                    return Err(e);
                }
                Err(e) if e.is_skip() => {
                    let reason = match &e {
                        HarvestError::RepositoryUnavailable { reason, .. } => reason.to_string(),
                        other => short_error_message(other),
                    };
                    tracing::info!(repo = %repo.full_name, reason = %reason, "Skipping repository");
                    emit(
                        self.on_progress.as_ref(),
                        HarvestProgress::RepoSkipped {
                            repo: repo.full_name.clone(),
                            reason: reason.clone(),
                        },
                    );
                    extracted.skipped.push(RepoIssue {
                        repo: repo.full_name,
                        reason,
                    });
                }
                Err(e) => {
                    let error = short_error_message(&e);
                    tracing::warn!(repo = %repo.full_name, error = %error, "Repository failed");
                    emit(
                        self.on_progress.as_ref(),
                        HarvestProgress::RepoFailed {
                            repo: repo.full_name.clone(),
                            error: error.clone(),
                        },
                    );
                    extracted.failed.push(RepoIssue {
                        repo: repo.full_name,
                        reason: error,
                    });

                    if e.is_rate_limited() {
                        rate_limited += 1;
                        if rate_limited >= self.config.rate_limit_abort_threshold.max(1) {
                            tracing::error!(rate_limited, "Too many repositories hit the rate limit");
                            join_set.abort_all();
                            return Err(e);
                        }
                    }
                }
            }
        }

        Ok(extracted)
    }

    fn phase(&self, phase: RunPhase) {
        tracing::debug!(%phase, "Run phase");
        emit(
            self.on_progress.as_ref(),
            HarvestProgress::PhaseChanged { phase },
        );
    }
}

/// Records gathered from every repository, before dedup.
#[derive(Default)]
struct Extracted {
    commits: Vec<CommitRecord>,
    prs: Vec<PrRecord>,
    /// Mirror heads to record once the run is committed.
    heads: Vec<(Repository, String)>,
    processed: usize,
    skipped: Vec<RepoIssue>,
    failed: Vec<RepoIssue>,
}

async fn extract_with_permit(
    extractor: Extractor,
    mirror: Option<Arc<GitMirror>>,
    semaphore: Arc<Semaphore>,
    repo: Repository,
    window: Window,
    incremental: bool,
) -> (Repository, Result<Extraction>) {
    let Ok(_permit) = semaphore.acquire_owned().await else {
        return (repo, Err(HarvestError::Cancelled));
    };

    let since = match (&mirror, incremental) {
        (Some(mirror), true) => mirror.last_synced(&repo).await,
        _ => None,
    };
    let result = extractor.extract(&repo, window, since.as_deref()).await;
    (repo, result)
}

/// Resolves once `cancel` turns `true`; never, if the sender is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}
