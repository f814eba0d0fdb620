//! Local bare mirrors of organization repositories.
//!
//! Reading history from a local clone replaces one commits-list request per
//! page and one detail request per commit with a single `git fetch`. Each
//! repository gets a bare, shallow, single-branch clone at
//! `{root}/{org}/{name}.git` and a sidecar `{name}.last-sync` holding the
//! head sha of the last committed run.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use url::Url;

use crate::config::HarvestConfig;
use crate::fsutil::write_atomic;
use crate::message;
use crate::model::{CommitRecord, Repository};
use crate::state::Window;

const FIELD_SEP: char = '\x1f';
const RECORD_SEP: char = '\x1e';

/// `git log` format: one record per commit, fields separated by US, body last.
const LOG_FORMAT: &str = "--format=%x1e%H%x1f%P%x1f%an%x1f%ae%x1f%cn%x1f%ce%x1f%cI%x1f%B%x1f";

const MARKER_SUFFIX: &str = ".last-sync";

/// `--deepen=1` steps taken before giving up on a boundary inside the window.
const MAX_DEEPEN_STEPS: usize = 8;

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("failed to run git: {0}")]
    Spawn(#[source] io::Error),

    #[error("git {command} failed ({status}): {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("git {command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("repository {0} has no commits on its default branch")]
    EmptyRepository(String),

    #[error("mirror I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("unparsable git log output: {0}")]
    Parse(String),
}

/// Manager for the local mirror directory.
pub struct GitMirror {
    root: PathBuf,
    git_base_url: String,
    token: String,
    depth: u32,
    timeout: Duration,
    locks: Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>,
}

impl GitMirror {
    pub fn new(config: &HarvestConfig) -> Self {
        Self {
            root: config.mirror_dir.clone(),
            git_base_url: config.git_base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            depth: config.mirror_depth.max(1),
            timeout: config.git_timeout,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of the bare clone for `repo`.
    pub fn repo_path(&self, repo: &Repository) -> PathBuf {
        self.root
            .join(repo.owner())
            .join(format!("{}.git", repo.name))
    }

    fn marker_path(&self, repo: &Repository) -> PathBuf {
        self.root
            .join(repo.owner())
            .join(format!("{}{MARKER_SUFFIX}", repo.name))
    }

    /// Create the mirror, or bring an existing one up to date.
    #[tracing::instrument(skip(self, repo), fields(repo = %repo.full_name))]
    pub async fn ensure_mirror(&self, repo: &Repository) -> Result<PathBuf, MirrorError> {
        let path = self.repo_path(repo);
        let _guard = self.lock(&path).await;
        self.ensure_mirror_locked(repo, &path).await?;
        Ok(path)
    }

    /// Commits on the default branch dated inside `window`.
    ///
    /// With a `since_sha` still present in the mirror, only commits not
    /// reachable from it are read. A shallow mirror whose history starts after
    /// `window.start` is deepened first.
    #[tracing::instrument(skip(self, repo, window), fields(repo = %repo.full_name))]
    pub async fn commits_in_window(
        &self,
        repo: &Repository,
        since_sha: Option<&str>,
        window: Window,
    ) -> Result<Vec<CommitRecord>, MirrorError> {
        let path = self.repo_path(repo);
        let _guard = self.lock(&path).await;
        if !path.join("HEAD").exists() {
            self.ensure_mirror_locked(repo, &path).await?;
        }

        self.deepen_if_needed(repo, &path, window.start).await?;

        let branch_ref = format!("refs/heads/{}", repo.default_branch);
        let range = match since_sha {
            Some(sha) if self.has_commit(&path, sha).await => format!("{sha}..{branch_ref}"),
            Some(sha) => {
                tracing::debug!(sha, "Last synced commit not in mirror, reading whole branch");
                branch_ref
            }
            None => branch_ref,
        };

        let stdout = self
            .git(
                Some(&path),
                &[
                    "log",
                    LOG_FORMAT,
                    "--numstat",
                    "--diff-merges=first-parent",
                    &range,
                ],
            )
            .await?;

        let commits: Vec<CommitRecord> = parse_log_output(&repo.name, &stdout)?
            .into_iter()
            .filter(|c| window.contains(c.date))
            .collect();
        tracing::debug!(count = commits.len(), "Read commits from mirror");
        Ok(commits)
    }

    /// Current head of the mirrored default branch.
    pub async fn head_sha(&self, repo: &Repository) -> Result<String, MirrorError> {
        let path = self.repo_path(repo);
        let out = self
            .git(
                Some(&path),
                &["rev-parse", &format!("refs/heads/{}", repo.default_branch)],
            )
            .await?;
        Ok(out.trim().to_string())
    }

    /// Head sha recorded by the last committed run, if any.
    pub async fn last_synced(&self, repo: &Repository) -> Option<String> {
        let path = self.marker_path(repo);
        let contents = tokio::fs::read_to_string(&path).await.ok()?;
        let sha = contents.trim();
        (!sha.is_empty() && sha.chars().all(|c| c.is_ascii_hexdigit())).then(|| sha.to_string())
    }

    /// Record `sha` as synced. Call only after the run's state is committed.
    pub async fn mark_synced(&self, repo: &Repository, sha: &str) -> Result<(), MirrorError> {
        let path = self.marker_path(repo);
        write_atomic(&path, format!("{sha}\n").as_bytes())
            .await
            .map_err(|e| MirrorError::Io { path, source: e })
    }

    /// Remove every sync marker, so the next run reads full branches again.
    pub async fn forget_synced(&self) -> Result<usize, MirrorError> {
        let mut removed = 0;
        let mut owners = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(self.io_err(&self.root, e)),
        };
        while let Some(owner) = owners
            .next_entry()
            .await
            .map_err(|e| self.io_err(&self.root, e))?
        {
            let dir = owner.path();
            if !dir.is_dir() {
                continue;
            }
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| self.io_err(&dir, e))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| self.io_err(&dir, e))?
            {
                let path = entry.path();
                if path.to_string_lossy().ends_with(MARKER_SUFFIX) {
                    tokio::fs::remove_file(&path)
                        .await
                        .map_err(|e| self.io_err(&path, e))?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    fn io_err(&self, path: &Path, source: io::Error) -> MirrorError {
        MirrorError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    async fn lock(&self, path: &Path) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(path.to_path_buf()).or_default())
        };
        lock.lock_owned().await
    }

    async fn ensure_mirror_locked(
        &self,
        repo: &Repository,
        path: &Path,
    ) -> Result<(), MirrorError> {
        let branch = &repo.default_branch;
        let refspec = format!("+refs/heads/{branch}:refs/heads/{branch}");
        let url = self.clone_url(repo);

        if path.join("HEAD").exists() {
            tracing::debug!("Fetching into existing mirror");
            self.git(Some(path), &["fetch", "--quiet", &url, &refspec])
                .await?;
        } else {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| self.io_err(parent, e))?;
            }
            tracing::info!(url = %self.redact(&url), depth = self.depth, "Cloning mirror");
            let depth = self.depth.to_string();
            let target = path.to_string_lossy();
            let cloned = self
                .git(
                    None,
                    &[
                        "clone",
                        "--quiet",
                        "--bare",
                        "--depth",
                        &depth,
                        "--single-branch",
                        "--branch",
                        branch,
                        &url,
                        &target,
                    ],
                )
                .await;
            if let Err(e) = cloned {
                let _ = tokio::fs::remove_dir_all(path).await;
                return Err(self.classify_clone_failure(repo, &url, e).await);
            }
            // Keep the token out of the mirror's config; fetches pass the URL explicitly.
            let public_url = self.public_url(repo);
            self.git(Some(path), &["remote", "set-url", "origin", &public_url])
                .await?;
        }

        let verify = format!("refs/heads/{branch}^{{commit}}");
        if !self
            .git_status(Some(path), &["rev-parse", "--verify", "--quiet", &verify])
            .await?
        {
            return Err(MirrorError::EmptyRepository(repo.full_name.clone()));
        }
        Ok(())
    }

    /// A failed clone of a branch the remote does not have means an empty repository.
    async fn classify_clone_failure(
        &self,
        repo: &Repository,
        url: &str,
        err: MirrorError,
    ) -> MirrorError {
        if !matches!(err, MirrorError::Command { .. }) {
            return err;
        }
        let branch_ref = format!("refs/heads/{}", repo.default_branch);
        // `--exit-code` makes ls-remote exit with 2 when no ref matches.
        match self
            .git_exit_code(None, &["ls-remote", "--exit-code", "--heads", url, &branch_ref])
            .await
        {
            Ok(Some(2)) => MirrorError::EmptyRepository(repo.full_name.clone()),
            _ => err,
        }
    }

    /// Make sure every commit dated at or after `start` has its parents locally.
    ///
    /// A shallow boundary commit has its parents grafted away, so git would
    /// diff it against the empty tree and report no merge parents. First
    /// `--shallow-since` reaches the window, then `--deepen=1` steps past
    /// boundaries still inside it. Committer dates are not monotonic, so the
    /// step repeats a bounded number of times.
    async fn deepen_if_needed(
        &self,
        repo: &Repository,
        path: &Path,
        start: DateTime<Utc>,
    ) -> Result<(), MirrorError> {
        let branch = &repo.default_branch;
        let refspec = format!("+refs/heads/{branch}:refs/heads/{branch}");
        let url = self.clone_url(repo);

        for round in 0..=MAX_DEEPEN_STEPS {
            let Some(oldest) = self.boundary_in_window(path, start).await? else {
                return Ok(());
            };
            if round == MAX_DEEPEN_STEPS {
                tracing::warn!(
                    oldest,
                    "Shallow boundary still inside the window; its stats may be incomplete"
                );
                return Ok(());
            }

            let deepen = if round == 0 && oldest > start.timestamp() {
                let since = start.to_rfc3339_opts(SecondsFormat::Secs, true);
                tracing::info!(since = %since, "Deepening shallow mirror");
                format!("--shallow-since={since}")
            } else {
                tracing::debug!(round, "Fetching parents of shallow boundary");
                "--deepen=1".to_string()
            };
            self.git(Some(path), &["fetch", "--quiet", &deepen, &url, &refspec])
                .await?;
        }
        Ok(())
    }

    /// Oldest committer time among shallow boundary commits dated at or
    /// after `start`, or `None` when no boundary reaches into the window.
    async fn boundary_in_window(
        &self,
        path: &Path,
        start: DateTime<Utc>,
    ) -> Result<Option<i64>, MirrorError> {
        let shallow_file = path.join("shallow");
        let boundary = match tokio::fs::read_to_string(&shallow_file).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_err(&shallow_file, e)),
        };
        let shas: Vec<&str> = boundary.split_whitespace().collect();
        if shas.is_empty() {
            return Ok(None);
        }

        let mut args = vec!["show", "-s", "--format=%ct"];
        args.extend(shas.iter().copied());
        let out = self.git(Some(path), &args).await?;
        Ok(out
            .lines()
            .filter_map(|l| l.trim().parse::<i64>().ok())
            .filter(|&t| t >= start.timestamp())
            .min())
    }

    async fn has_commit(&self, path: &Path, sha: &str) -> bool {
        let object = format!("{sha}^{{commit}}");
        self.git_status(Some(path), &["cat-file", "-e", &object])
            .await
            .unwrap_or(false)
    }

    /// Clone URL without credentials.
    fn public_url(&self, repo: &Repository) -> String {
        format!("{}/{}.git", self.git_base_url, repo.full_name)
    }

    /// Clone URL carrying the token as `x-access-token` for http(s) remotes.
    fn clone_url(&self, repo: &Repository) -> String {
        let public = self.public_url(repo);
        if self.token.is_empty() {
            return public;
        }
        match Url::parse(&public) {
            Ok(mut url) if matches!(url.scheme(), "http" | "https") => {
                if url.set_username("x-access-token").is_ok()
                    && url.set_password(Some(&self.token)).is_ok()
                {
                    url.into()
                } else {
                    public
                }
            }
            _ => public,
        }
    }

    fn redact(&self, text: &str) -> String {
        if self.token.is_empty() {
            text.to_string()
        } else {
            text.replace(&self.token, "***")
        }
    }

    fn command(&self, dir: Option<&Path>, args: &[&str]) -> Command {
        let mut cmd = Command::new("git");
        if let Some(dir) = dir {
            cmd.arg("-C").arg(dir);
        }
        cmd.args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn output(
        &self,
        dir: Option<&Path>,
        args: &[&str],
    ) -> Result<std::process::Output, MirrorError> {
        let name = args.first().copied().unwrap_or_default().to_string();
        match tokio::time::timeout(self.timeout, self.command(dir, args).output()).await {
            Err(_) => Err(MirrorError::Timeout {
                command: name,
                timeout: self.timeout,
            }),
            Ok(Err(e)) => Err(MirrorError::Spawn(e)),
            Ok(Ok(output)) => Ok(output),
        }
    }

    /// Run git and return stdout, failing on a non-zero exit.
    async fn git(&self, dir: Option<&Path>, args: &[&str]) -> Result<String, MirrorError> {
        let output = self.output(dir, args).await?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(MirrorError::Command {
            command: args.first().copied().unwrap_or_default().to_string(),
            status: output.status.to_string(),
            stderr: self.redact(stderr.trim()),
        })
    }

    /// Run git and report only whether it exited successfully.
    async fn git_status(&self, dir: Option<&Path>, args: &[&str]) -> Result<bool, MirrorError> {
        Ok(self.output(dir, args).await?.status.success())
    }

    async fn git_exit_code(
        &self,
        dir: Option<&Path>,
        args: &[&str],
    ) -> Result<Option<i32>, MirrorError> {
        Ok(self.output(dir, args).await?.status.code())
    }
}

/// Parse `git log` output produced with [`LOG_FORMAT`] and `--numstat`.
pub fn parse_log_output(repo: &str, stdout: &str) -> Result<Vec<CommitRecord>, MirrorError> {
    let mut commits = Vec::new();

    for record in stdout.split(RECORD_SEP) {
        if record.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = record.splitn(9, FIELD_SEP).collect();
        let [sha, parents, author_name, author_email, _committer_name, committer_email, date, body, numstat] =
            fields.as_slice()
        else {
            return Err(MirrorError::Parse(format!(
                "expected 9 fields, got {}",
                fields.len()
            )));
        };

        let date = DateTime::parse_from_rfc3339(date.trim())
            .map_err(|e| MirrorError::Parse(format!("bad date {date:?} for {sha}: {e}")))?
            .with_timezone(&Utc);

        let mut files_changed = 0u32;
        let mut additions = 0u64;
        let mut deletions = 0u64;
        for line in numstat.lines() {
            let mut cols = line.splitn(3, '\t');
            let (Some(added), Some(deleted), Some(_path)) = (cols.next(), cols.next(), cols.next())
            else {
                continue;
            };
            files_changed += 1;
            // Binary files report "-".
            additions += added.parse::<u64>().unwrap_or(0);
            deletions += deleted.parse::<u64>().unwrap_or(0);
        }

        let message = body.trim_end().to_string();
        commits.push(CommitRecord {
            repo: repo.to_string(),
            sha: sha.trim().to_string(),
            author_login: message::noreply_login(author_email),
            author_email: author_email.to_string(),
            author_name: author_name.to_string(),
            committer_login: message::noreply_login(committer_email),
            date,
            is_merge_commit: parents.split_whitespace().count() > 1,
            pr_number: message::pr_number(&message),
            files_changed,
            additions,
            deletions,
            co_authors: message::co_authors(&message),
            message,
        });
    }

    Ok(commits)
}
