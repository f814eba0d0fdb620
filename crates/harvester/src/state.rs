//! Persistent extraction state and the dedup/merge step.
//!
//! The state file records which commits and pull requests have already been
//! emitted. It is only ever changed by [`StateTracker::commit`] at the end of
//! a fully successful run, and always replaced atomically, so a failed or
//! cancelled run leaves it exactly as it was.

use std::collections::{BTreeSet, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fsutil::write_atomic;
use crate::model::{CommitRecord, PrRecord};

/// Overlap added before the last run date on incremental runs, so commits
/// pushed late with older dates are still picked up.
pub const INCREMENTAL_OVERLAP_DAYS: i64 = 1;

/// What has been emitted so far.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionState {
    pub last_run_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub processed_pr_ids: BTreeSet<String>,
    #[serde(default)]
    pub processed_commit_shas: BTreeSet<String>,
    #[serde(default)]
    pub total_records_processed: u64,
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to read state file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("state file {} is corrupt: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write state file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// How the extraction window is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Resume from the last successful run.
    Incremental,
    /// The last `days` days, regardless of state.
    Full { days: u32 },
}

/// Half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    #[inline]
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end
    }
}

/// Run-level state machine.
///
/// `Idle -> Enumerating -> Extracting -> Merging -> Persisting -> Idle`, or
/// `-> Failed` from any phase on a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunPhase {
    Idle,
    Enumerating,
    Extracting,
    Merging,
    Persisting,
    Failed,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RunPhase::Idle => "idle",
            RunPhase::Enumerating => "enumerating",
            RunPhase::Extracting => "extracting",
            RunPhase::Merging => "merging",
            RunPhase::Persisting => "persisting",
            RunPhase::Failed => "failed",
        })
    }
}

/// Records not seen in any earlier run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Novel {
    pub commits: Vec<CommitRecord>,
    pub prs: Vec<PrRecord>,
    pub duplicate_commits: usize,
    pub duplicate_prs: usize,
}

/// Owner of the state file.
#[derive(Debug, Clone)]
pub struct StateTracker {
    path: PathBuf,
    default_window_days: u32,
}

impl StateTracker {
    pub fn new(path: impl Into<PathBuf>, default_window_days: u32) -> Self {
        Self {
            path: path.into(),
            default_window_days,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state, or the empty state if no file exists yet.
    ///
    /// An unreadable or corrupt file is an error: starting over silently would
    /// emit every record a second time.
    pub async fn load_state(&self) -> Result<ExtractionState, StateError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "No state file, starting fresh");
                return Ok(ExtractionState::default());
            }
            Err(e) => {
                return Err(StateError::Read {
                    path: self.path.clone(),
                    source: e,
                });
            }
        };

        serde_json::from_slice(&bytes).map_err(|e| StateError::Corrupt {
            path: self.path.clone(),
            source: e,
        })
    }

    /// Decide the extraction window for a run starting at `now`.
    pub fn compute_window(
        &self,
        state: &ExtractionState,
        mode: RunMode,
        now: DateTime<Utc>,
    ) -> Window {
        let start = match (mode, state.last_run_date) {
            (RunMode::Incremental, Some(last)) => {
                (last - TimeDelta::days(INCREMENTAL_OVERLAP_DAYS)).min(now)
            }
            (RunMode::Incremental, None) => {
                now - TimeDelta::days(i64::from(self.default_window_days))
            }
            (RunMode::Full { days }, _) => now - TimeDelta::days(i64::from(days)),
        };
        Window { start, end: now }
    }

    /// Drop records already in `state`, and repeats within the batch.
    ///
    /// The first occurrence of each sha or id is kept, unmodified and in order.
    pub fn merge_novel(
        state: &ExtractionState,
        commits: Vec<CommitRecord>,
        prs: Vec<PrRecord>,
    ) -> Novel {
        let mut novel = Novel::default();

        let mut seen_shas: HashSet<String> = HashSet::new();
        for commit in commits {
            if state.processed_commit_shas.contains(&commit.sha)
                || !seen_shas.insert(commit.sha.clone())
            {
                novel.duplicate_commits += 1;
            } else {
                novel.commits.push(commit);
            }
        }

        let mut seen_ids: HashSet<String> = HashSet::new();
        for pr in prs {
            let key = pr.dedup_key();
            if state.processed_pr_ids.contains(&key) || !seen_ids.insert(key) {
                novel.duplicate_prs += 1;
            } else {
                novel.prs.push(pr);
            }
        }

        novel
    }

    /// Record a successful run and persist it atomically.
    ///
    /// This is the only way the state changes.
    pub async fn commit(
        &self,
        state: &ExtractionState,
        new_commits: &[CommitRecord],
        new_prs: &[PrRecord],
        now: DateTime<Utc>,
    ) -> Result<ExtractionState, StateError> {
        let mut next = state.clone();
        next.last_run_date = Some(now);

        let mut added = 0u64;
        for commit in new_commits {
            if next.processed_commit_shas.insert(commit.sha.clone()) {
                added += 1;
            }
        }
        for pr in new_prs {
            if next.processed_pr_ids.insert(pr.dedup_key()) {
                added += 1;
            }
        }
        next.total_records_processed += added;

        self.save(&next).await?;
        tracing::info!(
            added,
            total = next.total_records_processed,
            "Committed extraction state"
        );
        Ok(next)
    }

    /// Clear all recorded progress.
    pub async fn reset(&self) -> Result<(), StateError> {
        self.save(&ExtractionState::default()).await?;
        tracing::info!(path = %self.path.display(), "Reset extraction state");
        Ok(())
    }

    async fn save(&self, state: &ExtractionState) -> Result<(), StateError> {
        let bytes = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.path, &bytes)
            .await
            .map_err(|e| StateError::Write {
                path: self.path.clone(),
                source: e,
            })
    }
}
