//! Progress reporting for extraction runs.
//!
//! The run engine emits [`HarvestProgress`] events through an optional
//! callback; the library never prints on its own.

use chrono::{DateTime, Utc};

use crate::extract::CommitSource;
use crate::state::RunPhase;

/// Progress events emitted during a run.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum HarvestProgress {
    /// The run moved to a new phase.
    PhaseChanged { phase: RunPhase },

    /// The extraction window was decided.
    WindowComputed {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        incremental: bool,
    },

    /// Repository listing finished.
    Enumerated {
        org: String,
        /// Repositories returned by the API.
        total: usize,
        /// Repositories that will be extracted.
        selected: usize,
    },

    /// A repository was queued for extraction.
    RepoStarted { repo: String },

    /// A repository was extracted.
    RepoExtracted {
        repo: String,
        commits: usize,
        prs: usize,
        source: CommitSource,
    },

    /// The git mirror failed and the commits API was used instead.
    MirrorFallback { repo: String, error: String },

    /// A repository was skipped (not found, empty, disabled).
    RepoSkipped { repo: String, reason: String },

    /// A repository failed; the run continues.
    RepoFailed { repo: String, error: String },

    /// Novel records were separated from already-processed ones.
    Merged {
        novel_commits: usize,
        novel_prs: usize,
        duplicate_commits: usize,
        duplicate_prs: usize,
    },

    /// Output files were written.
    OutputWritten { commits: usize, prs: usize },

    /// State was committed.
    StateCommitted { total_records_processed: u64 },
}

/// Callback for progress updates during a run.
pub type ProgressCallback = Box<dyn Fn(HarvestProgress) + Send + Sync>;

/// Emit a progress event if a callback is provided.
#[inline]
pub fn emit(on_progress: Option<&ProgressCallback>, event: HarvestProgress) {
    if let Some(cb) = on_progress {
        cb(event);
    }
}
