//! Progress reporting for extraction runs.
//!
//! Run events are turned into structured log lines through `tracing`.

use harvester::{HarvestProgress, ProgressCallback};

/// Logging reporter using tracing for structured output.
pub struct LoggingReporter;

impl LoggingReporter {
    pub fn new() -> Self {
        Self
    }

    /// Wrap the reporter in a callback for [`harvester::Harvester::with_progress`].
    pub fn into_callback(self) -> ProgressCallback {
        Box::new(move |event| self.handle(event))
    }

    pub fn handle(&self, event: HarvestProgress) {
        match event {
            HarvestProgress::PhaseChanged { phase } => {
                tracing::debug!(%phase, "Phase");
            }

            HarvestProgress::WindowComputed {
                start,
                end,
                incremental,
            } => {
                tracing::info!(
                    start = %start.format("%Y-%m-%d %H:%M:%S"),
                    end = %end.format("%Y-%m-%d %H:%M:%S"),
                    incremental,
                    "Extraction window"
                );
            }

            HarvestProgress::Enumerated {
                org,
                total,
                selected,
            } => {
                tracing::info!(org = %org, total, selected, "Listed repositories");
            }

            HarvestProgress::RepoStarted { repo } => {
                tracing::debug!(repo = %repo, "Queued");
            }

            HarvestProgress::RepoExtracted {
                repo,
                commits,
                prs,
                source,
            } => {
                tracing::info!(repo = %repo, commits, prs, source = %source, "Extracted");
            }

            HarvestProgress::MirrorFallback { repo, error } => {
                tracing::warn!(repo = %repo, error = %error, "Mirror failed, used the API");
            }

            HarvestProgress::RepoSkipped { repo, reason } => {
                tracing::info!(repo = %repo, reason = %reason, "Skipped");
            }

            HarvestProgress::RepoFailed { repo, error } => {
                tracing::warn!(repo = %repo, error = %error, "Failed");
            }

            HarvestProgress::Merged {
                novel_commits,
                novel_prs,
                duplicate_commits,
                duplicate_prs,
            } => {
                tracing::info!(
                    novel_commits,
                    novel_prs,
                    duplicate_commits,
                    duplicate_prs,
                    "Merged with previous runs"
                );
            }

            HarvestProgress::OutputWritten { commits, prs } => {
                tracing::debug!(commits, prs, "Output written");
            }

            HarvestProgress::StateCommitted {
                total_records_processed,
            } => {
                tracing::info!(total_records_processed, "State committed");
            }

            _ => {}
        }
    }
}
