//! Harvester - commit and pull request extraction for GitHub organizations.
//!
//! A run lists every repository of an organization, extracts the commits and
//! pull requests of a time window from each one, drops records already seen
//! in earlier runs, writes the novel ones to CSV, and commits the new state.
//!
//! Re-running costs little: API responses are cached on disk and revalidated
//! with ETags, commit history comes from local bare mirrors, and one global
//! rate limiter with exponential backoff keeps the run under the API quota.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use harvester::{HarvestConfig, Harvester, RunOptions};
//! use harvester::http::reqwest_transport::ReqwestTransport;
//!
//! let config = HarvestConfig::with_data_dir(token, "./harvester-data");
//! let harvester = Harvester::new(config, Arc::new(ReqwestTransport::with_defaults()?)).await?;
//! let (_cancel_tx, cancel) = tokio::sync::watch::channel(false);
//! let report = harvester.run("acme", RunOptions::default(), cancel).await?;
//! println!("{} new commits", report.summary.novel_commits);
//! ```

pub mod api_cache;
pub mod conditional;
pub mod config;
pub mod enumerate;
pub mod error;
pub mod extract;
pub mod fsutil;
pub mod github;
pub mod http;
pub mod message;
pub mod mirror;
pub mod model;
pub mod output;
pub mod progress;
pub mod rate_limit;
pub mod retry;
pub mod run;
pub mod state;

pub use api_cache::{CacheStore, ResourceType};
pub use conditional::CacheStats;
pub use config::HarvestConfig;
pub use error::{HarvestError, Result, Unavailable};
pub use extract::{CommitSource, Extraction, Extractor};
pub use model::{CommitRecord, PrRecord, PrState, Repository};
pub use progress::{HarvestProgress, ProgressCallback};
pub use run::{Harvester, RepoIssue, RunOptions, RunReport, RunSummary};
pub use state::{ExtractionState, RunMode, RunPhase, StateTracker, Window};
