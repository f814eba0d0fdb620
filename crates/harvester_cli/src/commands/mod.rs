mod maintenance;
mod run;

use std::process::ExitCode;

use harvester::HarvestError;
use thiserror::Error;

use crate::config::Config;
use crate::{CacheAction, Commands};

/// Failure of a CLI command.
#[derive(Debug, Error)]
pub(crate) enum CommandError {
    #[error(
        "GitHub token required (set HARVESTER_GITHUB__TOKEN or GITHUB_TOKEN, \
         or [github] token in config.toml)"
    )]
    MissingToken,

    #[error(transparent)]
    Harvest(#[from] HarvestError),

    #[error("failed to build HTTP client: {0}")]
    Http(String),
}

impl CommandError {
    /// Interrupted runs exit like an interrupted process.
    pub(crate) fn exit_status(&self) -> u8 {
        match self {
            Self::Harvest(HarvestError::Cancelled) => 130,
            _ => 1,
        }
    }

    pub(crate) fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.exit_status())
    }
}

pub(crate) async fn dispatch(command: Commands, config: &Config) -> Result<(), CommandError> {
    match command {
        Commands::Run(args) => run::handle_run(args, config).await,
        Commands::Reset => maintenance::handle_reset(config).await,
        Commands::Cache {
            action: CacheAction::Clear,
        } => maintenance::handle_cache_clear(config).await,
    }
}
