//! Harvester CLI - command-line interface for the commit/PR extractor.

mod commands;
mod config;
mod progress;
mod shutdown;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgGroup, Parser, Subcommand};
use console::Term;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "harvester")]
#[command(version)]
#[command(about = "Extract commits and pull requests from a GitHub organization")]
#[command(
    long_about = "Harvester extracts the commits and pull requests of every repository in a \
GitHub organization for a time window, writes the records not seen in earlier runs to CSV, \
and remembers what it has emitted. API responses are cached on disk and commits are read \
from local git mirrors, so repeated runs stay cheap."
)]
#[command(after_long_help = r#"EXAMPLES
    Extract the last 30 days of an organization:
        $ harvester run acme --days 30

    Pick up where the previous run left off:
        $ harvester run acme --incremental

    Forget all previous runs:
        $ harvester reset

CONFIGURATION
    Harvester reads configuration from:
      1. ~/.config/harvester/config.toml (or $XDG_CONFIG_HOME/harvester/config.toml)
      2. ./harvester.toml
      3. Environment variables (HARVESTER_ prefix, e.g. HARVESTER_RUN__MAX_WORKERS)
      4. .env file in current directory

ENVIRONMENT VARIABLES
    HARVESTER_GITHUB__TOKEN     GitHub token (GITHUB_TOKEN is also accepted)
    HARVESTER_STORAGE__DATA_DIR Data directory (default: ~/.local/state/harvester)
"#)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Extract commits and pull requests of an organization
    Run(RunArgs),
    /// Forget every previous run (state and mirror sync markers)
    Reset,
    /// Manage the API response cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Debug, clap::Args)]
#[command(group(ArgGroup::new("mode").required(true).args(["days", "incremental"])))]
pub(crate) struct RunArgs {
    /// Organization to extract
    pub org: String,

    /// Extract the last N days, ignoring previous runs
    #[arg(long, value_name = "N")]
    pub days: Option<u32>,

    /// Resume from the last successful run
    #[arg(long)]
    pub incremental: bool,

    /// Number of repositories extracted in parallel
    #[arg(long, value_name = "N")]
    pub max_workers: Option<usize>,

    /// Include archived and disabled repositories
    #[arg(long)]
    pub include_archived: bool,

    /// Read commits from the API instead of local git mirrors
    #[arg(long)]
    pub no_mirror: bool,

    /// Directory for commits.csv and pull_requests.csv
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
pub(crate) enum CacheAction {
    /// Delete every cached API response
    Clear,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("harvester=info,harvester_cli=info"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(Term::stderr().is_term())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = config::Config::load();

    match commands::dispatch(cli.command, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            e.exit_code()
        }
    }
}
