//! `reset` and `cache clear`.

use std::sync::Arc;

use console::{Term, style};
use harvester::Harvester;
use harvester::http::reqwest_transport::ReqwestTransport;

use crate::commands::CommandError;
use crate::config::Config;

/// Neither command talks to GitHub, so no token is required.
async fn offline_harvester(config: &Config) -> Result<Harvester, CommandError> {
    let mut harvest_config = config.harvest_config(config.github_token().unwrap_or_default());
    // Sync markers are removed even when mirrors are disabled for runs.
    harvest_config.use_git_mirror = true;

    let transport = ReqwestTransport::with_defaults().map_err(|e| CommandError::Http(e.to_string()))?;
    Ok(Harvester::new(harvest_config, Arc::new(transport)).await?)
}

pub(super) async fn handle_reset(config: &Config) -> Result<(), CommandError> {
    let harvester = offline_harvester(config).await?;
    harvester.reset().await?;
    done(&format!(
        "Reset extraction state ({})",
        harvester.config().state_file.display()
    ));
    Ok(())
}

pub(super) async fn handle_cache_clear(config: &Config) -> Result<(), CommandError> {
    let harvester = offline_harvester(config).await?;
    harvester.clear_cache().await?;
    done(&format!(
        "Cleared API cache ({})",
        harvester.config().cache_dir.display()
    ));
    Ok(())
}

fn done(message: &str) {
    if Term::stdout().is_term() {
        println!("{} {}", style("✓").green().bold(), message);
    } else {
        tracing::info!("{message}");
    }
}
