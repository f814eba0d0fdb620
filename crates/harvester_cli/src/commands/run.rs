//! The `run` command: one extraction over an organization.

use std::sync::Arc;

use console::{Term, style};
use harvester::http::reqwest_transport::ReqwestTransport;
use harvester::{Harvester, HarvestConfig, RepoIssue, RunMode, RunOptions, RunReport};

use crate::RunArgs;
use crate::commands::CommandError;
use crate::config::Config;
use crate::progress::LoggingReporter;
use crate::shutdown::setup_shutdown_handler;

/// Issues listed per category before the rest is summarized.
const MAX_LISTED_ISSUES: usize = 10;

pub(super) async fn handle_run(args: RunArgs, config: &Config) -> Result<(), CommandError> {
    let token = config.github_token().ok_or(CommandError::MissingToken)?;
    let harvest_config = apply_overrides(config.harvest_config(token), &args);

    let transport = ReqwestTransport::with_defaults().map_err(|e| CommandError::Http(e.to_string()))?;
    let harvester = Harvester::new(harvest_config, Arc::new(transport))
        .await?
        .with_progress(LoggingReporter::new().into_callback());

    let options = RunOptions {
        mode: run_mode(&args),
        include_archived: args.include_archived,
    };
    let shutdown = setup_shutdown_handler();

    let report = harvester.run(&args.org, options, shutdown).await?;
    print_summary(&report, Term::stdout().is_term());
    Ok(())
}

fn run_mode(args: &RunArgs) -> RunMode {
    match args.days {
        Some(days) => RunMode::Full { days },
        None => RunMode::Incremental,
    }
}

fn apply_overrides(mut config: HarvestConfig, args: &RunArgs) -> HarvestConfig {
    if let Some(workers) = args.max_workers {
        config.max_workers = workers;
    }
    if args.no_mirror {
        config.use_git_mirror = false;
    }
    if let Some(output_dir) = &args.output_dir {
        config.output_dir = output_dir.clone();
    }
    config
}

fn print_summary(report: &RunReport, is_tty: bool) {
    let s = &report.summary;
    let format = "%Y-%m-%d %H:%M:%S UTC";

    if is_tty {
        println!();
        println!(
            "{} {} ({} to {})",
            style("✓").green().bold(),
            style(&s.org).cyan(),
            s.window.start.format(format),
            s.window.end.format(format),
        );
    } else {
        println!(
            "{}: {} to {}",
            s.org,
            s.window.start.format(format),
            s.window.end.format(format)
        );
    }

    println!(
        "  Repositories: {} selected, {} processed, {} skipped, {} failed",
        s.repos_selected,
        s.processed,
        s.skipped.len(),
        s.failed.len()
    );
    println!(
        "  New records:  {} commits, {} pull requests ({} already seen)",
        s.novel_commits,
        s.novel_prs,
        s.duplicate_commits + s.duplicate_prs
    );
    println!("  Total emitted across runs: {}", s.total_records_processed);
    println!(
        "  API cache:    {} hits, {} revalidated, {} fetched",
        s.cache.hits, s.cache.revalidated, s.cache.fetched
    );

    print_issues("Skipped", &s.skipped, is_tty);
    print_issues("Failed", &s.failed, is_tty);

    println!("  Commits:       {}", report.output.commits.display());
    println!("  Pull requests: {}", report.output.pull_requests.display());
}

fn print_issues(label: &str, issues: &[RepoIssue], is_tty: bool) {
    if issues.is_empty() {
        return;
    }
    let heading = format!("{label} ({}):", issues.len());
    if is_tty {
        println!("  {}", style(heading).yellow().bold());
    } else {
        println!("  {heading}");
    }
    for issue in issues.iter().take(MAX_LISTED_ISSUES) {
        println!("    - {}: {}", issue.repo, issue.reason);
    }
    if issues.len() > MAX_LISTED_ISSUES {
        println!("    ... and {} more", issues.len() - MAX_LISTED_ISSUES);
    }
}
