use console::Term;
use tokio::sync::watch;

/// Install the Ctrl+C handler.
///
/// The first Ctrl+C flips the returned receiver to `true`; the run then stops
/// its workers and exits without committing state. A second Ctrl+C exits the
/// process immediately with status 130.
pub(crate) fn setup_shutdown_handler() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
            return;
        }

        let is_tty = Term::stderr().is_term();
        if is_tty {
            eprintln!("\n\nShutdown requested, stopping workers...");
            eprintln!("Press Ctrl+C again to force quit.");
        } else {
            tracing::warn!("Shutdown requested, stopping workers");
        }

        let _ = tx.send(true);

        if tokio::signal::ctrl_c().await.is_ok() {
            if is_tty {
                eprintln!("Force quit!");
            }
            std::process::exit(130);
        }
    });

    rx
}
