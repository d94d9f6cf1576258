use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use ipoe::{config::Config, daemon::run_daemon};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Tunnels IP packets through an email account.
#[derive(Parser)]
#[command(name = "ipoe", version, about)]
struct Cli {
    /// Config file path (overrides the search path).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose (debug-level) logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    let config = Config::load(cli.config.as_deref()).context("unable to load configuration")?;

    let cancel = CancellationToken::new();
    tokio::spawn(watch_signals(cancel.clone()));
    run_daemon(config, cancel).await?;
    info!("Goodbye!");
    Ok(())
}

/// Cancels `cancel` on Ctrl-C, or on SIGTERM where there is one.
async fn watch_signals(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(error) => {
                warn!(%error, "unable to watch SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    let _ = tokio::signal::ctrl_c().await;

    cancel.cancel();
}
