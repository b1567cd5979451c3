use std::{process::ExitCode, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use pqchat_client::ClientArgs;
use pqchat_common::{config::UNKNOWN_IDENTITY, session};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// How long runtime shutdown waits for the blocking stdin reader
const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(200);

fn main() -> ExitCode {
    let args = ClientArgs::parse();

    // Setup logging; chat text owns stdout
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("Starting pqchat client...");

    // Check that we're not running as root (for security)
    #[cfg(unix)]
    {
        if nix::unistd::Uid::effective().is_root() {
            eprintln!("Warning: Client should not run as root for security reasons");
        }
    }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &ClientArgs) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    let config = args.session_config();

    let result = runtime.block_on(session::run(&config));
    // A session that ended on the peer's side leaves a read on stdin pending.
    runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);

    let report = result.with_context(|| format!("Chat session with {} failed", args.peer))?;
    info!(
        session = %report.id,
        peer = report.peer_identity.as_deref().unwrap_or(UNKNOWN_IDENTITY),
        sent = report.relay.lines_sent,
        received = report.relay.lines_received,
        "Disconnected"
    );
    Ok(())
}
