//! # SLE
//!
//! Long-running log-shipping agent: tails growing files (including glob
//! sets) and the systemd journal, enriches each line with a timestamp and
//! level, buffers through a bounded queue with per-source overflow policies,
//! and pushes batches to one or more log-ingestion backends.

/// Supervisor wiring and shutdown handling
pub mod supervisor;

use clap::Parser;
use sle_config::{ConfigLoader, DEFAULT_BUFFER_DIR, DEFAULT_CONFIG_DIR};
use std::path::PathBuf;
use std::process::ExitCode;
use supervisor::Supervisor;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Command line arguments for the SLE agent
#[derive(Parser, Debug)]
#[command(name = "sle")]
#[command(about = "Ship local log files and the systemd journal to remote backends")]
struct Args {
    /// Enable verbose logging
    #[arg(long)]
    debug: bool,

    /// Directory holding the merged .json/.yaml/.yml config files
    #[arg(long, env = "SLE_CONFIG_DIR", default_value = DEFAULT_CONFIG_DIR)]
    config_dir: PathBuf,

    /// Root directory of the on-disk overflow buffer
    #[arg(long, env = "SLE_BUFFER_DIR", default_value = DEFAULT_BUFFER_DIR)]
    buffer_dir: PathBuf,
}

/// Exit code for a fatal configuration error at startup.
const EXIT_CONFIG: u8 = 1;
/// Exit code for an unrecoverable runtime error.
const EXIT_RUNTIME: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = if args.debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .init();

    let config = match ConfigLoader::new(&args.config_dir).load() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "fatal configuration error");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    if !config.has_backends() {
        error!(
            config_dir = %args.config_dir.display(),
            "no backend configured, nothing to ship to"
        );
        return ExitCode::from(EXIT_CONFIG);
    }

    let supervisor = match Supervisor::new(config, args.buffer_dir, args.config_dir.clone()) {
        Ok(supervisor) => supervisor,
        Err(err) => {
            error!(error = %err, "failed to construct pipeline");
            return ExitCode::from(EXIT_RUNTIME);
        }
    };

    let cancel = CancellationToken::new();
    if let Err(err) = install_signal_handler(cancel.clone()) {
        error!(error = %err, "failed to install signal handler");
        return ExitCode::from(EXIT_RUNTIME);
    }

    match supervisor.run(cancel).await {
        Ok(()) => {
            info!("clean shutdown");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "unrecoverable runtime error");
            ExitCode::from(EXIT_RUNTIME)
        }
    }
}

/// SIGINT and SIGTERM both trigger the shared cancellation signal.
fn install_signal_handler(cancel: CancellationToken) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
            info!("shutdown signal received");
            cancel.cancel();
        });
    }
    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            cancel.cancel();
        });
    }
    Ok(())
}
