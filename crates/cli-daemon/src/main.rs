//! CLI entry point for the ripline transcoding daemon
//!
//! Parses command line arguments, initializes logging, and starts the
//! daemon. Configuration comes from the environment, with an optional TOML
//! file underneath.

use clap::Parser;
use ripline::{Config, Daemon};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Ripline - durable transcoding-job daemon for disc-ripping front-ends
#[derive(Parser, Debug)]
#[command(name = "ripline")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Optional TOML config file; environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the HTTP bind address
    #[arg(short, long)]
    bind: Option<String>,

    /// Skip startup checks (tool resolution, hardware detection). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!("failed to load config {}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        },
        None => Config::from_env(),
    };
    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
    }

    info!(
        raw = %config.paths.raw_path.display(),
        completed = %config.paths.completed_path.display(),
        encoder = %config.encoding.video_encoder,
        "ripline starting"
    );

    let daemon_result = if args.skip_checks {
        info!("skipping startup checks (--skip-checks enabled)");
        Daemon::new_unchecked(config)
    } else {
        Daemon::new(config)
    };

    match daemon_result {
        Ok(daemon) => {
            if let Err(e) = daemon.run().await {
                error!("daemon error: {}", e);
                return ExitCode::FAILURE;
            }
            info!("ripline stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("failed to initialize daemon: {}", e);
            ExitCode::FAILURE
        }
    }
}
