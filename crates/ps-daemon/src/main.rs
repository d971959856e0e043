//! periscope daemon: accepts devices on the bootstrap and secure endpoints
//! and routes their plugin traffic.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use ps_core::config::Config;
use ps_daemon::daemon::Daemon;
use ps_telemetry::logging::{self, LogFormat};
use tracing::{error, info};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// periscope device connection daemon.
#[derive(Parser)]
#[command(name = "ps-daemon", version, about)]
struct Cli {
    /// Config file to load instead of ~/.periscope/config.toml.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,

    /// Log level used when RUST_LOG is unset (overrides the config file).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load().context("failed to load config")?,
    };

    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    let format = LogFormat::from_json_flag(cli.json_logs || config.logging.json);
    logging::init("ps-daemon", level, format);
    info!(version = env!("CARGO_PKG_VERSION"), pid = std::process::id(), "periscope daemon starting");

    let daemon = Daemon::new(config).await?;
    let shutdown = daemon.shutdown_handle();

    // Wire ctrl-c to trigger graceful shutdown.
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.trigger();
    });

    if let Err(e) = daemon.run().await {
        error!(error = %e, "daemon execution failed");
        return Err(e);
    }
    Ok(())
}
