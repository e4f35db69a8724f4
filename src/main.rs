//! Backend entrypoint.
//!
//! Logging goes to stderr; stdout is the control channel. The main thread
//! reads one JSON request per stdin line, dispatches it, and writes one
//! JSON response per stdout line. Sync/event and health channels are TCP
//! publishers owned by the container; EOF on stdin is the shutdown signal.

use anyhow::Context;
use clap::Parser;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use isi_macroscope::app::{start_health_publisher, AppConfig, AppContext};
use isi_macroscope::handlers;

#[derive(Parser, Debug)]
#[command(
    name = "isi-macroscope",
    about = "Acquisition and analysis backend for an ISI macroscope"
)]
struct Cli {
    /// TCP port for the sync/event broadcast channel (0 = ephemeral).
    #[arg(long, default_value_t = 5557)]
    sync_port: u16,

    /// TCP port for the health channel (0 = ephemeral).
    #[arg(long, default_value_t = 5559)]
    health_port: u16,

    /// JSON parameter file written by the launcher.
    #[arg(long)]
    parameters: Option<PathBuf>,

    /// Directory holding recorded sessions.
    #[arg(long, default_value = "sessions")]
    session_root: PathBuf,

    /// Directory for the shared-memory frame planes (default: OS temp).
    #[arg(long)]
    shm_dir: Option<PathBuf>,

    /// Log filter, e.g. "info" or "isi_macroscope=debug".
    #[arg(long, default_value = "info")]
    log_filter: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_filter.clone())),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = AppConfig {
        sync_port: cli.sync_port,
        health_port: cli.health_port,
        session_root: cli.session_root,
        shm_dir: cli.shm_dir.unwrap_or_else(std::env::temp_dir),
        parameter_file: cli.parameters,
    };

    let ctx = AppContext::build(config).context("failed to build backend container")?;
    let registry = handlers::build_registry().context("failed to build command registry")?;
    let health_handle =
        start_health_publisher(&ctx).context("failed to start health publisher")?;

    info!(commands = registry.command_names().len(), "control loop ready");

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "stdin read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let response = registry.dispatch_line(&ctx, &line);
        let mut out = stdout.lock();
        if writeln!(out, "{response}").and_then(|_| out.flush()).is_err() {
            break;
        }
    }

    info!("stdin closed; shutting down");
    ctx.shutdown();
    let _ = health_handle.join();
    Ok(())
}
