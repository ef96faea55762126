// Telemetry collection daemon: accept records on a local socket and stage them for upload.

mod config;
mod server;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "telem-linux", version)]
#[command(about = "Local telemetry collection daemon")]
struct Args {
    /// Path to a config file (default: ~/.config/telemetrics/config.toml, then
    /// /etc/telemetrics/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cfg = config::load(args.config.as_deref())?;
    info!(version = env!("CARGO_PKG_VERSION"), "telem-linux starting");

    // On SIGTERM/SIGINT the loop finishes its current pass, drops clients and removes the socket.
    let shutdown = Arc::new(AtomicBool::new(false));
    for sig in [SIGTERM, SIGINT] {
        signal_hook::flag::register(sig, Arc::clone(&shutdown))
            .context("failed to install signal handler")?;
    }

    let mut server = server::Server::bind(&cfg)?;
    server.run(&shutdown)
}
