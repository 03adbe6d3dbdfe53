//! dfsi-bridge - P25 DFSI to FNE voice bridge
//!
//! Bridges P25 voice call streams between an FNE peer network and DFSI
//! endpoints over UDP/RTP or a framed serial link.

mod carrier;
mod codec;
mod config;
mod control;
mod peer;
mod supervisor;
mod voice;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use config::Config;
use peer::NullPeer;
use supervisor::Supervisor;

#[derive(Parser)]
#[command(name = "dfsi-bridge")]
#[command(about = "P25 DFSI to FNE voice bridge", long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Also log to the console
    #[arg(short = 'l', long)]
    log_on_console: bool,
}

fn level_filter(level: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string()))
}

/// Set up the file sink (always) and the console sink (with `-l`).
fn init_logging(config: &Config, log_on_console: bool) -> Result<()> {
    let file_name = format!(
        "{}-{}.log",
        config.log.file_root,
        chrono::Local::now().format("%Y-%m-%d")
    );
    std::fs::create_dir_all(&config.log.file_path)
        .with_context(|| format!("Failed to create log directory {}", config.log.file_path))?;
    let log_path = Path::new(&config.log.file_path).join(file_name);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open log file {}", log_path.display()))?;

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(std::sync::Mutex::new(file))
        .with_filter(level_filter(&config.log.file_level));

    let console_layer = log_on_console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_filter(level_filter(&config.log.display_level))
    });

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;
    config.validate()?;
    init_logging(&config, cli.log_on_console)?;

    tracing::info!(
        "{} starting (peer {} -> {}:{}, mode {:?})",
        config.name,
        config.peer_id,
        config.address,
        config.port,
        config.mode()?
    );

    // The FNE transport library attaches here; its callbacks go through
    // the supervisor's adapter.
    let fne_peer = Arc::new(NullPeer::default());
    let mut supervisor = Supervisor::new(config, fne_peer);
    let _adapter = supervisor.adapter();

    supervisor.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for shutdown signal")?;
    tracing::info!("Shutting down");
    supervisor.stop().await;

    Ok(())
}
