//! Drydock daemon entry point
//!
//! Keeps locally-running containers updated against their upstream
//! registries: cron-driven image checks, orchestrated updates with
//! rollback, and a WebSocket event gateway for interactive clients.

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

mod cmd;

#[derive(Parser)]
#[command(name = "drydock")]
#[command(about = "Container fleet update daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<cmd::Commands>,

    /// Path to configuration file
    #[arg(short, long, default_value = "drydock.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("drydock={}", log_level).into());

    let json_logs = std::env::var("LOG_FORMAT")
        .map(|f| f == "json")
        .unwrap_or(false);
    if json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Starting drydock v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Some(cmd::Commands::Check { image, registry }) => {
            cmd::check::run(&cli.config, &image, registry.as_deref()).await?;
        }
        None => {
            // Default: run the daemon
            if let Err(e) = cmd::root::run(&cli.config).await {
                error!("Daemon error: {:#}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
