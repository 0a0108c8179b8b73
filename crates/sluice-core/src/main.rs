//! Sluice - Entry Point
//!
//! This binary starts the Sluice HTTP gateway.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use sluice_core::{
    config::{Config, LogFormat},
    server,
};

/// Sluice - caching, queueing gateway for a local language model
#[derive(Parser, Debug)]
#[command(name = "sluice", author, version, about)]
struct Args {
    /// Path to a TOML config file (overrides SLUICE_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Address to listen on
    #[arg(short, long)]
    bind: Option<SocketAddr>,
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }
    if let Some(bind) = args.bind {
        config.server.address = bind;
    }

    init_tracing(&config.logging.level, config.logging.format);
    info!(address = %config.server.address, "Starting Sluice");

    server::run(&config).await.context("Server error")?;
    Ok(())
}
