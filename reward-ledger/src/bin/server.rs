//! Reward ledger server binary
//!
//! Opens the ledger and keeps it running; HTTP handlers embed the library.
//! Configuration comes from the file named by the first argument or
//! `REWARD_CONFIG`, else from environment variables.

use anyhow::Context;
use reward_ledger::{Config, Ledger};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn load_config() -> anyhow::Result<Config> {
    let path = std::env::args().nth(1).or_else(|| std::env::var("REWARD_CONFIG").ok());
    match path {
        Some(path) => Config::from_file(&path).with_context(|| format!("loading config from {}", path)),
        None => Config::from_env().context("loading config from environment"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if config.log_json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    info!(service = %config.service_name, "Starting reward ledger");
    if config.telegram.bot_token.is_none() {
        warn!("No bot token configured; init data and membership checks are unavailable");
    }

    let ledger = Ledger::open(config).context("opening ledger")?;
    info!(settings = ?ledger.settings()?, "Ledger ready");

    let mut audit = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = audit.tick() => {
                let pending = ledger.repair_candidates().len();
                if pending > 0 {
                    warn!(pending, "Ledger has unrepaired log gaps");
                }
            }
            result = tokio::signal::ctrl_c() => {
                result.context("waiting for shutdown signal")?;
                break;
            }
        }
    }

    info!("Shutting down reward ledger");
    Ok(())
}
