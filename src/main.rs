//! CrossArb - simulated cross-exchange arbitrage runner
//!
//! Loads config, restores state, polls until Ctrl-C, then stops and
//! persists the final state.

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crossarb::config::AppConfig;
use crossarb::runner::Runner;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    info!("🚀 CrossArb v{}", env!("CARGO_PKG_VERSION"));
    info!(config = %config.digest(), "Configuration loaded");

    let runner = Runner::builder(config).build()?;
    let started = runner.start(None).await?;
    info!(
        poll_interval_ms = started.poll_interval_ms,
        "Polling, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested");

    let outcome = runner.stop().await;
    let portfolio = runner.portfolio().await;
    info!(
        polls = outcome.stats.poll_count,
        opportunities = outcome.stats.opportunities_processed,
        attempted = outcome.stats.executions_attempted,
        successful = outcome.stats.executions_successful,
        cash = %format!("${:.2}", portfolio.cash),
        "Final stats"
    );
    Ok(())
}
