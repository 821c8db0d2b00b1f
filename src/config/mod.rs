//! Configuration management for CrossArb
//!
//! Loads from config files + environment variables via .env

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::allocation::AllocatorConfig;
use crate::arbitrage::DetectorConfig;
use crate::debate::DebateConfig;
use crate::discovery::DiscoveryConfig;
use crate::exchange::{default_base_prices, SimulatedExchange, SimulatedExchangeConfig};
use crate::execution::ExecutionConfig;
use crate::guardian::GuardianConfig;
use crate::risk::RiskConfig;
use crate::types::Exchange;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub runner: RunnerConfig,
    pub simulation: SimulationConfig,
    pub discovery: DiscoveryConfig,
    pub detector: DetectorConfig,
    pub risk: RiskConfig,
    pub allocator: AllocatorConfig,
    pub debate: DebateConfig,
    /// Initial guardian limits; a persisted config takes precedence
    pub guardian: GuardianConfig,
    pub execution: ExecutionConfig,
    pub portfolio: PortfolioConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Symbols polled every cycle
    pub symbols: Vec<String>,
    pub poll_interval_ms: u64,
    /// State document path; in-memory only when unset
    pub state_file: Option<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            symbols: vec![
                "BTCUSDT".to_string(),
                "ETHUSDT".to_string(),
                "SOLUSDT".to_string(),
            ],
            poll_interval_ms: 2_000,
            state_file: Some("data/crossarb_state.json".to_string()),
        }
    }
}

/// Simulated venues quoted when no real feeds are wired in
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub seed: u64,
    /// Reference price per symbol; unlisted symbols are unavailable
    pub base_prices: HashMap<String, f64>,
    /// Premium per exchange in `Exchange::ALL` order (percent)
    pub premiums_pct: Vec<f64>,
    pub jitter_pct: f64,
    pub failure_rate: f64,
    pub book_levels: usize,
    pub level_size: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        let base = SimulatedExchangeConfig::default();
        Self {
            seed: base.seed,
            base_prices: default_base_prices(),
            premiums_pct: vec![0.0, 0.6, -0.4],
            jitter_pct: base.jitter_pct,
            failure_rate: base.failure_rate,
            book_levels: base.book_levels,
            level_size: base.level_size,
        }
    }
}

impl SimulationConfig {
    /// One simulated feed per exchange; missing premiums default to zero
    pub fn simulated(&self) -> Vec<SimulatedExchange> {
        Exchange::ALL
            .iter()
            .enumerate()
            .map(|(i, exchange)| {
                SimulatedExchange::new(SimulatedExchangeConfig {
                    exchange: *exchange,
                    premium_pct: self.premiums_pct.get(i).copied().unwrap_or(0.0),
                    jitter_pct: self.jitter_pct,
                    failure_rate: self.failure_rate,
                    book_levels: self.book_levels,
                    level_size: self.level_size,
                    seed: self.seed.wrapping_add(i as u64 * 7919),
                    ..Default::default()
                })
                .with_base_prices(self.base_prices.clone())
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortfolioConfig {
    /// Starting cash when no state has been persisted
    pub initial_cash: f64,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            initial_cash: 100_000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when RUST_LOG is unset
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Config::builder()
            // Runner defaults
            .set_default("runner.symbols", vec!["BTCUSDT", "ETHUSDT", "SOLUSDT"])?
            .set_default("runner.poll_interval_ms", 2000)?
            .set_default("runner.state_file", "data/crossarb_state.json")?
            // Simulation defaults
            .set_default("simulation.seed", 7)?
            .set_default("simulation.premiums_pct", vec![0.0, 0.6, -0.4])?
            .set_default("simulation.jitter_pct", 0.3)?
            .set_default("simulation.failure_rate", 0.02)?
            .set_default("simulation.book_levels", 10)?
            .set_default("simulation.level_size", 0.5)?
            // Discovery defaults
            .set_default("discovery.history_capacity", 100)?
            .set_default("discovery.source_timeout_ms", 3000)?
            // Detector defaults
            .set_default("detector.min_spread_pct", 0.5)?
            .set_default("detector.fee_buffer_pct", 0.3)?
            .set_default("detector.persistence_ms", 5000)?
            .set_default("detector.min_persistence_count", 3)?
            .set_default("detector.stale_timeout_ms", 10000)?
            // Risk defaults
            .set_default("risk.default_volatility_pct", 0.5)?
            .set_default("risk.order_book_depth", 20)?
            .set_default("risk.full_fill_ratio", 1.0)?
            .set_default("risk.good_fill_ratio", 0.9)?
            .set_default("risk.fair_fill_ratio", 0.8)?
            .set_default("risk.fail_safe_score", 80.0)?
            // Allocator defaults
            .set_default("allocator.max_trade_amount", 10000.0)?
            .set_default("allocator.per_opportunity_cap", 0.20)?
            .set_default("allocator.aggregate_cap", 0.80)?
            .set_default("allocator.min_ticket", 100.0)?
            // Debate defaults
            .set_default("debate.threshold", 0.6)?
            .set_default("debate.llm.enabled", false)?
            .set_default(
                "debate.llm.endpoint",
                "https://api.openai.com/v1/chat/completions",
            )?
            .set_default("debate.llm.model", "gpt-4o-mini")?
            .set_default("debate.llm.api_key_env", "OPENAI_API_KEY")?
            .set_default("debate.llm.timeout_ms", 10000)?
            .set_default("debate.llm.temperature", 0.2)?
            .set_default("debate.llm.max_tokens", 400)?
            // Guardian defaults
            .set_default("guardian.max_trade_pct_of_portfolio", 0.15)?
            .set_default("guardian.daily_max_trades", 50)?
            .set_default("guardian.global_max_exposure_pct", 0.8)?
            .set_default("guardian.veto_conditions.exchange_outage", true)?
            .set_default("guardian.veto_conditions.high_volatility", true)?
            // Execution defaults
            .set_default("execution.fee_pct", 0.1)?
            .set_default("execution.max_buy_slippage_pct", 0.05)?
            .set_default("execution.rollback_fill_ratio", 0.9)?
            .set_default("execution.order_book_depth", 20)?
            // Portfolio / logging defaults
            .set_default("portfolio.initial_cash", 100000.0)?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (CROSSARB_*), lists comma separated
            .add_source(
                Environment::with_prefix("CROSSARB")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("runner.symbols")
                    .with_list_parse_key("simulation.premiums_pct")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        Ok(app_config)
    }

    /// Generate a digest of the config (without secrets) for logging
    pub fn digest(&self) -> String {
        format!(
            "symbols={:?} poll_ms={} min_spread={:.2}% persistence={}ms/{}x threshold={:.2} llm={} cash={:.2}",
            self.runner.symbols,
            self.runner.poll_interval_ms,
            self.detector.min_spread_pct,
            self.detector.persistence_ms,
            self.detector.min_persistence_count,
            self.debate.threshold,
            self.debate.llm.enabled,
            self.portfolio.initial_cash
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_component_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.discovery.history_capacity, 100);
        assert_eq!(config.detector.min_persistence_count, 3);
        assert_eq!(config.debate.threshold, 0.6);
        assert_eq!(config.guardian.daily_max_trades, 50);
        assert_eq!(config.execution.rollback_fill_ratio, 0.9);
        assert_eq!(config.portfolio.initial_cash, 100_000.0);
    }

    #[test]
    fn partial_document_fills_defaults() {
        let json = r#"{"runner": {"symbols": ["XRPUSDT"]}, "detector": {"min_spread_pct": 1.0}}"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.runner.symbols, vec!["XRPUSDT".to_string()]);
        assert_eq!(config.runner.poll_interval_ms, 2_000);
        assert_eq!(config.detector.min_spread_pct, 1.0);
        assert_eq!(config.detector.fee_buffer_pct, 0.3);
    }

    #[test]
    fn simulated_set_covers_every_exchange() {
        let feeds = SimulationConfig {
            premiums_pct: vec![0.0],
            ..Default::default()
        }
        .simulated();
        assert_eq!(feeds.len(), Exchange::ALL.len());
    }

    #[test]
    fn simulated_feeds_quote_configured_base_prices() {
        use crate::exchange::PriceFeed;

        let feeds = SimulationConfig {
            base_prices: HashMap::from([("DOGEUSDT".to_string(), 0.1)]),
            jitter_pct: 0.0,
            failure_rate: 0.0,
            ..Default::default()
        }
        .simulated();
        let quote = tokio_test::block_on(feeds[0].get_price("DOGEUSDT")).unwrap();
        assert!((quote.price - 0.1).abs() < 1e-12);
        assert!(tokio_test::block_on(feeds[0].get_price("BTCUSDT")).is_err());
    }

    #[test]
    fn env_overrides_symbol_list() {
        std::env::set_var("CROSSARB_RUNNER__SYMBOLS", "XRPUSDT,SOLUSDT");
        std::env::set_var("CROSSARB_RUNNER__POLL_INTERVAL_MS", "500");
        let loaded = AppConfig::load();
        std::env::remove_var("CROSSARB_RUNNER__SYMBOLS");
        std::env::remove_var("CROSSARB_RUNNER__POLL_INTERVAL_MS");

        let config = loaded.unwrap();
        assert_eq!(
            config.runner.symbols,
            vec!["XRPUSDT".to_string(), "SOLUSDT".to_string()]
        );
        assert_eq!(config.runner.poll_interval_ms, 500);
    }

    #[test]
    fn digest_names_symbols() {
        let digest = AppConfig::default().to_string();
        assert!(digest.contains("BTCUSDT"));
        assert!(digest.contains("poll_ms=2000"));
    }
}
