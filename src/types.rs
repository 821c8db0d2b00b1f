//! Core types used throughout CrossArb
//!
//! Defines the exchange identifiers, price samples and trade directions
//! shared by every pipeline stage.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Exchanges the pipeline discovers prices on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    /// Reference (primary) market
    Binance,
    /// Secondary market
    Bybit,
    /// Regulated market
    Coinbase,
}

impl Default for Exchange {
    fn default() -> Self {
        Exchange::Binance
    }
}

impl Exchange {
    pub const ALL: [Exchange; 3] = [Exchange::Binance, Exchange::Bybit, Exchange::Coinbase];

    /// Lowercase identifier used in action keys and audit records
    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Binance => "binance",
            Exchange::Bybit => "bybit",
            Exchange::Coinbase => "coinbase",
        }
    }

    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "binance" => Some(Exchange::Binance),
            "bybit" => Some(Exchange::Bybit),
            "coinbase" => Some(Exchange::Coinbase),
            _ => None,
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One price observation from one exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSample {
    pub symbol: String,
    pub exchange: Exchange,
    pub price: f64,
    pub volume: Option<f64>,
    pub timestamp: i64,
}

/// Direction of a two-leg arbitrage: buy on one exchange, sell on another
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TradeAction {
    pub buy: Exchange,
    pub sell: Exchange,
}

impl TradeAction {
    pub fn new(buy: Exchange, sell: Exchange) -> Self {
        Self { buy, sell }
    }

    /// Derive the action from a pairwise spread `(b - a) / a`.
    /// Positive spread: `a` is cheaper, so buy on `a` and sell on `b`.
    pub fn from_spread(a: Exchange, b: Exchange, spread_pct: f64) -> Self {
        if spread_pct >= 0.0 {
            Self::new(a, b)
        } else {
            Self::new(b, a)
        }
    }
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buy-on-{}-sell-on-{}", self.buy, self.sell)
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
