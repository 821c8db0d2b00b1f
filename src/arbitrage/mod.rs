//! Arbitrage opportunities and their persistence-gated detection

mod detector;

pub use detector::{DetectParams, DetectorConfig, OpportunityDetector};

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ControlError;
use crate::types::{Exchange, TradeAction};

/// Buffer key: one entry per symbol and trade direction
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpportunityKey {
    pub symbol: String,
    pub action: TradeAction,
}

impl fmt::Display for OpportunityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.symbol, self.action)
    }
}

/// A cross-exchange spread that has been observed at least once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: String,
    pub symbol: String,
    pub action: TradeAction,
    /// Spread magnitude in the trade direction, percent
    pub spread_pct: f64,
    /// Spread minus the fee buffer, percent
    pub estimated_gross_profit_pct: f64,
    /// Price on the buy exchange
    pub source_price: f64,
    /// Price on the sell exchange
    pub target_price: f64,
    pub first_seen_ts: i64,
    pub last_seen_ts: i64,
    pub persistence_count: u32,
}

impl Opportunity {
    pub fn key(&self) -> OpportunityKey {
        OpportunityKey {
            symbol: self.symbol.clone(),
            action: self.action,
        }
    }

    pub fn buy_exchange(&self) -> Exchange {
        self.action.buy
    }

    pub fn sell_exchange(&self) -> Exchange {
        self.action.sell
    }

    pub fn persisted_ms(&self) -> i64 {
        self.last_seen_ts - self.first_seen_ts
    }

    /// Reject opportunities that cannot be priced
    pub fn validate(&self) -> Result<(), ControlError> {
        let ok = |p: f64| p.is_finite() && p > 0.0;
        if self.symbol.trim().is_empty() {
            return Err(ControlError::BlankSymbol);
        }
        if !ok(self.source_price) || !ok(self.target_price) {
            return Err(ControlError::InvalidOpportunity {
                id: self.id.clone(),
                source_price: self.source_price,
                target_price: self.target_price,
            });
        }
        Ok(())
    }
}
