//! Portfolio snapshot mutated by completed executions

use serde::{Deserialize, Serialize};

use crate::types::{now_ms, Exchange};

/// Open inventory held on one exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub exchange: Exchange,
    pub quantity: f64,
    pub avg_price: f64,
}

impl Position {
    pub fn notional(&self) -> f64 {
        self.quantity * self.avg_price
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Portfolio {
    pub cash: f64,
    #[serde(default)]
    pub positions: Vec<Position>,
    pub total_value: f64,
    pub last_update: i64,
}

impl Portfolio {
    pub fn new(initial_cash: f64) -> Self {
        Self {
            cash: initial_cash,
            positions: Vec::new(),
            total_value: initial_cash,
            last_update: now_ms(),
        }
    }

    /// Book a realized profit (or loss) from a completed trade
    pub fn apply_pnl(&mut self, net_profit: f64) {
        self.cash += net_profit;
        self.total_value += net_profit;
        self.last_update = now_ms();
    }

    /// Share of value not held as cash, 0 for an empty portfolio
    pub fn exposure_pct(&self) -> f64 {
        if self.total_value > 0.0 {
            (self.total_value - self.cash) / self.total_value
        } else {
            0.0
        }
    }
}

impl Default for Portfolio {
    fn default() -> Self {
        Self::new(100_000.0)
    }
}
