//! Order book ladder and the liquidity walk shared by risk and execution

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Order book level
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

impl BookLevel {
    pub fn new(price: f64, size: f64) -> Self {
        Self { price, size }
    }

    fn is_valid(&self) -> bool {
        self.price.is_finite() && self.size.is_finite() && self.price > 0.0 && self.size > 0.0
    }
}

/// Order book
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderBook {
    pub symbol: String,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub timestamp: i64,
}

/// Result of walking one side of the book up to a target quantity
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LiquidityEstimate {
    pub fillable_qty: f64,
    /// Volume-weighted average price over the consumed levels, 0 when nothing fills
    pub expected_avg_price: f64,
}

impl LiquidityEstimate {
    /// Fraction of `target_qty` that the book can absorb
    pub fn fill_ratio(&self, target_qty: f64) -> f64 {
        if target_qty > 0.0 && target_qty.is_finite() {
            (self.fillable_qty / target_qty).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

impl OrderBook {
    pub fn new(symbol: impl Into<String>, bids: Vec<BookLevel>, asks: Vec<BookLevel>) -> Self {
        let mut book = Self {
            symbol: symbol.into(),
            bids,
            asks,
            timestamp: crate::types::now_ms(),
        };
        book.normalize_levels();
        book
    }

    /// Normalize raw book levels:
    /// - keep only finite positive price/size
    /// - sort bids descending (best first)
    /// - sort asks ascending (best first)
    pub fn normalize_levels(&mut self) {
        self.bids.retain(BookLevel::is_valid);
        self.asks.retain(BookLevel::is_valid);

        self.bids
            .sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(Ordering::Equal));
        self.asks
            .sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(Ordering::Equal));
    }

    /// Get best bid
    pub fn best_bid(&self) -> Option<&BookLevel> {
        self.bids
            .iter()
            .filter(|level| level.is_valid())
            .max_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(Ordering::Equal))
    }

    /// Get best ask
    pub fn best_ask(&self) -> Option<&BookLevel> {
        self.asks
            .iter()
            .filter(|level| level.is_valid())
            .min_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(Ordering::Equal))
    }

    /// Get mid price
    pub fn mid_price(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid.price + ask.price) / 2.0),
            _ => None,
        }
    }

    /// Total size resting on the ask side
    pub fn ask_depth(&self) -> f64 {
        self.asks
            .iter()
            .filter(|level| level.is_valid())
            .map(|level| level.size)
            .sum()
    }

    /// Walk the ask ladder best-price-first, consuming up to `target_qty`.
    ///
    /// Stops when the target is filled or the book is exhausted. The same
    /// walk serves as the risk estimate and as the simulated sell fill.
    pub fn walk_asks(&self, target_qty: f64) -> LiquidityEstimate {
        if !(target_qty.is_finite() && target_qty > 0.0) {
            return LiquidityEstimate::default();
        }

        let mut levels: Vec<&BookLevel> = self.asks.iter().filter(|l| l.is_valid()).collect();
        levels.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(Ordering::Equal));

        let mut remaining = target_qty;
        let mut filled = 0.0;
        let mut notional = 0.0;
        for level in levels {
            if remaining <= 0.0 {
                break;
            }
            let take = level.size.min(remaining);
            filled += take;
            notional += take * level.price;
            remaining -= take;
        }

        LiquidityEstimate {
            fillable_qty: filled,
            expected_avg_price: if filled > 0.0 { notional / filled } else { 0.0 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ladder() -> OrderBook {
        OrderBook::new(
            "BTCUSDT",
            vec![BookLevel::new(99.0, 1.0), BookLevel::new(98.0, 2.0)],
            vec![
                BookLevel::new(102.0, 2.0),
                BookLevel::new(101.0, 1.0),
                BookLevel::new(103.0, 5.0),
            ],
        )
    }

    #[test]
    fn normalize_levels_filters_invalid_and_sorts() {
        let mut book = OrderBook {
            symbol: "t".to_string(),
            bids: vec![
                BookLevel::new(-1.0, 1.0),
                BookLevel::new(0.45, 0.0),
                BookLevel::new(0.51, 3.0),
                BookLevel::new(0.52, 4.0),
            ],
            asks: vec![
                BookLevel::new(0.70, 0.0),
                BookLevel::new(0.64, 5.0),
                BookLevel::new(f64::NAN, 2.0),
                BookLevel::new(0.62, 2.0),
            ],
            timestamp: 0,
        };

        book.normalize_levels();

        assert_eq!(book.bids.len(), 2);
        assert_eq!(book.bids[0].price, 0.52);
        assert_eq!(book.asks.len(), 2);
        assert_eq!(book.asks[0].price, 0.62);
        assert_eq!(book.asks[1].price, 0.64);
    }

    #[test]
    fn walk_asks_consumes_best_levels_first() {
        let book = ladder();
        let est = book.walk_asks(2.0);
        assert_eq!(est.fillable_qty, 2.0);
        // 1 @ 101 + 1 @ 102
        assert!((est.expected_avg_price - 101.5).abs() < 1e-9);
        assert_eq!(est.fill_ratio(2.0), 1.0);
    }

    #[test]
    fn walk_asks_stops_when_book_exhausted() {
        let book = ladder();
        let est = book.walk_asks(10.0);
        assert_eq!(est.fillable_qty, 8.0);
        assert!((est.fill_ratio(10.0) - 0.8).abs() < 1e-9);
        let expected = (101.0 + 2.0 * 102.0 + 5.0 * 103.0) / 8.0;
        assert!((est.expected_avg_price - expected).abs() < 1e-9);
    }

    #[test]
    fn walk_asks_on_empty_book_fills_nothing() {
        let book = OrderBook::new("X", vec![], vec![]);
        let est = book.walk_asks(1.0);
        assert_eq!(est.fillable_qty, 0.0);
        assert_eq!(est.expected_avg_price, 0.0);
        assert_eq!(book.mid_price(), None);
    }

    #[test]
    fn mid_price_uses_best_levels() {
        assert_eq!(ladder().mid_price(), Some(100.0));
    }
}
