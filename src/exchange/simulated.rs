//! Simulated exchange with seedable randomness
//!
//! Quotes a base price table with a per-exchange premium and random jitter,
//! and synthesizes an order-book ladder around the quote. A configurable
//! failure rate makes individual calls fail the way a flaky venue would.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use super::{BookLevel, OrderBook, PriceFeed, PriceQuote};
use crate::error::FeedError;
use crate::types::{now_ms, Exchange};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedExchangeConfig {
    pub exchange: Exchange,
    /// Constant premium over the base price in percent (may be negative)
    pub premium_pct: f64,
    /// Uniform jitter amplitude in percent
    pub jitter_pct: f64,
    /// Probability (0-1) that any single call fails
    pub failure_rate: f64,
    /// Levels generated per book side
    pub book_levels: usize,
    /// Size of the best level; deeper levels grow linearly
    pub level_size: f64,
    /// Price step between levels in percent of the quote
    pub level_step_pct: f64,
    pub seed: u64,
}

impl Default for SimulatedExchangeConfig {
    fn default() -> Self {
        Self {
            exchange: Exchange::Binance,
            premium_pct: 0.0,
            jitter_pct: 0.3,
            failure_rate: 0.02,
            book_levels: 10,
            level_size: 0.5,
            level_step_pct: 0.02,
            seed: 7,
        }
    }
}

/// Reference prices the simulator quotes around
pub fn default_base_prices() -> HashMap<String, f64> {
    HashMap::from([
        ("BTCUSDT".to_string(), 50_000.0),
        ("ETHUSDT".to_string(), 3_000.0),
        ("SOLUSDT".to_string(), 150.0),
        ("XRPUSDT".to_string(), 0.6),
    ])
}

pub struct SimulatedExchange {
    config: SimulatedExchangeConfig,
    base_prices: HashMap<String, f64>,
    rng: Mutex<StdRng>,
}

impl SimulatedExchange {
    pub fn new(config: SimulatedExchangeConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            base_prices: default_base_prices(),
            rng: Mutex::new(rng),
        }
    }

    pub fn with_base_prices(mut self, base_prices: HashMap<String, f64>) -> Self {
        self.base_prices = base_prices;
        self
    }

    /// Draw (fails?, jitter in [-1, 1]) under a single lock
    fn draw(&self) -> (bool, f64) {
        let mut rng = match self.rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let fails = rng.gen::<f64>() < self.config.failure_rate;
        let jitter = rng.gen_range(-1.0..=1.0);
        (fails, jitter)
    }

    fn quote(&self, symbol: &str, jitter: f64) -> Option<f64> {
        let base = *self.base_prices.get(symbol)?;
        let premium = 1.0 + self.config.premium_pct / 100.0;
        let noise = 1.0 + jitter * self.config.jitter_pct / 100.0;
        Some(base * premium * noise)
    }
}

#[async_trait]
impl PriceFeed for SimulatedExchange {
    fn exchange(&self) -> Exchange {
        self.config.exchange
    }

    async fn get_price(&self, symbol: &str) -> Result<PriceQuote, FeedError> {
        let (fails, jitter) = self.draw();
        if fails {
            return Err(FeedError::PriceUnavailable {
                exchange: self.config.exchange,
                symbol: symbol.to_string(),
                reason: "simulated outage".to_string(),
            });
        }
        let price = self
            .quote(symbol, jitter)
            .ok_or_else(|| FeedError::PriceUnavailable {
                exchange: self.config.exchange,
                symbol: symbol.to_string(),
                reason: "unlisted symbol".to_string(),
            })?;
        Ok(PriceQuote {
            price,
            volume: Some(self.config.level_size * self.config.book_levels as f64),
        })
    }

    async fn get_order_book(&self, symbol: &str, depth: usize) -> Result<OrderBook, FeedError> {
        let (fails, jitter) = self.draw();
        let unavailable = |reason: &str| FeedError::OrderBookUnavailable {
            exchange: self.config.exchange,
            symbol: symbol.to_string(),
            reason: reason.to_string(),
        };
        if fails {
            return Err(unavailable("simulated outage"));
        }
        let mid = self
            .quote(symbol, jitter)
            .ok_or_else(|| unavailable("unlisted symbol"))?;

        let levels = depth.min(self.config.book_levels).max(1);
        let step = self.config.level_step_pct / 100.0;
        let mut bids = Vec::with_capacity(levels);
        let mut asks = Vec::with_capacity(levels);
        for i in 0..levels {
            let offset = step * (i as f64 + 0.5);
            let size = self.config.level_size * (1.0 + i as f64 * 0.5);
            bids.push(BookLevel::new(mid * (1.0 - offset), size));
            asks.push(BookLevel::new(mid * (1.0 + offset), size));
        }

        let mut book = OrderBook::new(symbol, bids, asks);
        book.timestamp = now_ms();
        Ok(book)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet(exchange: Exchange, premium_pct: f64) -> SimulatedExchange {
        SimulatedExchange::new(SimulatedExchangeConfig {
            exchange,
            premium_pct,
            jitter_pct: 0.0,
            failure_rate: 0.0,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn premium_is_applied_to_base_price() {
        let feed = quiet(Exchange::Bybit, 1.0);
        let quote = feed.get_price("BTCUSDT").await.unwrap();
        assert!((quote.price - 50_500.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn unknown_symbol_is_unavailable() {
        let feed = quiet(Exchange::Binance, 0.0);
        let err = feed.get_price("DOGEUSDT").await.unwrap_err();
        assert!(matches!(err, FeedError::PriceUnavailable { .. }));
    }

    #[tokio::test]
    async fn book_is_centered_on_quote() {
        let feed = quiet(Exchange::Coinbase, 0.0);
        let book = feed.get_order_book("ETHUSDT", 5).await.unwrap();
        assert_eq!(book.asks.len(), 5);
        assert_eq!(book.bids.len(), 5);
        let mid = book.mid_price().unwrap();
        assert!((mid - 3_000.0).abs() < 1e-6);
        assert!(book.best_ask().unwrap().price > mid);
    }

    #[tokio::test]
    async fn same_seed_replays_same_prices() {
        let a = SimulatedExchange::new(SimulatedExchangeConfig::default());
        let b = SimulatedExchange::new(SimulatedExchangeConfig::default());
        for _ in 0..5 {
            let pa = a.get_price("BTCUSDT").await.map(|q| q.price).ok();
            let pb = b.get_price("BTCUSDT").await.map(|q| q.price).ok();
            assert_eq!(pa, pb);
        }
    }

    #[tokio::test]
    async fn certain_failure_rate_always_fails() {
        let feed = SimulatedExchange::new(SimulatedExchangeConfig {
            failure_rate: 1.0,
            ..Default::default()
        });
        assert!(feed.get_price("BTCUSDT").await.is_err());
        assert!(feed.get_order_book("BTCUSDT", 5).await.is_err());
    }
}
