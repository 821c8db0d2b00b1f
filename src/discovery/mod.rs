//! Price Discovery - multi-exchange price aggregation
//!
//! Queries every configured exchange concurrently for each symbol, keeps a
//! bounded rolling history of the primary exchange's price for volatility
//! estimation, and computes pairwise spreads between the exchanges that
//! answered. A failing exchange only blanks its own price.

mod history;

pub use history::{HistoryPoint, PriceHistory};

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::FeedError;
use crate::exchange::{OrderBook, PriceFeed};
use crate::types::{now_ms, Exchange, PriceSample};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Samples kept per symbol for volatility
    pub history_capacity: usize,
    /// Upper bound on any single exchange call
    pub source_timeout_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            history_capacity: 100,
            source_timeout_ms: 3_000,
        }
    }
}

/// One exchange's answer for one symbol in one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcePrice {
    pub exchange: Exchange,
    /// None when the exchange failed or returned an unusable price
    pub price: Option<f64>,
    pub volume: Option<f64>,
    pub error: Option<String>,
}

impl SourcePrice {
    pub fn ok(exchange: Exchange, price: f64) -> Self {
        Self {
            exchange,
            price: Some(price),
            volume: None,
            error: None,
        }
    }

    pub fn failed(exchange: Exchange, error: impl Into<String>) -> Self {
        Self {
            exchange,
            price: None,
            volume: None,
            error: Some(error.into()),
        }
    }

    fn usable_price(&self) -> Option<f64> {
        self.price.filter(|p| p.is_finite() && *p > 0.0)
    }
}

/// Percentage spread between two exchanges: `(quote - base) / base * 100`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PairSpread {
    pub base: Exchange,
    pub quote: Exchange,
    pub base_price: f64,
    pub quote_price: f64,
    pub spread_pct: f64,
}

/// Everything discovered for one symbol in one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredPrice {
    pub symbol: String,
    pub timestamp: i64,
    pub prices: Vec<SourcePrice>,
    pub spreads: Vec<PairSpread>,
    pub volatility_pct: f64,
}

impl DiscoveredPrice {
    /// Build a snapshot from per-exchange answers, deriving the spreads
    pub fn new(
        symbol: impl Into<String>,
        prices: Vec<SourcePrice>,
        volatility_pct: f64,
        timestamp: i64,
    ) -> Self {
        let spreads = compute_spreads(&prices);
        Self {
            symbol: symbol.into(),
            timestamp,
            prices,
            spreads,
            volatility_pct,
        }
    }

    pub fn price(&self, exchange: Exchange) -> Option<f64> {
        self.prices
            .iter()
            .find(|p| p.exchange == exchange)
            .and_then(SourcePrice::usable_price)
    }

    /// Exchanges that did not produce a usable price this cycle
    pub fn outages(&self) -> Vec<Exchange> {
        self.prices
            .iter()
            .filter(|p| p.usable_price().is_none())
            .map(|p| p.exchange)
            .collect()
    }

    pub fn valid_source_count(&self) -> usize {
        self.prices
            .iter()
            .filter(|p| p.usable_price().is_some())
            .count()
    }

    pub fn samples(&self) -> Vec<PriceSample> {
        self.prices
            .iter()
            .filter_map(|p| {
                p.usable_price().map(|price| PriceSample {
                    symbol: self.symbol.clone(),
                    exchange: p.exchange,
                    price,
                    volume: p.volume,
                    timestamp: self.timestamp,
                })
            })
            .collect()
    }
}

/// Pairwise spreads over every pair of exchanges with a usable price,
/// in configured exchange order.
pub fn compute_spreads(prices: &[SourcePrice]) -> Vec<PairSpread> {
    let valid: Vec<(Exchange, f64)> = prices
        .iter()
        .filter_map(|p| p.usable_price().map(|price| (p.exchange, price)))
        .collect();

    let mut spreads = Vec::new();
    for (i, (base, base_price)) in valid.iter().enumerate() {
        for (quote, quote_price) in valid.iter().skip(i + 1) {
            spreads.push(PairSpread {
                base: *base,
                quote: *quote,
                base_price: *base_price,
                quote_price: *quote_price,
                spread_pct: (quote_price - base_price) / base_price * 100.0,
            });
        }
    }
    spreads
}

/// Price discovery across a fixed set of exchanges
pub struct PriceDiscovery {
    feeds: Vec<Arc<dyn PriceFeed>>,
    history: HashMap<String, PriceHistory>,
    config: DiscoveryConfig,
}

impl PriceDiscovery {
    /// The first feed is the primary (reference) exchange
    pub fn new(feeds: Vec<Arc<dyn PriceFeed>>, config: DiscoveryConfig) -> Self {
        Self {
            feeds,
            history: HashMap::new(),
            config,
        }
    }

    pub fn primary(&self) -> Option<Exchange> {
        self.feeds.first().map(|f| f.exchange())
    }

    pub fn exchanges(&self) -> Vec<Exchange> {
        self.feeds.iter().map(|f| f.exchange()).collect()
    }

    pub fn feed(&self, exchange: Exchange) -> Option<Arc<dyn PriceFeed>> {
        self.feeds.iter().find(|f| f.exchange() == exchange).cloned()
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.source_timeout_ms.max(1))
    }

    /// Discover prices for every symbol. Never fails: exchange errors are
    /// recorded per source and the symbol is returned with what answered.
    pub async fn discover(&mut self, symbols: &[String]) -> Vec<DiscoveredPrice> {
        let mut out = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            let prices = self.fetch_symbol(symbol).await;
            let timestamp = now_ms();

            if let Some(primary) = self.primary() {
                if let Some(price) = prices
                    .iter()
                    .find(|p| p.exchange == primary)
                    .and_then(SourcePrice::usable_price)
                {
                    self.record_price(symbol, price, timestamp);
                }
            }

            let discovered =
                DiscoveredPrice::new(symbol.clone(), prices, self.volatility_pct(symbol), timestamp);

            if discovered.valid_source_count() == 0 {
                warn!(symbol = %symbol, "No exchange returned a price");
            } else {
                debug!(
                    symbol = %symbol,
                    sources = discovered.valid_source_count(),
                    spreads = discovered.spreads.len(),
                    volatility_pct = discovered.volatility_pct,
                    "Prices discovered"
                );
            }
            out.push(discovered);
        }
        out
    }

    /// Query every feed for one symbol concurrently and join
    async fn fetch_symbol(&self, symbol: &str) -> Vec<SourcePrice> {
        let timeout = self.timeout();
        let calls = self.feeds.iter().map(|feed| {
            let feed = Arc::clone(feed);
            async move {
                let exchange = feed.exchange();
                let result = match tokio::time::timeout(timeout, feed.get_price(symbol)).await {
                    Ok(result) => result,
                    Err(_) => Err(FeedError::Timeout {
                        exchange,
                        timeout_ms: timeout.as_millis() as u64,
                    }),
                };
                match result {
                    Ok(quote) if quote.price.is_finite() && quote.price > 0.0 => SourcePrice {
                        exchange,
                        price: Some(quote.price),
                        volume: quote.volume,
                        error: None,
                    },
                    Ok(quote) => SourcePrice {
                        exchange,
                        price: None,
                        volume: None,
                        error: Some(format!("unusable price {}", quote.price)),
                    },
                    Err(e) => {
                        debug!(exchange = %exchange, symbol = %symbol, error = %e, "Price fetch failed");
                        SourcePrice {
                            exchange,
                            price: None,
                            volume: None,
                            error: Some(e.to_string()),
                        }
                    }
                }
            }
        });
        join_all(calls).await
    }

    /// Fetch an order book with the same timeout discipline as prices
    pub async fn order_book(
        &self,
        exchange: Exchange,
        symbol: &str,
        depth: usize,
    ) -> Result<OrderBook, FeedError> {
        let feed = self
            .feed(exchange)
            .ok_or(FeedError::NotConfigured(exchange))?;
        let timeout = self.timeout();
        match tokio::time::timeout(timeout, feed.get_order_book(symbol, depth)).await {
            Ok(result) => result,
            Err(_) => Err(FeedError::Timeout {
                exchange,
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Append a primary-exchange price to the symbol's rolling history
    pub fn record_price(&mut self, symbol: &str, price: f64, timestamp: i64) {
        let capacity = self.config.history_capacity;
        self.history
            .entry(symbol.to_string())
            .or_insert_with(|| PriceHistory::new(capacity))
            .push(price, timestamp);
    }

    pub fn history(&self, symbol: &str) -> Option<&PriceHistory> {
        self.history.get(symbol)
    }

    pub fn history_len(&self, symbol: &str) -> usize {
        self.history.get(symbol).map(|h| h.len()).unwrap_or(0)
    }

    /// Volatility in percent; 0 when fewer than 2 samples exist
    pub fn volatility_pct(&self, symbol: &str) -> f64 {
        self.history
            .get(symbol)
            .map(|h| h.volatility_pct())
            .unwrap_or(0.0)
    }
}
