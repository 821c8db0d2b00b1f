//! Exchange capability - price and order-book sources
//!
//! Every exchange the pipeline talks to implements [`PriceFeed`]. The
//! simulated implementation stands in for real exchange clients; the fixed
//! implementation serves scripted quotes.

mod fixed;
mod orderbook;
mod simulated;

pub use fixed::FixedExchange;
pub use orderbook::{BookLevel, LiquidityEstimate, OrderBook};
pub use simulated::{default_base_prices, SimulatedExchange, SimulatedExchangeConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::FeedError;
use crate::types::Exchange;

/// Last traded price for a symbol on one exchange
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub price: f64,
    pub volume: Option<f64>,
}

/// Trait for price source clients
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Which exchange this feed quotes
    fn exchange(&self) -> Exchange;

    /// Current price for a symbol
    async fn get_price(&self, symbol: &str) -> Result<PriceQuote, FeedError>;

    /// Order book with up to `depth` levels per side
    async fn get_order_book(&self, symbol: &str, depth: usize) -> Result<OrderBook, FeedError>;
}
