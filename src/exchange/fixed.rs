//! Exchange serving scripted quotes and books

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use super::{OrderBook, PriceFeed, PriceQuote};
use crate::error::FeedError;
use crate::types::Exchange;

/// Feed whose prices and books are set explicitly. Useful for replays and
/// for driving the pipeline through known scenarios.
pub struct FixedExchange {
    exchange: Exchange,
    prices: RwLock<HashMap<String, f64>>,
    books: RwLock<HashMap<String, OrderBook>>,
    offline: RwLock<bool>,
}

impl FixedExchange {
    pub fn new(exchange: Exchange) -> Self {
        Self {
            exchange,
            prices: RwLock::new(HashMap::new()),
            books: RwLock::new(HashMap::new()),
            offline: RwLock::new(false),
        }
    }

    pub fn with_price(self, symbol: &str, price: f64) -> Self {
        self.set_price(symbol, price);
        self
    }

    pub fn with_order_book(self, book: OrderBook) -> Self {
        self.set_order_book(book);
        self
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        if let Ok(mut prices) = self.prices.write() {
            prices.insert(symbol.to_string(), price);
        }
    }

    pub fn set_order_book(&self, book: OrderBook) {
        if let Ok(mut books) = self.books.write() {
            books.insert(book.symbol.clone(), book);
        }
    }

    /// Simulate an outage: every call fails until brought back online
    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut flag) = self.offline.write() {
            *flag = offline;
        }
    }

    fn is_offline(&self) -> bool {
        self.offline.read().map(|f| *f).unwrap_or(false)
    }
}

#[async_trait]
impl PriceFeed for FixedExchange {
    fn exchange(&self) -> Exchange {
        self.exchange
    }

    async fn get_price(&self, symbol: &str) -> Result<PriceQuote, FeedError> {
        let unavailable = |reason: &str| FeedError::PriceUnavailable {
            exchange: self.exchange,
            symbol: symbol.to_string(),
            reason: reason.to_string(),
        };
        if self.is_offline() {
            return Err(unavailable("offline"));
        }
        let price = self
            .prices
            .read()
            .ok()
            .and_then(|p| p.get(symbol).copied())
            .ok_or_else(|| unavailable("no quote"))?;
        Ok(PriceQuote {
            price,
            volume: None,
        })
    }

    async fn get_order_book(&self, symbol: &str, depth: usize) -> Result<OrderBook, FeedError> {
        let unavailable = |reason: &str| FeedError::OrderBookUnavailable {
            exchange: self.exchange,
            symbol: symbol.to_string(),
            reason: reason.to_string(),
        };
        if self.is_offline() {
            return Err(unavailable("offline"));
        }
        let mut book = self
            .books
            .read()
            .ok()
            .and_then(|b| b.get(symbol).cloned())
            .ok_or_else(|| unavailable("no book"))?;
        book.bids.truncate(depth);
        book.asks.truncate(depth);
        Ok(book)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::BookLevel;

    #[tokio::test]
    async fn serves_scripted_quote_and_truncated_book() {
        let book = OrderBook::new(
            "BTCUSDT",
            vec![BookLevel::new(49_990.0, 1.0)],
            vec![
                BookLevel::new(50_010.0, 1.0),
                BookLevel::new(50_020.0, 1.0),
                BookLevel::new(50_030.0, 1.0),
            ],
        );
        let feed = FixedExchange::new(Exchange::Bybit)
            .with_price("BTCUSDT", 50_000.0)
            .with_order_book(book);

        assert_eq!(feed.get_price("BTCUSDT").await.unwrap().price, 50_000.0);
        let served = feed.get_order_book("BTCUSDT", 2).await.unwrap();
        assert_eq!(served.asks.len(), 2);
    }

    #[test]
    fn offline_feed_fails_every_call() {
        let feed = FixedExchange::new(Exchange::Binance).with_price("BTCUSDT", 1.0);
        feed.set_offline(true);
        assert!(tokio_test::block_on(feed.get_price("BTCUSDT")).is_err());
        assert!(tokio_test::block_on(feed.get_order_book("BTCUSDT", 5)).is_err());
        feed.set_offline(false);
        assert!(tokio_test::block_on(feed.get_price("BTCUSDT")).is_ok());
    }
}
