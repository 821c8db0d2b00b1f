//! Bounded rolling price history used for volatility estimation

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoryPoint {
    pub price: f64,
    pub timestamp: i64,
}

/// FIFO window of recent prices for one symbol
#[derive(Debug, Clone)]
pub struct PriceHistory {
    points: VecDeque<HistoryPoint>,
    capacity: usize,
}

impl PriceHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            points: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a price, evicting from the front once over capacity
    pub fn push(&mut self, price: f64, timestamp: i64) {
        self.points.push_back(HistoryPoint { price, timestamp });
        while self.points.len() > self.capacity {
            self.points.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn oldest(&self) -> Option<HistoryPoint> {
        self.points.front().copied()
    }

    /// Coefficient of variation in percent: population stddev / mean * 100.
    /// Returns 0 with fewer than 2 samples.
    pub fn volatility_pct(&self) -> f64 {
        let n = self.points.len();
        if n < 2 {
            return 0.0;
        }
        let mean = self.points.iter().map(|p| p.price).sum::<f64>() / n as f64;
        if mean <= 0.0 {
            return 0.0;
        }
        let variance = self
            .points
            .iter()
            .map(|p| (p.price - mean).powi(2))
            .sum::<f64>()
            / n as f64;
        variance.sqrt() / mean * 100.0
    }
}
