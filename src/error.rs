//! Typed errors for the exchange capability and the control surface

use thiserror::Error;

use crate::types::Exchange;

/// Failure of a single exchange call. Never fatal to a poll.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FeedError {
    #[error("{exchange}: price unavailable for {symbol}: {reason}")]
    PriceUnavailable {
        exchange: Exchange,
        symbol: String,
        reason: String,
    },

    #[error("{exchange}: order book unavailable for {symbol}: {reason}")]
    OrderBookUnavailable {
        exchange: Exchange,
        symbol: String,
        reason: String,
    },

    #[error("{exchange}: no response within {timeout_ms}ms")]
    Timeout { exchange: Exchange, timeout_ms: u64 },

    #[error("no price feed configured for {0}")]
    NotConfigured(Exchange),
}

/// Rejected request at the control surface
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ControlError {
    #[error("at least one symbol is required")]
    EmptySymbols,

    #[error("symbol must not be blank")]
    BlankSymbol,

    #[error("symbol {0} is listed more than once")]
    DuplicateSymbol(String),

    #[error("{field} must be a positive finite number (got {value})")]
    NotPositive { field: &'static str, value: f64 },

    #[error("{field} must be within [{min}, {max}] (got {value})")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("opportunity {id} has invalid prices (source {source_price}, target {target_price})")]
    InvalidOpportunity {
        id: String,
        source_price: f64,
        target_price: f64,
    },
}

impl ControlError {
    pub(crate) fn require_positive(field: &'static str, value: f64) -> Result<f64, Self> {
        if value.is_finite() && value > 0.0 {
            Ok(value)
        } else {
            Err(ControlError::NotPositive { field, value })
        }
    }

    pub(crate) fn require_range(
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    ) -> Result<f64, Self> {
        if value.is_finite() && value >= min && value <= max {
            Ok(value)
        } else {
            Err(ControlError::OutOfRange {
                field,
                value,
                min,
                max,
            })
        }
    }
}
