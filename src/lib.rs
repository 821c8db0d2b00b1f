//! CrossArb Library
//!
//! Simulated cross-exchange arbitrage: price discovery across exchanges,
//! persistence-gated opportunity detection, risk scoring, capital
//! allocation, consensus gating, a guardian veto and two-leg execution.

pub mod allocation;
pub mod arbitrage;
pub mod audit;
pub mod config;
pub mod debate;
pub mod discovery;
pub mod error;
pub mod exchange;
pub mod execution;
pub mod guardian;
pub mod persistence;
pub mod portfolio;
pub mod risk;
pub mod runner;
pub mod types;

pub use config::AppConfig;
pub use error::{ControlError, FeedError};
pub use runner::{Runner, RunnerBuilder, RunnerState};
pub use types::{Exchange, TradeAction};
