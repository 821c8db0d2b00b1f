//! Execution Engine - simulated two-leg arbitrage with partial fills
//!
//! The buy leg fills in full at the source price plus a small random
//! premium. The sell leg walks the target exchange's ask ladder for the
//! bought quantity. Fill ratios under the rollback threshold emit a
//! rollback event; the hedge itself is recorded but not placed.

use anyhow::{anyhow, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use tracing::{error, info, warn};

use crate::arbitrage::Opportunity;
use crate::audit::{AuditAction, AuditLog};
use crate::discovery::PriceDiscovery;
use crate::portfolio::Portfolio;
use crate::types::{now_ms, Exchange};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Fee per leg, percent of notional
    pub fee_pct: f64,
    /// Upper bound of the random buy premium, percent
    pub max_buy_slippage_pct: f64,
    /// Fill ratio under which a rollback is triggered
    pub rollback_fill_ratio: f64,
    pub order_book_depth: usize,
    /// Keep at most this many execution records
    pub log_capacity: Option<usize>,
    /// Seed for the buy premium; entropy when unset
    pub seed: Option<u64>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            fee_pct: 0.1,
            max_buy_slippage_pct: 0.05,
            rollback_fill_ratio: 0.9,
            order_book_depth: 20,
            log_capacity: None,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Executing,
    Filled,
    Partial,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub symbol: String,
    pub status: ExecutionStatus,
    pub buy_exchange: Exchange,
    pub sell_exchange: Exchange,
    pub buy_price: f64,
    pub buy_qty: f64,
    pub sell_price: Option<f64>,
    pub sell_qty: Option<f64>,
    pub profit: Option<f64>,
    pub partial_fill: Option<bool>,
    #[serde(default)]
    pub rollback_triggered: bool,
    pub created_at: i64,
    pub completed_at: Option<i64>,
    pub error: Option<String>,
}

/// Execution records in creation order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLog {
    records: VecDeque<ExecutionRecord>,
    capacity: Option<usize>,
}

impl ExecutionLog {
    /// A capacity of zero is raised to one so the newest record is always kept
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            records: VecDeque::new(),
            capacity: capacity.map(|c| c.max(1)),
        }
    }

    /// Apply a new capacity, trimming the oldest records beyond it
    pub fn set_capacity(&mut self, capacity: Option<usize>) {
        self.capacity = capacity.map(|c| c.max(1));
        self.trim();
    }

    pub fn push(&mut self, record: ExecutionRecord) {
        self.records.push_back(record);
        self.trim();
    }

    fn trim(&mut self) {
        if let Some(cap) = self.capacity {
            while self.records.len() > cap {
                self.records.pop_front();
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&ExecutionRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut ExecutionRecord> {
        self.records.iter_mut().find(|r| r.id == id)
    }

    pub fn records(&self) -> impl Iterator<Item = &ExecutionRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub execution_id: String,
    pub buy_price: f64,
    pub buy_qty: f64,
    pub avg_sell_price: f64,
    pub filled_qty: f64,
    pub fill_ratio: f64,
    pub net_profit: f64,
    pub slippage_pct: f64,
    pub partial_fill: bool,
    pub rollback_triggered: bool,
    /// Id of the final audit entry for this execution
    pub audit_id: String,
    pub error: Option<String>,
}

/// Mutable state an execution reads and updates
pub struct ExecutionContext<'a> {
    pub discovery: &'a PriceDiscovery,
    pub portfolio: &'a mut Portfolio,
    pub audit: &'a mut AuditLog,
    pub log: &'a mut ExecutionLog,
}

pub struct ExecutionEngine {
    config: ExecutionConfig,
    rng: StdRng,
}

impl ExecutionEngine {
    pub fn new(config: ExecutionConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { config, rng }
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Execute `opportunity` with `allocated_amount` of quote currency.
    /// Never returns an error: failures come back as `success: false`.
    pub async fn execute(
        &mut self,
        ctx: &mut ExecutionContext<'_>,
        opportunity: &Opportunity,
        allocated_amount: f64,
    ) -> ExecutionResult {
        let execution_id = uuid::Uuid::new_v4().to_string();
        match self
            .run(ctx, &execution_id, opportunity, allocated_amount)
            .await
        {
            Ok(result) => result,
            Err(e) => Self::fail(ctx, &execution_id, opportunity, e),
        }
    }

    async fn run(
        &mut self,
        ctx: &mut ExecutionContext<'_>,
        execution_id: &str,
        opportunity: &Opportunity,
        allocated_amount: f64,
    ) -> Result<ExecutionResult> {
        opportunity.validate()?;
        if !(allocated_amount.is_finite() && allocated_amount > 0.0) {
            return Err(anyhow!("allocated amount {} is not positive", allocated_amount));
        }
        let symbol = opportunity.symbol.as_str();
        let fee_rate = self.config.fee_pct / 100.0;

        // Buy leg
        let buy_qty = allocated_amount / opportunity.source_price;
        let premium_pct = if self.config.max_buy_slippage_pct > 0.0 {
            self.rng.gen_range(0.0..=self.config.max_buy_slippage_pct)
        } else {
            0.0
        };
        let buy_price = opportunity.source_price * (1.0 + premium_pct / 100.0);
        let buy_fee = buy_price * buy_qty * fee_rate;

        ctx.log.push(ExecutionRecord {
            id: execution_id.to_string(),
            symbol: opportunity.symbol.clone(),
            status: ExecutionStatus::Executing,
            buy_exchange: opportunity.buy_exchange(),
            sell_exchange: opportunity.sell_exchange(),
            buy_price,
            buy_qty,
            sell_price: None,
            sell_qty: None,
            profit: None,
            partial_fill: None,
            rollback_triggered: false,
            created_at: now_ms(),
            completed_at: None,
            error: None,
        });
        ctx.audit.record(
            AuditAction::OrderPlaced,
            Some(symbol),
            json!({
                "execution_id": execution_id,
                "exchange": opportunity.buy_exchange(),
                "side": "buy",
                "price": buy_price,
                "qty": buy_qty,
                "fee": buy_fee,
                "premium_pct": premium_pct,
            }),
        );

        // Sell leg against the target ask ladder
        let book = ctx
            .discovery
            .order_book(
                opportunity.sell_exchange(),
                symbol,
                self.config.order_book_depth,
            )
            .await?;
        let fill = book.walk_asks(buy_qty);
        let filled_qty = fill.fillable_qty;
        let avg_sell_price = fill.expected_avg_price;
        let fill_ratio = fill.fill_ratio(buy_qty);
        let partial_fill = fill_ratio < 1.0;
        if let Some(record) = ctx.log.get_mut(execution_id) {
            record.sell_qty = Some(filled_qty);
            record.partial_fill = Some(partial_fill);
        }

        ctx.audit.record(
            AuditAction::SellSimulated,
            Some(symbol),
            json!({
                "execution_id": execution_id,
                "exchange": opportunity.sell_exchange(),
                "avg_price": avg_sell_price,
                "filled_qty": filled_qty,
                "target_qty": buy_qty,
                "fill_ratio": fill_ratio,
            }),
        );

        let rollback_triggered = fill_ratio < self.config.rollback_fill_ratio;
        if rollback_triggered {
            let unfilled_qty = buy_qty - filled_qty;
            warn!(
                execution_id,
                symbol,
                fill_ratio,
                unfilled_qty,
                "Fill ratio below rollback threshold"
            );
            if let Some(record) = ctx.log.get_mut(execution_id) {
                record.rollback_triggered = true;
            }
            ctx.audit.record(
                AuditAction::RollbackTriggered,
                Some(symbol),
                json!({
                    "execution_id": execution_id,
                    "fill_ratio": fill_ratio,
                    "threshold": self.config.rollback_fill_ratio,
                    "unfilled_qty": unfilled_qty,
                    "hedge": {
                        "exchange": opportunity.buy_exchange(),
                        "side": "sell",
                        "qty": unfilled_qty,
                        "placed": false,
                    },
                }),
            );
        }

        if filled_qty <= 0.0 {
            return Err(anyhow!(
                "no liquidity on {} for {}",
                opportunity.sell_exchange(),
                symbol
            ));
        }

        let sell_fee = avg_sell_price * filled_qty * fee_rate;
        let net_profit = (avg_sell_price * filled_qty - sell_fee) - (buy_price * buy_qty + buy_fee);
        let slippage_pct =
            (avg_sell_price - opportunity.target_price) / opportunity.target_price * 100.0;

        let completed_at = now_ms();
        if let Some(record) = ctx.log.get_mut(execution_id) {
            record.sell_price = Some(avg_sell_price);
            record.sell_qty = Some(filled_qty);
            record.profit = Some(net_profit);
            record.partial_fill = Some(partial_fill);
            record.status = ExecutionStatus::Completed;
            record.completed_at = Some(completed_at);
        }
        ctx.portfolio.apply_pnl(net_profit);

        let audit_id = ctx.audit.record(
            AuditAction::ExecutionCompleted,
            Some(symbol),
            json!({
                "execution_id": execution_id,
                "action": opportunity.action.to_string(),
                "buy_price": buy_price,
                "buy_qty": buy_qty,
                "avg_sell_price": avg_sell_price,
                "filled_qty": filled_qty,
                "net_profit": net_profit,
                "slippage_pct": slippage_pct,
                "partial_fill": partial_fill,
                "rollback_triggered": rollback_triggered,
                "cash_after": ctx.portfolio.cash,
            }),
        );

        info!(
            execution_id,
            symbol,
            action = %opportunity.action,
            net_profit = %format!("${:.2}", net_profit),
            fill_ratio,
            "Execution completed"
        );

        Ok(ExecutionResult {
            success: true,
            execution_id: execution_id.to_string(),
            buy_price,
            buy_qty,
            avg_sell_price,
            filled_qty,
            fill_ratio,
            net_profit,
            slippage_pct,
            partial_fill,
            rollback_triggered,
            audit_id,
            error: None,
        })
    }

    fn fail(
        ctx: &mut ExecutionContext<'_>,
        execution_id: &str,
        opportunity: &Opportunity,
        err: anyhow::Error,
    ) -> ExecutionResult {
        let message = format!("{:#}", err);
        error!(execution_id, symbol = %opportunity.symbol, error = %message, "Execution failed");

        let mut result = ExecutionResult {
            success: false,
            execution_id: execution_id.to_string(),
            error: Some(message.clone()),
            ..Default::default()
        };
        if let Some(record) = ctx.log.get_mut(execution_id) {
            record.status = ExecutionStatus::Failed;
            record.error = Some(message.clone());
            record.completed_at = Some(now_ms());
            result.buy_price = record.buy_price;
            result.buy_qty = record.buy_qty;
            result.rollback_triggered = record.rollback_triggered;
            // false when the sell leg was never walked
            result.partial_fill = record.partial_fill.unwrap_or(false);
        }
        result.audit_id = ctx.audit.record(
            AuditAction::ExecutionFailed,
            Some(&opportunity.symbol),
            json!({
                "execution_id": execution_id,
                "action": opportunity.action.to_string(),
                "error": message,
            }),
        );
        result
    }
}

impl Default for ExecutionEngine {
    fn default() -> Self {
        Self::new(ExecutionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbitrage::fixtures::btc_opportunity;
    use crate::audit::AuditFilter;
    use crate::discovery::DiscoveryConfig;
    use crate::exchange::{BookLevel, FixedExchange, OrderBook, PriceFeed};
    use std::sync::Arc;

    struct Harness {
        discovery: PriceDiscovery,
        portfolio: Portfolio,
        audit: AuditLog,
        log: ExecutionLog,
    }

    impl Harness {
        fn new(sell_book: Option<OrderBook>) -> Self {
            let mut bybit = FixedExchange::new(Exchange::Bybit).with_price("BTCUSDT", 50_750.0);
            if let Some(book) = sell_book {
                bybit = bybit.with_order_book(book);
            }
            let discovery = PriceDiscovery::new(
                vec![
                    Arc::new(FixedExchange::new(Exchange::Binance).with_price("BTCUSDT", 50_000.0))
                        as Arc<dyn PriceFeed>,
                    Arc::new(bybit),
                ],
                DiscoveryConfig::default(),
            );
            Self {
                discovery,
                portfolio: Portfolio::new(100_000.0),
                audit: AuditLog::new(),
                log: ExecutionLog::default(),
            }
        }

        async fn execute(&mut self, engine: &mut ExecutionEngine, amount: f64) -> ExecutionResult {
            let mut ctx = ExecutionContext {
                discovery: &self.discovery,
                portfolio: &mut self.portfolio,
                audit: &mut self.audit,
                log: &mut self.log,
            };
            engine.execute(&mut ctx, &btc_opportunity(), amount).await
        }

        fn count(&self, action: AuditAction) -> usize {
            self.audit.query(&AuditFilter::action(action)).len()
        }
    }

    fn engine() -> ExecutionEngine {
        ExecutionEngine::new(ExecutionConfig {
            seed: Some(42),
            ..Default::default()
        })
    }

    fn book(ask_size: f64) -> OrderBook {
        OrderBook::new(
            "BTCUSDT",
            vec![BookLevel::new(50_740.0, ask_size)],
            vec![BookLevel::new(50_760.0, ask_size)],
        )
    }

    #[tokio::test]
    async fn full_fill_books_profit() {
        let mut h = Harness::new(Some(book(5.0)));
        let mut engine = engine();
        let result = h.execute(&mut engine, 10_000.0).await;

        assert!(result.success, "{:?}", result.error);
        assert!((result.buy_qty - 0.2).abs() < 1e-12);
        assert!(result.buy_price >= 50_000.0 && result.buy_price <= 50_025.0);
        assert_eq!(result.filled_qty, result.buy_qty);
        assert!(!result.partial_fill);
        assert!(!result.rollback_triggered);

        let buy_cost = result.buy_price * result.buy_qty * 1.001;
        let proceeds = result.avg_sell_price * result.filled_qty * 0.999;
        assert!((result.net_profit - (proceeds - buy_cost)).abs() < 1e-6);
        assert!(result.net_profit > 0.0);
        assert!((h.portfolio.cash - (100_000.0 + result.net_profit)).abs() < 1e-6);

        let record = h.log.get(&result.execution_id).unwrap();
        assert_eq!(record.status, ExecutionStatus::Completed);
        assert_eq!(h.count(AuditAction::OrderPlaced), 1);
        assert_eq!(h.count(AuditAction::SellSimulated), 1);
        assert_eq!(h.count(AuditAction::ExecutionCompleted), 1);
        assert_eq!(h.count(AuditAction::RollbackTriggered), 0);
        assert_eq!(
            h.audit.get(&result.audit_id).unwrap().action,
            AuditAction::ExecutionCompleted
        );
    }

    #[tokio::test]
    async fn shallow_book_partially_fills_and_rolls_back() {
        let mut h = Harness::new(Some(book(0.1)));
        let mut engine = engine();
        let result = h.execute(&mut engine, 10_000.0).await;

        assert!(result.success);
        assert!(result.filled_qty < result.buy_qty);
        assert!(result.partial_fill);
        assert!((result.fill_ratio - 0.5).abs() < 1e-9);
        assert!(result.rollback_triggered);
        assert_eq!(h.count(AuditAction::RollbackTriggered), 1);
        assert!(h.log.get(&result.execution_id).unwrap().rollback_triggered);
    }

    #[tokio::test]
    async fn slight_underfill_is_partial_without_rollback() {
        let mut h = Harness::new(Some(book(0.19)));
        let mut engine = engine();
        let result = h.execute(&mut engine, 10_000.0).await;
        assert!(result.partial_fill);
        assert!(!result.rollback_triggered);
        assert_eq!(h.count(AuditAction::RollbackTriggered), 0);
    }

    #[tokio::test]
    async fn missing_book_fails_without_touching_portfolio() {
        let mut h = Harness::new(None);
        let mut engine = engine();
        let result = h.execute(&mut engine, 10_000.0).await;

        assert!(!result.success);
        assert!(result.error.is_some());
        assert_eq!(h.portfolio.cash, 100_000.0);
        assert_eq!(
            h.log.get(&result.execution_id).unwrap().status,
            ExecutionStatus::Failed
        );
        assert_eq!(h.count(AuditAction::ExecutionFailed), 1);
        assert_eq!(h.count(AuditAction::ExecutionCompleted), 0);
    }

    #[tokio::test]
    async fn empty_ask_side_rolls_back_then_fails() {
        let empty = OrderBook::new("BTCUSDT", vec![BookLevel::new(50_740.0, 1.0)], vec![]);
        let mut h = Harness::new(Some(empty));
        let mut engine = engine();
        let result = h.execute(&mut engine, 10_000.0).await;

        assert!(!result.success);
        assert!(result.rollback_triggered);
        assert_eq!(h.count(AuditAction::RollbackTriggered), 1);
        assert_eq!(h.count(AuditAction::ExecutionFailed), 1);
        assert_eq!(h.portfolio.cash, 100_000.0);
    }

    #[tokio::test]
    async fn non_positive_amount_fails() {
        let mut h = Harness::new(Some(book(5.0)));
        let mut engine = engine();
        let result = h.execute(&mut engine, 0.0).await;
        assert!(!result.success);
        assert!(h.log.is_empty());
        assert_eq!(h.count(AuditAction::ExecutionFailed), 1);
    }

    #[test]
    fn log_capacity_drops_oldest() {
        let mut log = ExecutionLog::new(Some(2));
        for i in 0..3 {
            log.push(ExecutionRecord {
                id: format!("e{}", i),
                symbol: "BTCUSDT".to_string(),
                status: ExecutionStatus::Completed,
                buy_exchange: Exchange::Binance,
                sell_exchange: Exchange::Bybit,
                buy_price: 1.0,
                buy_qty: 1.0,
                sell_price: None,
                sell_qty: None,
                profit: None,
                partial_fill: None,
                rollback_triggered: false,
                created_at: 0,
                completed_at: None,
                error: None,
            });
        }
        assert_eq!(log.len(), 2);
        assert!(log.get("e0").is_none());
    }

    #[tokio::test]
    async fn zero_capacity_log_still_tracks_the_running_execution() {
        let mut h = Harness::new(None);
        h.log = ExecutionLog::new(Some(0));
        let mut engine = engine();
        let result = h.execute(&mut engine, 10_000.0).await;

        assert!(!result.success);
        assert_eq!(h.log.len(), 1);
        let record = h.log.get(&result.execution_id).unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert!(record.error.is_some());
    }

    #[tokio::test]
    async fn failure_reports_partial_fill_only_after_the_sell_walk() {
        let mut h = Harness::new(None);
        let mut engine = engine();
        let before_walk = h.execute(&mut engine, 10_000.0).await;
        assert!(!before_walk.partial_fill);
        assert_eq!(
            h.log.get(&before_walk.execution_id).unwrap().partial_fill,
            None
        );

        let empty = OrderBook::new("BTCUSDT", vec![BookLevel::new(50_740.0, 1.0)], vec![]);
        let mut h = Harness::new(Some(empty));
        let after_walk = h.execute(&mut engine, 10_000.0).await;
        assert!(!after_walk.success);
        assert!(after_walk.partial_fill);
        let record = h.log.get(&after_walk.execution_id).unwrap();
        assert_eq!(record.partial_fill, Some(true));
        assert_eq!(record.sell_qty, Some(0.0));
    }
}
