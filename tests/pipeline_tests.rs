//! End-to-end tests for the arbitrage pipeline

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crossarb::audit::{AuditAction, AuditFilter};
    use crossarb::config::AppConfig;
    use crossarb::exchange::{BookLevel, FixedExchange, OrderBook, PriceFeed};
    use crossarb::execution::ExecutionStatus;
    use crossarb::guardian::GuardianConfigUpdate;
    use crossarb::persistence::{JsonFileStore, MemoryStore, StateStore};
    use crossarb::runner::{OpportunityOutcome, Runner};
    use crossarb::types::{Exchange, TradeAction};

    // ============================================================================
    // Fixtures
    // ============================================================================

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.runner.symbols = vec!["BTCUSDT".to_string()];
        config.runner.poll_interval_ms = 20;
        config.runner.state_file = None;
        config.detector.min_persistence_count = 2;
        config.execution.seed = Some(42);
        config
    }

    /// Binance at 50000, Bybit at 50750 with the given ask depth
    fn feeds(ask_size: f64) -> (Arc<FixedExchange>, Arc<FixedExchange>) {
        let book = OrderBook::new(
            "BTCUSDT",
            vec![BookLevel::new(50_740.0, ask_size)],
            vec![BookLevel::new(50_760.0, ask_size)],
        );
        let binance = Arc::new(FixedExchange::new(Exchange::Binance).with_price("BTCUSDT", 50_000.0));
        let bybit = Arc::new(
            FixedExchange::new(Exchange::Bybit)
                .with_price("BTCUSDT", 50_750.0)
                .with_order_book(book),
        );
        (binance, bybit)
    }

    fn runner_with(config: AppConfig, ask_size: f64, store: Arc<dyn StateStore>) -> Runner {
        let (binance, bybit) = feeds(ask_size);
        Runner::builder(config)
            .with_feeds(vec![binance as Arc<dyn PriceFeed>, bybit as Arc<dyn PriceFeed>])
            .with_state_store(store)
            .build()
            .unwrap()
    }

    fn temp_path() -> std::path::PathBuf {
        std::env::temp_dir()
            .join(format!("crossarb_it_{}", uuid::Uuid::new_v4()))
            .join("state.json")
    }

    // ============================================================================
    // Full chain
    // ============================================================================

    #[tokio::test]
    async fn persistent_spread_is_executed_end_to_end() {
        let runner = runner_with(config(), 5.0, Arc::new(MemoryStore::new()));

        let first = runner.poll_once().await.unwrap();
        assert_eq!(first.opportunities, 0);

        let second = runner.poll_once().await.unwrap();
        assert_eq!(second.opportunities, 1);
        assert_eq!(second.outcomes[0].1, OpportunityOutcome::Executed);

        let enhanced = runner.snapshot().await.audit;
        let entry = enhanced.enhanced().next().unwrap();
        let opportunity = &entry.opportunity;
        assert_eq!(
            opportunity.action,
            TradeAction::new(Exchange::Binance, Exchange::Bybit)
        );
        assert!((opportunity.spread_pct - 1.5).abs() < 1e-9);
        assert!((opportunity.estimated_gross_profit_pct - 1.2).abs() < 1e-9);

        let risk = entry.risk.as_ref().unwrap();
        assert!(risk.risk_score < 50.0, "risk {}", risk.risk_score);

        let allocation = entry.allocation.as_ref().unwrap();
        assert_eq!(allocation.allocation_pct, 0.10);
        assert!((allocation.allocated_amount - 10_000.0).abs() < 1e-6);

        assert!(entry.guardian.as_ref().unwrap().pass);

        let execution = entry.execution.as_ref().unwrap();
        assert!(execution.success);
        assert!(!execution.rollback_triggered);
        assert_eq!(execution.fill_ratio, 1.0);
        let buy_cost = execution.buy_price * execution.buy_qty * 1.001;
        let proceeds = execution.avg_sell_price * execution.filled_qty * 0.999;
        assert!((execution.net_profit - (proceeds - buy_cost)).abs() < 1e-6);
        assert!(execution.net_profit > 0.0);
        assert_eq!(entry.outcome, "executed");

        let portfolio = runner.portfolio().await;
        assert!((portfolio.cash - (100_000.0 + execution.net_profit)).abs() < 1e-6);

        let executions = runner.executions().await;
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn audit_trail_follows_pipeline_order() {
        let runner = runner_with(config(), 5.0, Arc::new(MemoryStore::new()));
        runner.poll_once().await;
        runner.poll_once().await;

        let actions: Vec<AuditAction> = runner
            .query_audit_log(&AuditFilter {
                symbol: Some("BTCUSDT".to_string()),
                ..Default::default()
            })
            .await
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(
            actions,
            vec![
                AuditAction::OpportunityDetected,
                AuditAction::RiskAssessed,
                AuditAction::CapitalAllocated,
                AuditAction::DebateConcluded,
                AuditAction::GuardianPassed,
                AuditAction::OrderPlaced,
                AuditAction::SellSimulated,
                AuditAction::ExecutionCompleted,
            ]
        );
    }

    #[tokio::test]
    async fn thin_book_triggers_rollback_but_keeps_partial_fill() {
        let mut config = config();
        config.debate.threshold = 0.5;
        let runner = runner_with(config, 0.05, Arc::new(MemoryStore::new()));
        runner.poll_once().await;
        let summary = runner.poll_once().await.unwrap();
        assert_eq!(summary.outcomes[0].1, OpportunityOutcome::Executed);

        let rollbacks = runner
            .query_audit_log(&AuditFilter::action(AuditAction::RollbackTriggered))
            .await;
        assert_eq!(rollbacks.len(), 1);
        assert_eq!(rollbacks[0].details["hedge"]["placed"], false);

        let executions = runner.executions().await;
        assert!(executions[0].rollback_triggered);
        assert_eq!(executions[0].partial_fill, Some(true));
    }

    #[tokio::test]
    async fn guardian_daily_limit_stops_second_trade() {
        let runner = runner_with(config(), 5.0, Arc::new(MemoryStore::new()));
        runner
            .update_guardian_config(GuardianConfigUpdate {
                daily_max_trades: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();

        runner.poll_once().await;
        let second = runner.poll_once().await.unwrap();
        assert_eq!(second.executed, 1);
        let third = runner.poll_once().await.unwrap();
        assert_eq!(third.outcomes[0].1, OpportunityOutcome::GuardianVetoed);

        let vetoes = runner
            .query_audit_log(&AuditFilter::action(AuditAction::GuardianVetoed))
            .await;
        assert!(vetoes[0].details["reason"]
            .as_str()
            .unwrap()
            .contains("daily trade limit"));
    }

    #[tokio::test]
    async fn offline_exchange_yields_no_opportunity() {
        let (binance, bybit) = feeds(5.0);
        let runner = Runner::builder(config())
            .with_feeds(vec![
                binance as Arc<dyn PriceFeed>,
                Arc::clone(&bybit) as Arc<dyn PriceFeed>,
            ])
            .build()
            .unwrap();

        bybit.set_offline(true);
        runner.poll_once().await;
        let summary = runner.poll_once().await.unwrap();
        assert_eq!(summary.opportunities, 0);
        assert_eq!(runner.status().await.executions_attempted, 0);
    }

    // ============================================================================
    // Lifecycle
    // ============================================================================

    #[tokio::test]
    async fn runner_lifecycle_is_idempotent() {
        let runner = runner_with(config(), 5.0, Arc::new(MemoryStore::new()));
        assert!(!runner.status().await.is_running);

        let started = runner.start(None).await.unwrap();
        assert!(started.started);
        assert_eq!(started.poll_interval_ms, 20);
        assert!(!runner.start(None).await.unwrap().started);
        assert!(runner.status().await.is_running);

        tokio::time::sleep(Duration::from_millis(120)).await;

        let stopped = runner.stop().await;
        assert!(stopped.stopped);
        assert!(stopped.stats.poll_count >= 2);
        assert!(stopped.stats.executions_successful >= 1);
        assert!(!stopped.stats.is_running);

        let status = runner.status().await;
        assert_eq!(status, runner.status().await);
        assert_eq!(status.poll_count, stopped.stats.poll_count);
        assert!(!runner.stop().await.stopped);

        let lifecycle: Vec<AuditAction> = runner
            .query_audit_log(&AuditFilter::default())
            .await
            .into_iter()
            .map(|e| e.action)
            .filter(|a| matches!(a, AuditAction::RunnerStarted | AuditAction::RunnerStopped))
            .collect();
        assert_eq!(lifecycle, vec![AuditAction::RunnerStarted, AuditAction::RunnerStopped]);
    }

    #[tokio::test]
    async fn restart_resets_run_statistics() {
        let runner = runner_with(config(), 5.0, Arc::new(MemoryStore::new()));
        runner.start(Some(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        runner.stop().await;

        runner.start(Some(10_000)).await.unwrap();
        let status = runner.status().await;
        assert!(status.is_running);
        assert!(status.poll_count <= 1);
        runner.stop().await;
    }

    // ============================================================================
    // Persistence
    // ============================================================================

    #[tokio::test]
    async fn state_survives_restart() {
        let path = temp_path();
        let store: Arc<dyn StateStore> = Arc::new(JsonFileStore::new(&path));

        let runner = runner_with(config(), 5.0, Arc::clone(&store));
        runner
            .update_guardian_config(GuardianConfigUpdate {
                daily_max_trades: Some(7),
                ..Default::default()
            })
            .await
            .unwrap();
        runner.poll_once().await;
        runner.poll_once().await;
        let before = runner.snapshot().await;
        drop(runner);

        let restored = runner_with(config(), 5.0, Arc::new(JsonFileStore::new(&path)));
        let after = restored.snapshot().await;
        assert_eq!(after.portfolio, before.portfolio);
        assert_eq!(after.audit.len(), before.audit.len());
        assert_eq!(after.executions.len(), 1);
        assert_eq!(after.guardian.daily_max_trades, 7);
        assert_eq!(after.runner.poll_count, 2);
        assert!(!after.runner.is_running);

        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    #[tokio::test]
    async fn audit_export_writes_every_entry() {
        let runner = runner_with(config(), 5.0, Arc::new(MemoryStore::new()));
        runner.poll_once().await;
        runner.poll_once().await;

        let path = temp_path().with_file_name("audit.csv");
        let rows = runner.export_audit_csv(&path).await.unwrap();
        assert_eq!(rows, runner.snapshot().await.audit.len());
        let csv = std::fs::read_to_string(&path).unwrap();
        assert!(csv.starts_with("id,timestamp,action,symbol,details"));

        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }
}
