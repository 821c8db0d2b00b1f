//! Runner - the polling orchestrator and control surface
//!
//! Lifecycle is stopped -> running -> stopped. While running, a background
//! task polls on a fixed interval (first poll immediately). Polls never
//! overlap: a poll requested while another is in flight is skipped with a
//! warning. Stopping prevents future polls and waits for an in-flight one
//! to finish before freezing and persisting the run statistics.

mod pipeline;

pub use pipeline::{OpportunityOutcome, Pipeline, PollSummary};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::allocation::{
    AllocationCandidate, AllocationResult, CapitalAllocator, PortfolioAllocationPlan,
    PortfolioContext,
};
use crate::arbitrage::{DetectParams, Opportunity, OpportunityDetector};
use crate::audit::{AuditAction, AuditFilter, AuditLogEntry};
use crate::config::AppConfig;
use crate::debate::{
    ArithmeticPerspectives, DebateEngine, DebateResult, LlmPerspectives, PerspectiveProvider,
};
use crate::discovery::PriceDiscovery;
use crate::error::ControlError;
use crate::exchange::PriceFeed;
use crate::execution::{ExecutionContext, ExecutionEngine, ExecutionRecord, ExecutionResult};
use crate::guardian::{Guardian, GuardianConfig, GuardianConfigUpdate};
use crate::persistence::{AppState, JsonFileStore, MemoryStore, Settings, StateStore};
use crate::portfolio::Portfolio;
use crate::risk::{RiskAssessmentResult, RiskAssessor};
use crate::types::now_ms;

/// Run statistics; reset on start, frozen on stop
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerState {
    pub is_running: bool,
    pub start_time: Option<i64>,
    pub poll_count: u64,
    pub opportunities_processed: u64,
    pub executions_attempted: u64,
    pub executions_successful: u64,
    pub last_poll_time: Option<i64>,
    pub current_symbols: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartOutcome {
    /// False when the runner was already running
    pub started: bool,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopOutcome {
    /// False when the runner was already stopped
    pub stopped: bool,
    pub stats: RunnerState,
}

struct PollTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct RunnerInner {
    pipeline: Mutex<Pipeline>,
    poll_in_flight: AtomicBool,
    task: Mutex<Option<PollTask>>,
    store: Arc<dyn StateStore>,
}

/// Clears the in-flight flag however the poll ends
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl RunnerInner {
    async fn poll_guarded(&self) -> Option<PollSummary> {
        if self
            .poll_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Previous poll still in flight, skipping this one");
            return None;
        }
        let _guard = InFlightGuard(&self.poll_in_flight);

        let mut pipeline = self.pipeline.lock().await;
        let summary = pipeline.poll().await;
        self.persist(pipeline.snapshot()).await;
        Some(summary)
    }

    /// Writes off the runtime threads; callers keep the pipeline lock so saves stay ordered
    async fn persist(&self, state: AppState) {
        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || store.save(&state)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %format!("{:#}", e), "Failed to persist state"),
            Err(e) => error!(error = %e, "State save task failed"),
        }
    }
}

/// Handle to the orchestrator; cheap to clone
#[derive(Clone)]
pub struct Runner {
    inner: Arc<RunnerInner>,
}

impl Runner {
    pub fn builder(config: AppConfig) -> RunnerBuilder {
        RunnerBuilder::new(config)
    }

    /// Start polling. `poll_interval_ms` overrides the configured interval.
    pub async fn start(&self, poll_interval_ms: Option<u64>) -> Result<StartOutcome, ControlError> {
        if let Some(ms) = poll_interval_ms {
            if ms == 0 {
                return Err(ControlError::NotPositive {
                    field: "poll_interval_ms",
                    value: 0.0,
                });
            }
        }

        let mut task = self.inner.task.lock().await;
        if task.is_some() {
            let interval = self.inner.pipeline.lock().await.settings.poll_interval_ms;
            return Ok(StartOutcome {
                started: false,
                poll_interval_ms: interval,
            });
        }

        let interval_ms = {
            let mut pipeline = self.inner.pipeline.lock().await;
            if let Some(ms) = poll_interval_ms {
                pipeline.settings.poll_interval_ms = ms;
            }
            let interval_ms = pipeline.settings.poll_interval_ms;
            let symbols = pipeline.settings.symbols.clone();
            pipeline.runner = RunnerState {
                is_running: true,
                start_time: Some(now_ms()),
                current_symbols: symbols.clone(),
                ..Default::default()
            };
            pipeline.audit.record(
                AuditAction::RunnerStarted,
                None,
                json!({ "poll_interval_ms": interval_ms, "symbols": symbols }),
            );
            self.inner.persist(pipeline.snapshot()).await;
            interval_ms
        };

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }
                if *shutdown_rx.borrow() {
                    break;
                }
                // outside the select so a stop never cancels a running poll
                inner.poll_guarded().await;
            }
        });
        *task = Some(PollTask { shutdown, handle });

        info!(poll_interval_ms = interval_ms, "Runner started");
        Ok(StartOutcome {
            started: true,
            poll_interval_ms: interval_ms,
        })
    }

    /// Stop polling, wait for an in-flight poll, and return the frozen stats
    pub async fn stop(&self) -> StopOutcome {
        let task = self.inner.task.lock().await.take();
        let Some(task) = task else {
            return StopOutcome {
                stopped: false,
                stats: self.status().await,
            };
        };

        let _ = task.shutdown.send(true);
        if let Err(e) = task.handle.await {
            warn!(error = %e, "Poll task ended abnormally");
        }

        let mut pipeline = self.inner.pipeline.lock().await;
        pipeline.runner.is_running = false;
        let stats = pipeline.runner.clone();
        pipeline.audit.record(
            AuditAction::RunnerStopped,
            None,
            json!({
                "poll_count": stats.poll_count,
                "opportunities_processed": stats.opportunities_processed,
                "executions_attempted": stats.executions_attempted,
                "executions_successful": stats.executions_successful,
            }),
        );
        self.inner.persist(pipeline.snapshot()).await;

        info!(
            polls = stats.poll_count,
            opportunities = stats.opportunities_processed,
            executions = stats.executions_successful,
            "Runner stopped"
        );
        StopOutcome {
            stopped: true,
            stats,
        }
    }

    pub async fn status(&self) -> RunnerState {
        self.inner.pipeline.lock().await.runner.clone()
    }

    pub async fn is_running(&self) -> bool {
        self.inner.task.lock().await.is_some()
    }

    /// Run one poll now, subject to the same overlap guard as scheduled
    /// polls. None when skipped.
    pub async fn poll_once(&self) -> Option<PollSummary> {
        self.inner.poll_guarded().await
    }

    pub async fn update_guardian_config(
        &self,
        update: GuardianConfigUpdate,
    ) -> Result<GuardianConfig, ControlError> {
        let mut pipeline = self.inner.pipeline.lock().await;
        let config = pipeline.guardian.update_config(&update)?;
        pipeline.audit.record(
            AuditAction::GuardianConfigUpdated,
            None,
            json!({ "update": update, "config": config }),
        );
        self.inner.persist(pipeline.snapshot()).await;
        Ok(config)
    }

    pub async fn guardian_config(&self) -> GuardianConfig {
        self.inner.pipeline.lock().await.guardian.config().clone()
    }

    /// Discover and detect once for `symbols` with explicit thresholds
    pub async fn detect(
        &self,
        symbols: &[String],
        params: DetectParams,
    ) -> Result<Vec<Opportunity>, ControlError> {
        validate_symbols(symbols)?;
        ControlError::require_range("min_spread_pct", params.min_spread_pct, 0.0, 100.0)?;
        if params.persistence_ms < 0 {
            return Err(ControlError::OutOfRange {
                field: "persistence_ms",
                value: params.persistence_ms as f64,
                min: 0.0,
                max: f64::INFINITY,
            });
        }
        if params.min_persistence_count == 0 {
            return Err(ControlError::NotPositive {
                field: "min_persistence_count",
                value: 0.0,
            });
        }

        let mut pipeline = self.inner.pipeline.lock().await;
        let discovered = pipeline.discovery.discover(symbols).await;
        Ok(pipeline.detector.detect_at(&discovered, &params, now_ms()))
    }

    pub async fn assess_risk(
        &self,
        opportunity: &Opportunity,
        qty: f64,
    ) -> Result<RiskAssessmentResult, ControlError> {
        opportunity.validate()?;
        ControlError::require_positive("qty", qty)?;
        let pipeline = self.inner.pipeline.lock().await;
        Ok(pipeline
            .risk
            .assess(&pipeline.discovery, opportunity, qty)
            .await)
    }

    /// Single-opportunity allocation; the live portfolio when no context given
    pub async fn allocate(
        &self,
        opportunity: &Opportunity,
        risk: &RiskAssessmentResult,
        context: Option<&PortfolioContext>,
    ) -> Result<AllocationResult, ControlError> {
        opportunity.validate()?;
        let pipeline = self.inner.pipeline.lock().await;
        let context = context
            .copied()
            .unwrap_or_else(|| PortfolioContext::from(&pipeline.portfolio));
        Ok(pipeline.allocator.allocate(opportunity, risk, &context))
    }

    /// Portfolio allocation from `available`, or current cash when None
    pub async fn allocate_portfolio(
        &self,
        candidates: &[AllocationCandidate],
        available: Option<f64>,
    ) -> Result<PortfolioAllocationPlan, ControlError> {
        for candidate in candidates {
            candidate.opportunity.validate()?;
        }
        let pipeline = self.inner.pipeline.lock().await;
        let available = available.unwrap_or(pipeline.portfolio.cash);
        Ok(pipeline.allocator.allocate_portfolio(candidates, available))
    }

    pub async fn debate(
        &self,
        opportunity: &Opportunity,
        risk: &RiskAssessmentResult,
        allocation: &AllocationResult,
        threshold: Option<f64>,
    ) -> Result<DebateResult, ControlError> {
        opportunity.validate()?;
        let pipeline = self.inner.pipeline.lock().await;
        let threshold = match threshold {
            Some(t) => ControlError::require_range("threshold", t, 0.0, 1.0)?,
            None => pipeline.debate.config().threshold,
        };
        Ok(pipeline
            .debate
            .decide(opportunity, risk, allocation, threshold)
            .await)
    }

    /// Execute directly, bypassing the Guardian
    pub async fn execute(
        &self,
        opportunity: &Opportunity,
        allocated_amount: f64,
    ) -> Result<ExecutionResult, ControlError> {
        opportunity.validate()?;
        ControlError::require_positive("allocated_amount", allocated_amount)?;

        let mut guard = self.inner.pipeline.lock().await;
        let pipeline = &mut *guard;
        let mut ctx = ExecutionContext {
            discovery: &pipeline.discovery,
            portfolio: &mut pipeline.portfolio,
            audit: &mut pipeline.audit,
            log: &mut pipeline.executions,
        };
        let result = pipeline
            .execution
            .execute(&mut ctx, opportunity, allocated_amount)
            .await;
        self.inner.persist(pipeline.snapshot()).await;
        Ok(result)
    }

    pub async fn query_audit_log(&self, filter: &AuditFilter) -> Vec<AuditLogEntry> {
        self.inner.pipeline.lock().await.audit.query(filter)
    }

    pub async fn export_audit_csv(&self, path: &Path) -> Result<usize> {
        self.inner.pipeline.lock().await.audit.export_csv(path)
    }

    pub async fn portfolio(&self) -> Portfolio {
        self.inner.pipeline.lock().await.portfolio.clone()
    }

    pub async fn executions(&self) -> Vec<ExecutionRecord> {
        self.inner
            .pipeline
            .lock()
            .await
            .executions
            .records()
            .cloned()
            .collect()
    }

    pub async fn snapshot(&self) -> AppState {
        self.inner.pipeline.lock().await.snapshot()
    }
}

fn validate_symbols(symbols: &[String]) -> Result<(), ControlError> {
    if symbols.is_empty() {
        return Err(ControlError::EmptySymbols);
    }
    let mut seen = HashSet::new();
    for symbol in symbols {
        if symbol.trim().is_empty() {
            return Err(ControlError::BlankSymbol);
        }
        if !seen.insert(symbol.as_str()) {
            return Err(ControlError::DuplicateSymbol(symbol.clone()));
        }
    }
    Ok(())
}

/// Assembles a [`Runner`] from config, with optional injected collaborators
pub struct RunnerBuilder {
    config: AppConfig,
    feeds: Option<Vec<Arc<dyn PriceFeed>>>,
    provider: Option<Arc<dyn PerspectiveProvider>>,
    store: Option<Arc<dyn StateStore>>,
}

impl RunnerBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            feeds: None,
            provider: None,
            store: None,
        }
    }

    /// Price feeds; the first is the primary exchange
    pub fn with_feeds(mut self, feeds: Vec<Arc<dyn PriceFeed>>) -> Self {
        self.feeds = Some(feeds);
        self
    }

    pub fn with_perspective_provider(mut self, provider: Arc<dyn PerspectiveProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Result<Runner> {
        let config = self.config;
        validate_symbols(&config.runner.symbols).context("Invalid runner symbols")?;
        ControlError::require_positive(
            "runner.poll_interval_ms",
            config.runner.poll_interval_ms as f64,
        )
        .context("Invalid poll interval")?;

        let feeds = match self.feeds {
            Some(feeds) => feeds,
            None => config
                .simulation
                .simulated()
                .into_iter()
                .map(|f| Arc::new(f) as Arc<dyn PriceFeed>)
                .collect(),
        };
        if feeds.is_empty() {
            anyhow::bail!("at least one price feed is required");
        }

        let provider: Arc<dyn PerspectiveProvider> = match self.provider {
            Some(provider) => provider,
            None if config.debate.llm.enabled => {
                match LlmPerspectives::from_config(&config.debate.llm) {
                    Ok(llm) => Arc::new(llm),
                    Err(e) => {
                        warn!(error = %format!("{:#}", e), "LLM perspectives unavailable, using arithmetic");
                        Arc::new(ArithmeticPerspectives)
                    }
                }
            }
            None => Arc::new(ArithmeticPerspectives),
        };

        let store: Arc<dyn StateStore> = match self.store {
            Some(store) => store,
            None => match &config.runner.state_file {
                Some(path) => Arc::new(JsonFileStore::new(path)),
                None => Arc::new(MemoryStore::new()),
            },
        };

        let fresh = AppState {
            guardian: config.guardian.clone(),
            ..AppState::new(config.portfolio.initial_cash)
        };
        let state = store.load_or(fresh).context("Failed to load state")?;

        let mut executions = state.executions;
        executions.set_capacity(config.execution.log_capacity);
        let mut runner_state = state.runner;
        runner_state.is_running = false;

        let pipeline = Pipeline {
            discovery: PriceDiscovery::new(feeds, config.discovery.clone()),
            detector: OpportunityDetector::new(config.detector.clone()),
            risk: RiskAssessor::new(config.risk.clone()),
            allocator: CapitalAllocator::new(config.allocator.clone()),
            debate: DebateEngine::new(provider, config.debate.clone()),
            guardian: Guardian::new(state.guardian),
            execution: ExecutionEngine::new(config.execution.clone()),
            portfolio: state.portfolio,
            audit: state.audit,
            executions,
            runner: runner_state,
            settings: Settings {
                symbols: config.runner.symbols.clone(),
                poll_interval_ms: config.runner.poll_interval_ms,
            },
        };

        info!(
            exchanges = ?pipeline.discovery.exchanges(),
            perspectives = pipeline.debate.provider_name(),
            cash = %format!("${:.2}", pipeline.portfolio.cash),
            "Runner built"
        );

        Ok(Runner {
            inner: Arc::new(RunnerInner {
                pipeline: Mutex::new(pipeline),
                poll_in_flight: AtomicBool::new(false),
                task: Mutex::new(None),
                store,
            }),
        })
    }
}
