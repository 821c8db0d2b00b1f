//! One poll cycle: discovery, detection, then each confirmed opportunity
//! through risk, allocation, debate, guardian and execution in turn.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use super::RunnerState;
use crate::allocation::{CapitalAllocator, PortfolioContext};
use crate::arbitrage::{Opportunity, OpportunityDetector};
use crate::audit::{AuditAction, AuditLog, EnhancedAuditEntry};
use crate::debate::{DebateEngine, Decision};
use crate::discovery::{DiscoveredPrice, PriceDiscovery};
use crate::execution::{ExecutionContext, ExecutionEngine, ExecutionLog};
use crate::guardian::{Guardian, GuardianCheck};
use crate::persistence::{AppState, Settings};
use crate::portfolio::Portfolio;
use crate::risk::RiskAssessor;
use crate::types::now_ms;

/// Where an opportunity's run through the pipeline ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityOutcome {
    AllocationSkipped,
    DebateWait,
    GuardianVetoed,
    Executed,
    ExecutionFailed,
    Failed,
}

impl OpportunityOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpportunityOutcome::AllocationSkipped => "allocation_skipped",
            OpportunityOutcome::DebateWait => "debate_wait",
            OpportunityOutcome::GuardianVetoed => "guardian_vetoed",
            OpportunityOutcome::Executed => "executed",
            OpportunityOutcome::ExecutionFailed => "execution_failed",
            OpportunityOutcome::Failed => "failed",
        }
    }
}

/// What one poll did
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PollSummary {
    pub poll: u64,
    pub symbols: usize,
    pub opportunities: usize,
    pub executed: usize,
    pub outcomes: Vec<(String, OpportunityOutcome)>,
}

/// Every component plus the state they share. Owned by the Runner behind a
/// single lock, so at most one cycle runs at a time.
pub struct Pipeline {
    pub(crate) discovery: PriceDiscovery,
    pub(crate) detector: OpportunityDetector,
    pub(crate) risk: RiskAssessor,
    pub(crate) allocator: CapitalAllocator,
    pub(crate) debate: DebateEngine,
    pub(crate) guardian: Guardian,
    pub(crate) execution: ExecutionEngine,
    pub(crate) portfolio: Portfolio,
    pub(crate) audit: AuditLog,
    pub(crate) executions: ExecutionLog,
    pub(crate) runner: RunnerState,
    pub(crate) settings: Settings,
}

impl Pipeline {
    /// Persistable snapshot of the shared state
    pub fn snapshot(&self) -> AppState {
        AppState {
            portfolio: self.portfolio.clone(),
            runner: self.runner.clone(),
            guardian: self.guardian.config().clone(),
            audit: self.audit.clone(),
            executions: self.executions.clone(),
            settings: self.settings.clone(),
        }
    }

    /// Units the risk walk is sized for: one maximal trade at the buy price
    fn target_qty(&self, opportunity: &Opportunity) -> f64 {
        let budget = self
            .allocator
            .config()
            .max_trade_amount
            .min(self.portfolio.cash);
        if budget > 0.0 && opportunity.source_price > 0.0 {
            budget / opportunity.source_price
        } else {
            0.0
        }
    }

    pub async fn poll(&mut self) -> PollSummary {
        self.runner.poll_count += 1;
        self.runner.last_poll_time = Some(now_ms());
        let poll = self.runner.poll_count;
        let symbols = self.settings.symbols.clone();

        let discovered = self.discovery.discover(&symbols).await;
        let opportunities = self.detector.detect(&discovered);

        let mut summary = PollSummary {
            poll,
            symbols: symbols.len(),
            opportunities: opportunities.len(),
            ..Default::default()
        };

        for opportunity in &opportunities {
            let snapshot = discovered.iter().find(|d| d.symbol == opportunity.symbol);
            let outcome = self.process(opportunity, snapshot).await;
            if outcome == OpportunityOutcome::Executed {
                summary.executed += 1;
            }
            summary.outcomes.push((opportunity.id.clone(), outcome));
        }

        if summary.opportunities > 0 {
            info!(
                poll,
                opportunities = summary.opportunities,
                executed = summary.executed,
                cash = %format!("${:.2}", self.portfolio.cash),
                "Poll complete"
            );
        } else {
            debug!(poll, "Poll complete, no confirmed opportunities");
        }
        summary
    }

    /// Run one opportunity through the chain. A failure anywhere is recorded
    /// and reported, never propagated.
    pub async fn process(
        &mut self,
        opportunity: &Opportunity,
        snapshot: Option<&DiscoveredPrice>,
    ) -> OpportunityOutcome {
        self.runner.opportunities_processed += 1;
        let mut enhanced = EnhancedAuditEntry::new(opportunity);

        let outcome = match self.run_chain(opportunity, snapshot, &mut enhanced).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(id = %opportunity.id, symbol = %opportunity.symbol, error = %e, "Opportunity failed");
                self.audit.record(
                    AuditAction::OpportunityFailed,
                    Some(&opportunity.symbol),
                    json!({ "opportunity_id": opportunity.id, "error": e.to_string() }),
                );
                OpportunityOutcome::Failed
            }
        };

        enhanced.outcome = outcome.as_str().to_string();
        self.audit.record_enhanced(enhanced);
        outcome
    }

    async fn run_chain(
        &mut self,
        opportunity: &Opportunity,
        snapshot: Option<&DiscoveredPrice>,
        enhanced: &mut EnhancedAuditEntry,
    ) -> Result<OpportunityOutcome> {
        opportunity.validate()?;
        let symbol = opportunity.symbol.as_str();
        self.audit.record(
            AuditAction::OpportunityDetected,
            Some(symbol),
            json!({
                "opportunity_id": opportunity.id,
                "action": opportunity.action.to_string(),
                "spread_pct": opportunity.spread_pct,
                "estimated_gross_profit_pct": opportunity.estimated_gross_profit_pct,
                "persistence_count": opportunity.persistence_count,
            }),
        );

        // Risk
        let target_qty = self.target_qty(opportunity);
        let risk = self
            .risk
            .assess(&self.discovery, opportunity, target_qty)
            .await;
        self.audit.record(
            AuditAction::RiskAssessed,
            Some(symbol),
            json!({
                "opportunity_id": opportunity.id,
                "risk_score": risk.risk_score,
                "volatility_pct": risk.volatility_pct,
                "fill_ratio": risk.fill_ratio,
                "slippage_pct": risk.slippage_pct,
                "notes": risk.notes,
            }),
        );
        enhanced.risk = Some(risk.clone());

        // Allocation
        let allocation = self.allocator.allocate(
            opportunity,
            &risk,
            &PortfolioContext::from(&self.portfolio),
        );
        enhanced.allocation = Some(allocation.clone());
        if !allocation.is_funded() {
            self.audit.record(
                AuditAction::AllocationSkipped,
                Some(symbol),
                json!({ "opportunity_id": opportunity.id, "reason": allocation.reason }),
            );
            return Ok(OpportunityOutcome::AllocationSkipped);
        }
        self.audit.record(
            AuditAction::CapitalAllocated,
            Some(symbol),
            json!({
                "opportunity_id": opportunity.id,
                "allocation_pct": allocation.allocation_pct,
                "allocated_amount": allocation.allocated_amount,
                "reason": allocation.reason,
            }),
        );

        // Debate
        let debate = self
            .debate
            .decide_default(opportunity, &risk, &allocation)
            .await;
        self.audit.record(
            AuditAction::DebateConcluded,
            Some(symbol),
            json!({
                "opportunity_id": opportunity.id,
                "bullish": debate.bullish.score,
                "bearish": debate.bearish.score,
                "neutral": debate.neutral.score,
                "final_decision_score": debate.final_decision_score,
                "decision": debate.decision,
                "provider": debate.provider,
            }),
        );
        let decision = debate.decision;
        enhanced.debate = Some(debate);
        if decision == Decision::Wait {
            return Ok(OpportunityOutcome::DebateWait);
        }

        // Guardian
        let exchange_outage = snapshot.map_or(false, |s| {
            s.price(opportunity.buy_exchange()).is_none()
                || s.price(opportunity.sell_exchange()).is_none()
        });
        let verdict = self.guardian.check(&GuardianCheck {
            allocated_amount: allocation.allocated_amount,
            risk: &risk,
            portfolio: &self.portfolio,
            audit: &self.audit,
            exchange_outage,
        });
        self.audit.record(
            if verdict.pass {
                AuditAction::GuardianPassed
            } else {
                AuditAction::GuardianVetoed
            },
            Some(symbol),
            json!({
                "opportunity_id": opportunity.id,
                "reason": verdict.reason,
                "warnings": verdict.warnings,
            }),
        );
        let pass = verdict.pass;
        enhanced.guardian = Some(verdict);
        if !pass {
            return Ok(OpportunityOutcome::GuardianVetoed);
        }

        // Execution
        self.runner.executions_attempted += 1;
        let mut ctx = ExecutionContext {
            discovery: &self.discovery,
            portfolio: &mut self.portfolio,
            audit: &mut self.audit,
            log: &mut self.executions,
        };
        let result = self
            .execution
            .execute(&mut ctx, opportunity, allocation.allocated_amount)
            .await;
        let success = result.success;
        enhanced.execution = Some(result);
        if success {
            self.runner.executions_successful += 1;
            Ok(OpportunityOutcome::Executed)
        } else {
            Ok(OpportunityOutcome::ExecutionFailed)
        }
    }
}
