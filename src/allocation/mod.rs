//! Capital Allocator - risk-banded position sizing
//!
//! Two policies:
//! - single opportunity: a risk band picks a fraction of cash, capped by the
//!   per-trade maximum
//! - portfolio: ranks several opportunities by priority and funds them
//!   greedily from a shared pool under per-opportunity and aggregate caps
//!
//! Invalid inputs always yield a zero allocation with a reason.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::debug;

use crate::arbitrage::Opportunity;
use crate::portfolio::Portfolio;
use crate::risk::RiskAssessmentResult;
use crate::types::now_ms;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Hard cap on any single trade (quote currency)
    pub max_trade_amount: f64,
    /// Portfolio policy: max share of the pool for one opportunity
    pub per_opportunity_cap: f64,
    /// Portfolio policy: max share of the pool across all opportunities
    pub aggregate_cap: f64,
    /// Portfolio policy: tickets below this are skipped, not partially funded
    pub min_ticket: f64,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            max_trade_amount: 10_000.0,
            per_opportunity_cap: 0.20,
            aggregate_cap: 0.80,
            min_ticket: 100.0,
        }
    }
}

/// Portfolio snapshot the allocator sizes against
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PortfolioContext {
    pub cash: f64,
    pub total_value: f64,
    /// Overrides the configured per-trade cap when set
    pub max_trade_amount: Option<f64>,
}

impl From<&Portfolio> for PortfolioContext {
    fn from(portfolio: &Portfolio) -> Self {
        Self {
            cash: portfolio.cash,
            total_value: portfolio.total_value,
            max_trade_amount: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationResult {
    pub allocation_pct: f64,
    pub allocated_amount: f64,
    pub reason: String,
}

impl AllocationResult {
    pub fn zero(reason: impl Into<String>) -> Self {
        Self {
            allocation_pct: 0.0,
            allocated_amount: 0.0,
            reason: reason.into(),
        }
    }

    pub fn is_funded(&self) -> bool {
        self.allocated_amount > 0.0
    }
}

/// Cash fraction for a risk score; decreasing in risk
pub fn allocation_pct_for_risk(risk_score: f64) -> f64 {
    if risk_score > 80.0 {
        0.02
    } else if risk_score > 60.0 {
        0.05
    } else if risk_score >= 30.0 {
        0.10
    } else {
        0.15
    }
}

/// One opportunity competing for the shared pool
#[derive(Debug, Clone)]
pub struct AllocationCandidate {
    pub opportunity: Opportunity,
    pub risk: RiskAssessmentResult,
}

/// Allocation for one candidate under the portfolio policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioAllocation {
    pub opportunity_id: String,
    pub symbol: String,
    pub priority: f64,
    pub allocated_amount: f64,
    pub skipped: bool,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioAllocationPlan {
    pub allocations: Vec<PortfolioAllocation>,
    pub total_allocated: f64,
    pub remaining: f64,
}

/// Priority blending expected return, risk penalty, spread and freshness
pub fn priority_score(opportunity: &Opportunity, risk: &RiskAssessmentResult, now: i64) -> f64 {
    let expected_return = opportunity.estimated_gross_profit_pct * 20.0;
    let risk_penalty = risk.risk_score / 100.0 * 30.0;
    let spread = opportunity.spread_pct.abs();
    let spread_bonus = if spread >= 1.0 {
        10.0
    } else if spread >= 0.5 {
        5.0
    } else {
        0.0
    };
    let age_ms = (now - opportunity.last_seen_ts).max(0);
    let time_bonus = if age_ms <= 1_000 {
        10.0
    } else if age_ms <= 5_000 {
        5.0
    } else {
        0.0
    };
    expected_return - risk_penalty + spread_bonus + time_bonus
}

pub struct CapitalAllocator {
    config: AllocatorConfig,
}

impl CapitalAllocator {
    pub fn new(config: AllocatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Single-opportunity allocation
    pub fn allocate(
        &self,
        opportunity: &Opportunity,
        risk: &RiskAssessmentResult,
        portfolio: &PortfolioContext,
    ) -> AllocationResult {
        let cap = portfolio
            .max_trade_amount
            .unwrap_or(self.config.max_trade_amount);

        if !(portfolio.cash.is_finite() && portfolio.cash > 0.0) {
            return AllocationResult::zero(format!("no cash available ({:.2})", portfolio.cash));
        }
        if !(portfolio.total_value.is_finite() && portfolio.total_value > 0.0) {
            return AllocationResult::zero(format!(
                "portfolio value not positive ({:.2})",
                portfolio.total_value
            ));
        }
        if !(cap.is_finite() && cap > 0.0) {
            return AllocationResult::zero(format!("max trade amount not positive ({:.2})", cap));
        }
        if !risk.risk_score.is_finite() {
            return AllocationResult::zero("risk score not finite");
        }

        let pct = allocation_pct_for_risk(risk.risk_score);
        let by_pct = portfolio.cash * pct;
        let allocated = by_pct.min(cap).min(portfolio.cash);
        let reason = if by_pct > cap {
            format!(
                "risk {:.1} -> {:.0}% of cash, capped at max trade {:.2}",
                risk.risk_score,
                pct * 100.0,
                cap
            )
        } else {
            format!("risk {:.1} -> {:.0}% of cash", risk.risk_score, pct * 100.0)
        };

        debug!(
            symbol = %opportunity.symbol,
            risk_score = risk.risk_score,
            allocation_pct = pct,
            allocated,
            "Capital allocated"
        );

        AllocationResult {
            allocation_pct: pct,
            allocated_amount: allocated,
            reason,
        }
    }

    /// Greedy multi-opportunity allocation from `available` capital
    pub fn allocate_portfolio(
        &self,
        candidates: &[AllocationCandidate],
        available: f64,
    ) -> PortfolioAllocationPlan {
        self.allocate_portfolio_at(candidates, available, now_ms())
    }

    pub fn allocate_portfolio_at(
        &self,
        candidates: &[AllocationCandidate],
        available: f64,
        now: i64,
    ) -> PortfolioAllocationPlan {
        if !(available.is_finite() && available > 0.0) {
            return PortfolioAllocationPlan {
                allocations: candidates
                    .iter()
                    .map(|c| PortfolioAllocation {
                        opportunity_id: c.opportunity.id.clone(),
                        symbol: c.opportunity.symbol.clone(),
                        priority: priority_score(&c.opportunity, &c.risk, now),
                        allocated_amount: 0.0,
                        skipped: true,
                        reason: "no capital available".to_string(),
                    })
                    .collect(),
                total_allocated: 0.0,
                remaining: 0.0,
            };
        }

        let mut ranked: Vec<(f64, &AllocationCandidate)> = candidates
            .iter()
            .map(|c| (priority_score(&c.opportunity, &c.risk, now), c))
            .collect();
        ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

        let per_cap = available * self.config.per_opportunity_cap;
        let aggregate_cap = available * self.config.aggregate_cap;
        let mut total = 0.0;
        let mut allocations = Vec::with_capacity(ranked.len());

        for (priority, candidate) in ranked {
            let opp = &candidate.opportunity;
            let desired = available * allocation_pct_for_risk(candidate.risk.risk_score);
            let amount = desired
                .min(per_cap)
                .min(self.config.max_trade_amount)
                .min((aggregate_cap - total).max(0.0));

            let (allocated_amount, skipped, reason) = if amount < self.config.min_ticket {
                (
                    0.0,
                    true,
                    format!(
                        "ticket {:.2} below minimum {:.2}",
                        amount, self.config.min_ticket
                    ),
                )
            } else {
                total += amount;
                (amount, false, format!("priority {:.1}", priority))
            };

            allocations.push(PortfolioAllocation {
                opportunity_id: opp.id.clone(),
                symbol: opp.symbol.clone(),
                priority,
                allocated_amount,
                skipped,
                reason,
            });
        }

        PortfolioAllocationPlan {
            allocations,
            total_allocated: total,
            remaining: available - total,
        }
    }
}

impl Default for CapitalAllocator {
    fn default() -> Self {
        Self::new(AllocatorConfig::default())
    }
}
