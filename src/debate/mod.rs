//! Decision Engine - median-of-three consensus over scored perspectives
//!
//! A perspective provider supplies bullish, bearish and neutral scores in
//! [0, 1]. The decision score is the median of
//! `[bullish, 1 - bearish, neutral]`; the engine executes when it reaches
//! the threshold. Provider failures and malformed scores fall back to the
//! arithmetic perspectives so a decision is always produced.

mod llm;

pub use llm::{LlmConfig, LlmPerspectives};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::allocation::AllocationResult;
use crate::arbitrage::Opportunity;
use crate::risk::RiskAssessmentResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebateConfig {
    /// Minimum decision score to execute
    pub threshold: f64,
    pub llm: LlmConfig,
}

impl Default for DebateConfig {
    fn default() -> Self {
        Self {
            threshold: 0.6,
            llm: LlmConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Perspective {
    pub score: f64,
    #[serde(default)]
    pub reasons: Vec<String>,
}

impl Perspective {
    pub fn new(score: f64, reason: impl Into<String>) -> Self {
        Self {
            score,
            reasons: vec![reason.into()],
        }
    }

    fn is_valid(&self) -> bool {
        self.score.is_finite() && (0.0..=1.0).contains(&self.score)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Perspectives {
    pub bullish: Perspective,
    pub bearish: Perspective,
    pub neutral: Perspective,
}

impl Perspectives {
    pub fn is_valid(&self) -> bool {
        self.bullish.is_valid() && self.bearish.is_valid() && self.neutral.is_valid()
    }
}

/// Numbers a provider may reason over
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerspectiveContext {
    pub symbol: String,
    pub action: String,
    pub spread_pct: f64,
    pub estimated_gross_profit_pct: f64,
    pub risk_score: f64,
    pub volatility_pct: f64,
    pub fill_ratio: f64,
    pub slippage_pct: f64,
    pub allocated_amount: f64,
}

impl PerspectiveContext {
    pub fn new(
        opportunity: &Opportunity,
        risk: &RiskAssessmentResult,
        allocation: &AllocationResult,
    ) -> Self {
        Self {
            symbol: opportunity.symbol.clone(),
            action: opportunity.action.to_string(),
            spread_pct: opportunity.spread_pct,
            estimated_gross_profit_pct: opportunity.estimated_gross_profit_pct,
            risk_score: risk.risk_score,
            volatility_pct: risk.volatility_pct,
            fill_ratio: risk.fill_ratio,
            slippage_pct: risk.slippage_pct,
            allocated_amount: allocation.allocated_amount,
        }
    }
}

/// Source of the three perspectives
#[async_trait]
pub trait PerspectiveProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn perspectives(&self, context: &PerspectiveContext) -> Result<Perspectives>;
}

/// Deterministic perspectives computed from spread and risk alone
#[derive(Debug, Clone, Copy, Default)]
pub struct ArithmeticPerspectives;

impl ArithmeticPerspectives {
    pub fn compute(context: &PerspectiveContext) -> Perspectives {
        let spread_score = (context.spread_pct.abs() / 2.0).clamp(0.0, 1.0);
        let risk_penalty = context.risk_score / 100.0;
        let bullish = (spread_score - 0.3 * risk_penalty).clamp(0.0, 1.0);
        let bearish = risk_penalty.clamp(0.0, 1.0);

        Perspectives {
            bullish: Perspective::new(
                bullish,
                format!(
                    "spread {:.3}% scores {:.2}, less 30% of risk penalty {:.2}",
                    context.spread_pct, spread_score, risk_penalty
                ),
            ),
            bearish: Perspective::new(
                bearish,
                format!("risk score {:.1} of 100", context.risk_score),
            ),
            neutral: Perspective::new(0.5, "no directional view"),
        }
    }
}

#[async_trait]
impl PerspectiveProvider for ArithmeticPerspectives {
    fn name(&self) -> &'static str {
        "arithmetic"
    }

    async fn perspectives(&self, context: &PerspectiveContext) -> Result<Perspectives> {
        Ok(Self::compute(context))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Execute,
    Wait,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Execute => write!(f, "execute"),
            Decision::Wait => write!(f, "wait"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebateResult {
    pub bullish: Perspective,
    pub bearish: Perspective,
    pub neutral: Perspective,
    pub final_decision_score: f64,
    pub decision: Decision,
    pub threshold: f64,
    /// Provider whose perspectives were used
    pub provider: String,
    pub fallback_used: bool,
}

/// Median of `[bullish, 1 - bearish, neutral]`
pub fn median_of_three(bullish: f64, bearish: f64, neutral: f64) -> f64 {
    let mut triple = [bullish, 1.0 - bearish, neutral];
    triple.sort_by(|a, b| a.total_cmp(b));
    triple[1]
}

pub struct DebateEngine {
    provider: Arc<dyn PerspectiveProvider>,
    config: DebateConfig,
}

impl DebateEngine {
    pub fn new(provider: Arc<dyn PerspectiveProvider>, config: DebateConfig) -> Self {
        Self { provider, config }
    }

    pub fn arithmetic(config: DebateConfig) -> Self {
        Self::new(Arc::new(ArithmeticPerspectives), config)
    }

    pub fn config(&self) -> &DebateConfig {
        &self.config
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// Decide with the configured threshold
    pub async fn decide_default(
        &self,
        opportunity: &Opportunity,
        risk: &RiskAssessmentResult,
        allocation: &AllocationResult,
    ) -> DebateResult {
        self.decide(opportunity, risk, allocation, self.config.threshold)
            .await
    }

    pub async fn decide(
        &self,
        opportunity: &Opportunity,
        risk: &RiskAssessmentResult,
        allocation: &AllocationResult,
        threshold: f64,
    ) -> DebateResult {
        let context = PerspectiveContext::new(opportunity, risk, allocation);

        let (perspectives, provider, fallback_used) =
            match self.provider.perspectives(&context).await {
                Ok(p) if p.is_valid() => (p, self.provider.name(), false),
                Ok(_) => {
                    warn!(provider = self.provider.name(), "Perspective scores out of range, using arithmetic fallback");
                    (ArithmeticPerspectives::compute(&context), "arithmetic", true)
                }
                Err(e) => {
                    warn!(provider = self.provider.name(), error = %e, "Perspective provider failed, using arithmetic fallback");
                    (ArithmeticPerspectives::compute(&context), "arithmetic", true)
                }
            };

        let final_decision_score = median_of_three(
            perspectives.bullish.score,
            perspectives.bearish.score,
            perspectives.neutral.score,
        );
        let decision = if final_decision_score >= threshold {
            Decision::Execute
        } else {
            Decision::Wait
        };

        debug!(
            symbol = %opportunity.symbol,
            bullish = perspectives.bullish.score,
            bearish = perspectives.bearish.score,
            neutral = perspectives.neutral.score,
            score = final_decision_score,
            decision = %decision,
            "Debate concluded"
        );

        DebateResult {
            bullish: perspectives.bullish,
            bearish: perspectives.bearish,
            neutral: perspectives.neutral,
            final_decision_score,
            decision,
            threshold,
            provider: provider.to_string(),
            fallback_used,
        }
    }
}

impl Default for DebateEngine {
    fn default() -> Self {
        Self::arithmetic(DebateConfig::default())
    }
}
