//! Risk Assessor - scores an opportunity from 0 (safe) to 100 (dangerous)
//!
//! Combines four factors, each monotonic in its direction:
//! - Spread quality (wider spread lowers risk)
//! - Volatility of the primary exchange price (higher raises risk)
//! - Fill ratio of the target-exchange ask ladder (lower raises risk)
//! - Expected slippage against the book mid (larger raises risk)
//!
//! Assessment never fails: a collaborator error yields a conservative
//! high-risk result instead.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::arbitrage::Opportunity;
use crate::discovery::PriceDiscovery;
use crate::exchange::{LiquidityEstimate, OrderBook};

/// Risk configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Assumed volatility (percent) while history has fewer than 2 samples
    pub default_volatility_pct: f64,
    /// Levels requested from the target exchange
    pub order_book_depth: usize,
    /// Fill ratio at or above which liquidity adds no risk
    pub full_fill_ratio: f64,
    /// Fill ratio band adding a small penalty
    pub good_fill_ratio: f64,
    /// Fill ratio band adding a moderate penalty; below it the penalty is large
    pub fair_fill_ratio: f64,
    /// Score returned when assessment cannot complete
    pub fail_safe_score: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            default_volatility_pct: 0.5,
            order_book_depth: 20,
            full_fill_ratio: 1.0,
            good_fill_ratio: 0.9,
            fair_fill_ratio: 0.8,
            fail_safe_score: 80.0,
        }
    }
}

/// Outcome of a risk assessment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessmentResult {
    /// 0-100, higher is riskier
    pub risk_score: f64,
    pub slippage_pct: f64,
    pub volatility_pct: f64,
    pub liquidity: LiquidityEstimate,
    pub fill_ratio: f64,
    pub notes: Vec<String>,
}

/// Raw factors fed into [`score`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskFactors {
    pub spread_pct: f64,
    pub volatility_pct: f64,
    pub fill_ratio: f64,
    pub slippage_pct: f64,
}

const NEUTRAL_SCORE: f64 = 50.0;
const MAX_SPREAD_CREDIT: f64 = 30.0;
const MAX_VOLATILITY_PENALTY: f64 = 30.0;
const MAX_SLIPPAGE_PENALTY: f64 = 20.0;

/// Score the factors, returning the clamped score and one note per factor
pub fn score(factors: &RiskFactors, config: &RiskConfig) -> (f64, Vec<String>) {
    let mut notes = Vec::with_capacity(4);
    let mut score = NEUTRAL_SCORE;

    let spread_credit = (factors.spread_pct.abs() * 10.0).min(MAX_SPREAD_CREDIT);
    score -= spread_credit;
    notes.push(format!(
        "spread {:.3}% lowers risk by {:.1}",
        factors.spread_pct.abs(),
        spread_credit
    ));

    let volatility = factors.volatility_pct.max(0.0);
    let volatility_penalty = (volatility * 10.0).min(MAX_VOLATILITY_PENALTY);
    score += volatility_penalty;
    notes.push(format!(
        "volatility {:.3}% raises risk by {:.1}",
        volatility, volatility_penalty
    ));

    let fill_penalty = if factors.fill_ratio >= config.full_fill_ratio {
        0.0
    } else if factors.fill_ratio >= config.good_fill_ratio {
        5.0
    } else if factors.fill_ratio >= config.fair_fill_ratio {
        15.0
    } else {
        30.0
    };
    score += fill_penalty;
    notes.push(format!(
        "fill ratio {:.1}% raises risk by {:.1}",
        factors.fill_ratio * 100.0,
        fill_penalty
    ));

    let slippage_penalty = (factors.slippage_pct.abs() * 20.0).min(MAX_SLIPPAGE_PENALTY);
    score += slippage_penalty;
    notes.push(format!(
        "slippage {:.3}% raises risk by {:.1}",
        factors.slippage_pct, slippage_penalty
    ));

    let score = if score.is_finite() {
        score.clamp(0.0, 100.0)
    } else {
        config.fail_safe_score
    };
    (score, notes)
}

/// Slippage of the expected average fill against the book mid, percent.
/// Falls back to `reference_price` when the book has no mid.
pub fn slippage_pct(book: &OrderBook, estimate: &LiquidityEstimate, reference_price: f64) -> f64 {
    if estimate.fillable_qty <= 0.0 {
        return 0.0;
    }
    let mid = book.mid_price().unwrap_or(reference_price);
    if mid > 0.0 {
        (estimate.expected_avg_price - mid) / mid * 100.0
    } else {
        0.0
    }
}

pub struct RiskAssessor {
    config: RiskConfig,
}

impl RiskAssessor {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Assess an opportunity for a trade of `target_qty` units
    pub async fn assess(
        &self,
        discovery: &PriceDiscovery,
        opportunity: &Opportunity,
        target_qty: f64,
    ) -> RiskAssessmentResult {
        let mut notes = Vec::new();
        let volatility_pct = if discovery.history_len(&opportunity.symbol) < 2 {
            notes.push(format!(
                "insufficient price history, assuming {:.2}% volatility",
                self.config.default_volatility_pct
            ));
            self.config.default_volatility_pct
        } else {
            discovery.volatility_pct(&opportunity.symbol)
        };

        if !(target_qty.is_finite() && target_qty > 0.0) {
            return self.fail_safe(volatility_pct, notes, format!("invalid target quantity {}", target_qty));
        }

        let book = match discovery
            .order_book(
                opportunity.sell_exchange(),
                &opportunity.symbol,
                self.config.order_book_depth,
            )
            .await
        {
            Ok(book) => book,
            Err(e) => return self.fail_safe(volatility_pct, notes, e.to_string()),
        };

        let liquidity = book.walk_asks(target_qty);
        let fill_ratio = liquidity.fill_ratio(target_qty);
        let slippage_pct = slippage_pct(&book, &liquidity, opportunity.target_price);

        let (risk_score, factor_notes) = score(
            &RiskFactors {
                spread_pct: opportunity.spread_pct,
                volatility_pct,
                fill_ratio,
                slippage_pct,
            },
            &self.config,
        );
        notes.extend(factor_notes);

        debug!(
            symbol = %opportunity.symbol,
            action = %opportunity.action,
            risk_score,
            fill_ratio,
            slippage_pct,
            volatility_pct,
            "Risk assessed"
        );

        RiskAssessmentResult {
            risk_score,
            slippage_pct,
            volatility_pct,
            liquidity,
            fill_ratio,
            notes,
        }
    }

    fn fail_safe(
        &self,
        volatility_pct: f64,
        mut notes: Vec<String>,
        reason: String,
    ) -> RiskAssessmentResult {
        warn!(reason = %reason, score = self.config.fail_safe_score, "Risk assessment fell back to fail-safe");
        notes.push(format!("assessment failed ({}), using conservative score", reason));
        RiskAssessmentResult {
            risk_score: self.config.fail_safe_score,
            slippage_pct: 0.0,
            volatility_pct,
            liquidity: LiquidityEstimate::default(),
            fill_ratio: 0.0,
            notes,
        }
    }
}

impl Default for RiskAssessor {
    fn default() -> Self {
        Self::new(RiskConfig::default())
    }
}
