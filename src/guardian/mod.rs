//! Guardian - final deterministic veto before execution
//!
//! Hard limits are evaluated in order and the first failure short-circuits
//! with its reason. The exposure check only collects a warning.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::audit::{AuditAction, AuditLog};
use crate::error::ControlError;
use crate::portfolio::Portfolio;
use crate::risk::RiskAssessmentResult;

/// Volatility (percent) above which a trade is vetoed when enabled
pub const HIGH_VOLATILITY_PCT: f64 = 2.0;
/// Risk score above which a trade is always vetoed
pub const MAX_RISK_SCORE: f64 = 75.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VetoConditions {
    /// Veto when either leg's exchange failed to quote this poll
    pub exchange_outage: bool,
    /// Veto when volatility exceeds [`HIGH_VOLATILITY_PCT`]
    pub high_volatility: bool,
}

impl Default for VetoConditions {
    fn default() -> Self {
        Self {
            exchange_outage: true,
            high_volatility: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardianConfig {
    pub max_trade_pct_of_portfolio: f64,
    pub daily_max_trades: usize,
    pub global_max_exposure_pct: f64,
    pub veto_conditions: VetoConditions,
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            max_trade_pct_of_portfolio: 0.15,
            daily_max_trades: 50,
            global_max_exposure_pct: 0.8,
            veto_conditions: VetoConditions::default(),
        }
    }
}

/// Partial update; `None` leaves a field unchanged
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuardianConfigUpdate {
    pub max_trade_pct_of_portfolio: Option<f64>,
    pub daily_max_trades: Option<usize>,
    pub global_max_exposure_pct: Option<f64>,
    pub exchange_outage: Option<bool>,
    pub high_volatility: Option<bool>,
}

impl GuardianConfig {
    /// Validate and apply a partial update, returning the new config
    pub fn apply(&self, update: &GuardianConfigUpdate) -> Result<GuardianConfig, ControlError> {
        let mut next = self.clone();
        if let Some(pct) = update.max_trade_pct_of_portfolio {
            next.max_trade_pct_of_portfolio =
                ControlError::require_range("max_trade_pct_of_portfolio", pct, 0.0, 1.0)?;
        }
        if let Some(trades) = update.daily_max_trades {
            next.daily_max_trades = trades;
        }
        if let Some(pct) = update.global_max_exposure_pct {
            next.global_max_exposure_pct =
                ControlError::require_range("global_max_exposure_pct", pct, 0.0, 1.0)?;
        }
        if let Some(flag) = update.exchange_outage {
            next.veto_conditions.exchange_outage = flag;
        }
        if let Some(flag) = update.high_volatility {
            next.veto_conditions.high_volatility = flag;
        }
        Ok(next)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardianVerdict {
    pub pass: bool,
    pub reason: Option<String>,
    pub warnings: Vec<String>,
}

impl GuardianVerdict {
    fn veto(reason: String, warnings: Vec<String>) -> Self {
        Self {
            pass: false,
            reason: Some(reason),
            warnings,
        }
    }
}

/// Inputs the Guardian reads; snapshots only
pub struct GuardianCheck<'a> {
    pub allocated_amount: f64,
    pub risk: &'a RiskAssessmentResult,
    pub portfolio: &'a Portfolio,
    pub audit: &'a AuditLog,
    /// True when the buy or sell exchange produced no price this poll
    pub exchange_outage: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Guardian {
    config: GuardianConfig,
}

impl Guardian {
    pub fn new(config: GuardianConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GuardianConfig {
        &self.config
    }

    pub fn update_config(
        &mut self,
        update: &GuardianConfigUpdate,
    ) -> Result<GuardianConfig, ControlError> {
        self.config = self.config.apply(update)?;
        info!(config = ?self.config, "Guardian config updated");
        Ok(self.config.clone())
    }

    pub fn check(&self, input: &GuardianCheck<'_>) -> GuardianVerdict {
        let cfg = &self.config;
        let mut warnings = Vec::new();
        let total_value = input.portfolio.total_value;

        // 1. trade size
        if !(total_value.is_finite() && total_value > 0.0) {
            return self.vetoed(
                format!("portfolio value {:.2} is not positive", total_value),
                warnings,
            );
        }
        let trade_pct = input.allocated_amount / total_value;
        if trade_pct > cfg.max_trade_pct_of_portfolio {
            return self.vetoed(
                format!(
                    "trade size {:.2}% of portfolio exceeds limit {:.2}%",
                    trade_pct * 100.0,
                    cfg.max_trade_pct_of_portfolio * 100.0
                ),
                warnings,
            );
        }

        // 2. daily trade count
        let trades_today = input.audit.count_today(AuditAction::ExecutionCompleted);
        if trades_today >= cfg.daily_max_trades {
            return self.vetoed(
                format!(
                    "daily trade limit reached ({}/{})",
                    trades_today, cfg.daily_max_trades
                ),
                warnings,
            );
        }

        // 3. exposure, warning only
        let exposure = (total_value - input.portfolio.cash) / total_value;
        if exposure > cfg.global_max_exposure_pct {
            warnings.push(format!(
                "exposure {:.2}% above {:.2}%",
                exposure * 100.0,
                cfg.global_max_exposure_pct * 100.0
            ));
        }

        // 4. volatility
        if cfg.veto_conditions.high_volatility && input.risk.volatility_pct > HIGH_VOLATILITY_PCT {
            return self.vetoed(
                format!(
                    "volatility {:.2}% above {:.2}%",
                    input.risk.volatility_pct, HIGH_VOLATILITY_PCT
                ),
                warnings,
            );
        }

        // 5. risk score
        if input.risk.risk_score > MAX_RISK_SCORE {
            return self.vetoed(
                format!(
                    "risk score {:.1} above {:.1}",
                    input.risk.risk_score, MAX_RISK_SCORE
                ),
                warnings,
            );
        }

        // 6. exchange outage
        if cfg.veto_conditions.exchange_outage && input.exchange_outage {
            return self.vetoed("exchange outage on a trade leg".to_string(), warnings);
        }

        GuardianVerdict {
            pass: true,
            reason: None,
            warnings,
        }
    }

    fn vetoed(&self, reason: String, warnings: Vec<String>) -> GuardianVerdict {
        warn!(reason = %reason, "Guardian veto");
        GuardianVerdict::veto(reason, warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::LiquidityEstimate;
    use serde_json::json;

    fn risk(score: f64, volatility_pct: f64) -> RiskAssessmentResult {
        RiskAssessmentResult {
            risk_score: score,
            slippage_pct: 0.0,
            volatility_pct,
            liquidity: LiquidityEstimate::default(),
            fill_ratio: 1.0,
            notes: vec![],
        }
    }

    fn check<'a>(
        amount: f64,
        risk: &'a RiskAssessmentResult,
        portfolio: &'a Portfolio,
        audit: &'a AuditLog,
    ) -> GuardianCheck<'a> {
        GuardianCheck {
            allocated_amount: amount,
            risk,
            portfolio,
            audit,
            exchange_outage: false,
        }
    }

    #[test]
    fn oversized_trade_vetoed_with_percentage() {
        let guardian = Guardian::default();
        let portfolio = Portfolio::new(100_000.0);
        let audit = AuditLog::new();
        let r = risk(40.0, 0.5);
        let verdict = guardian.check(&check(20_000.0, &r, &portfolio, &audit));
        assert!(!verdict.pass);
        let reason = verdict.reason.unwrap();
        assert!(reason.contains("20.00%"), "{}", reason);
        assert!(reason.contains("15.00%"), "{}", reason);
    }

    #[test]
    fn daily_limit_counts_todays_completions() {
        let guardian = Guardian::new(GuardianConfig {
            daily_max_trades: 1,
            ..Default::default()
        });
        let portfolio = Portfolio::new(100_000.0);
        let mut audit = AuditLog::new();
        let r = risk(40.0, 0.5);
        assert!(guardian.check(&check(1_000.0, &r, &portfolio, &audit)).pass);

        audit.record(AuditAction::ExecutionCompleted, Some("BTCUSDT"), json!({}));
        let verdict = guardian.check(&check(1_000.0, &r, &portfolio, &audit));
        assert!(!verdict.pass);
        assert!(verdict.reason.unwrap().contains("daily trade limit"));
    }

    #[test]
    fn exposure_only_warns() {
        let guardian = Guardian::default();
        let mut portfolio = Portfolio::new(100_000.0);
        portfolio.cash = 10_000.0;
        let audit = AuditLog::new();
        let r = risk(40.0, 0.5);
        let verdict = guardian.check(&check(1_000.0, &r, &portfolio, &audit));
        assert!(verdict.pass);
        assert_eq!(verdict.warnings.len(), 1);
    }

    #[test]
    fn volatility_veto_can_be_disabled() {
        let mut guardian = Guardian::default();
        let portfolio = Portfolio::new(100_000.0);
        let audit = AuditLog::new();
        let r = risk(40.0, 3.0);
        assert!(!guardian.check(&check(1_000.0, &r, &portfolio, &audit)).pass);

        guardian
            .update_config(&GuardianConfigUpdate {
                high_volatility: Some(false),
                ..Default::default()
            })
            .unwrap();
        assert!(guardian.check(&check(1_000.0, &r, &portfolio, &audit)).pass);
    }

    #[test]
    fn high_risk_vetoed() {
        let guardian = Guardian::default();
        let portfolio = Portfolio::new(100_000.0);
        let audit = AuditLog::new();
        let r = risk(80.0, 0.5);
        let verdict = guardian.check(&check(1_000.0, &r, &portfolio, &audit));
        assert!(verdict.reason.unwrap().contains("risk score"));
    }

    #[test]
    fn trade_size_checked_before_risk() {
        let guardian = Guardian::default();
        let portfolio = Portfolio::new(100_000.0);
        let audit = AuditLog::new();
        let r = risk(95.0, 5.0);
        let verdict = guardian.check(&check(50_000.0, &r, &portfolio, &audit));
        assert!(verdict.reason.unwrap().contains("trade size"));
    }

    #[test]
    fn outage_vetoed_when_enabled() {
        let guardian = Guardian::default();
        let portfolio = Portfolio::new(100_000.0);
        let audit = AuditLog::new();
        let r = risk(40.0, 0.5);
        let mut input = check(1_000.0, &r, &portfolio, &audit);
        input.exchange_outage = true;
        assert!(!guardian.check(&input).pass);
    }

    #[test]
    fn zero_portfolio_is_vetoed() {
        let guardian = Guardian::default();
        let portfolio = Portfolio::new(0.0);
        let audit = AuditLog::new();
        let r = risk(40.0, 0.5);
        assert!(!guardian.check(&check(0.0, &r, &portfolio, &audit)).pass);
    }

    #[test]
    fn update_rejects_out_of_range() {
        let mut guardian = Guardian::default();
        let err = guardian
            .update_config(&GuardianConfigUpdate {
                max_trade_pct_of_portfolio: Some(1.5),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, ControlError::OutOfRange { .. }));
        assert_eq!(guardian.config().max_trade_pct_of_portfolio, 0.15);

        let updated = guardian
            .update_config(&GuardianConfigUpdate {
                daily_max_trades: Some(3),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(updated.daily_max_trades, 3);
        assert!(updated.veto_conditions.exchange_outage);
    }
}
