//! Append-only audit trail
//!
//! Every pipeline decision point writes an [`AuditLogEntry`]. A bounded
//! [`EnhancedAuditEntry`] ring keeps one full snapshot per processed
//! opportunity. The Guardian's daily trade count is derived from here.

use anyhow::{Context, Result};
use chrono::{NaiveDate, TimeZone, Utc};
use csv::WriterBuilder;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::allocation::AllocationResult;
use crate::arbitrage::Opportunity;
use crate::debate::DebateResult;
use crate::execution::ExecutionResult;
use crate::guardian::GuardianVerdict;
use crate::risk::RiskAssessmentResult;
use crate::types::now_ms;

/// Snapshots kept in the enhanced ring
pub const ENHANCED_AUDIT_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    RunnerStarted,
    RunnerStopped,
    OpportunityDetected,
    RiskAssessed,
    CapitalAllocated,
    AllocationSkipped,
    DebateConcluded,
    GuardianPassed,
    GuardianVetoed,
    OrderPlaced,
    SellSimulated,
    RollbackTriggered,
    ExecutionCompleted,
    ExecutionFailed,
    OpportunityFailed,
    GuardianConfigUpdated,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::RunnerStarted => "runner_started",
            AuditAction::RunnerStopped => "runner_stopped",
            AuditAction::OpportunityDetected => "opportunity_detected",
            AuditAction::RiskAssessed => "risk_assessed",
            AuditAction::CapitalAllocated => "capital_allocated",
            AuditAction::AllocationSkipped => "allocation_skipped",
            AuditAction::DebateConcluded => "debate_concluded",
            AuditAction::GuardianPassed => "guardian_passed",
            AuditAction::GuardianVetoed => "guardian_vetoed",
            AuditAction::OrderPlaced => "order_placed",
            AuditAction::SellSimulated => "sell_simulated",
            AuditAction::RollbackTriggered => "rollback_triggered",
            AuditAction::ExecutionCompleted => "execution_completed",
            AuditAction::ExecutionFailed => "execution_failed",
            AuditAction::OpportunityFailed => "opportunity_failed",
            AuditAction::GuardianConfigUpdated => "guardian_config_updated",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: String,
    pub timestamp: i64,
    pub action: AuditAction,
    pub symbol: Option<String>,
    pub details: serde_json::Value,
}

/// Everything the pipeline knew about one opportunity when it finished with it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancedAuditEntry {
    pub id: String,
    pub timestamp: i64,
    pub opportunity: Opportunity,
    pub risk: Option<RiskAssessmentResult>,
    pub allocation: Option<AllocationResult>,
    pub debate: Option<DebateResult>,
    pub guardian: Option<GuardianVerdict>,
    pub execution: Option<ExecutionResult>,
    /// Short label for where the opportunity's journey ended
    pub outcome: String,
}

impl EnhancedAuditEntry {
    pub fn new(opportunity: &Opportunity) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: now_ms(),
            opportunity: opportunity.clone(),
            risk: None,
            allocation: None,
            debate: None,
            guardian: None,
            execution: None,
            outcome: "pending".to_string(),
        }
    }
}

/// Query over the audit log. Empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditFilter {
    pub action: Option<AuditAction>,
    pub symbol: Option<String>,
    /// Inclusive lower bound (ms)
    pub since: Option<i64>,
    /// Inclusive upper bound (ms)
    pub until: Option<i64>,
    /// Keep only the most recent N matches
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn action(action: AuditAction) -> Self {
        Self {
            action: Some(action),
            ..Default::default()
        }
    }

    fn matches(&self, entry: &AuditLogEntry) -> bool {
        self.action.map_or(true, |a| entry.action == a)
            && self
                .symbol
                .as_deref()
                .map_or(true, |s| entry.symbol.as_deref() == Some(s))
            && self.since.map_or(true, |t| entry.timestamp >= t)
            && self.until.map_or(true, |t| entry.timestamp <= t)
    }
}

#[derive(Debug, Serialize)]
struct AuditCsvRow<'a> {
    id: &'a str,
    timestamp: i64,
    action: &'static str,
    symbol: &'a str,
    details: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLog {
    entries: Vec<AuditLogEntry>,
    #[serde(default)]
    enhanced: VecDeque<EnhancedAuditEntry>,
    #[serde(default = "default_enhanced_capacity")]
    enhanced_capacity: usize,
}

fn default_enhanced_capacity() -> usize {
    ENHANCED_AUDIT_CAPACITY
}

impl Default for AuditLog {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            enhanced: VecDeque::new(),
            enhanced_capacity: ENHANCED_AUDIT_CAPACITY,
        }
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry stamped now; returns its id
    pub fn record(
        &mut self,
        action: AuditAction,
        symbol: Option<&str>,
        details: serde_json::Value,
    ) -> String {
        self.record_at(action, symbol, details, now_ms())
    }

    pub fn record_at(
        &mut self,
        action: AuditAction,
        symbol: Option<&str>,
        details: serde_json::Value,
        timestamp: i64,
    ) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.entries.push(AuditLogEntry {
            id: id.clone(),
            timestamp,
            action,
            symbol: symbol.map(str::to_string),
            details,
        });
        id
    }

    /// Push an enhanced snapshot, evicting the oldest beyond capacity
    pub fn record_enhanced(&mut self, entry: EnhancedAuditEntry) {
        self.enhanced.push_back(entry);
        while self.enhanced.len() > self.enhanced_capacity {
            self.enhanced.pop_front();
        }
    }

    pub fn entries(&self) -> &[AuditLogEntry] {
        &self.entries
    }

    pub fn enhanced(&self) -> impl Iterator<Item = &EnhancedAuditEntry> {
        self.enhanced.iter()
    }

    pub fn enhanced_len(&self) -> usize {
        self.enhanced.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&AuditLogEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Matching entries in chronological order
    pub fn query(&self, filter: &AuditFilter) -> Vec<AuditLogEntry> {
        let matched: Vec<&AuditLogEntry> =
            self.entries.iter().filter(|e| filter.matches(e)).collect();
        let skip = filter
            .limit
            .map_or(0, |limit| matched.len().saturating_sub(limit));
        matched.into_iter().skip(skip).cloned().collect()
    }

    /// Entries of `action` whose UTC date is `day`
    pub fn count_on_day(&self, action: AuditAction, day: NaiveDate) -> usize {
        self.entries
            .iter()
            .filter(|e| e.action == action)
            .filter(|e| {
                Utc.timestamp_millis_opt(e.timestamp)
                    .single()
                    .map(|dt| dt.date_naive())
                    == Some(day)
            })
            .count()
    }

    pub fn count_today(&self, action: AuditAction) -> usize {
        self.count_on_day(action, Utc::now().date_naive())
    }

    /// Write every entry as CSV; details are embedded as JSON text
    pub fn export_csv(&self, path: &Path) -> Result<usize> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).context("Failed to create audit export directory")?;
            }
        }
        let mut writer = WriterBuilder::new()
            .has_headers(true)
            .from_path(path)
            .context("Failed to open audit export file")?;

        for entry in &self.entries {
            writer
                .serialize(AuditCsvRow {
                    id: &entry.id,
                    timestamp: entry.timestamp,
                    action: entry.action.as_str(),
                    symbol: entry.symbol.as_deref().unwrap_or(""),
                    details: entry.details.to_string(),
                })
                .context("Failed to write audit record")?;
        }
        writer.flush().context("Failed to flush audit export")?;

        info!(path = %path.display(), rows = self.entries.len(), "Audit log exported");
        Ok(self.entries.len())
    }
}
