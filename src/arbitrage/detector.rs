//! Opportunity Detector - persistence buffer over pairwise spreads
//!
//! A spread only becomes an opportunity once it has been seen on enough
//! consecutive polls, or for long enough. Entries that stop being observed
//! are purged after the stale timeout.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use super::{Opportunity, OpportunityKey};
use crate::discovery::DiscoveredPrice;
use crate::types::{now_ms, TradeAction};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Minimum absolute spread to consider (percent)
    pub min_spread_pct: f64,
    /// Subtracted from the spread to estimate gross profit (percent)
    pub fee_buffer_pct: f64,
    /// Emit once first-seen to last-seen spans at least this long
    pub persistence_ms: i64,
    /// ...or once observed this many times
    pub min_persistence_count: u32,
    /// Unobserved entries older than this are purged
    pub stale_timeout_ms: i64,
    /// Optional cap on buffered keys; oldest last-seen evicted first
    pub max_buffer_entries: Option<usize>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_spread_pct: 0.5,
            fee_buffer_pct: 0.3,
            persistence_ms: 5_000,
            min_persistence_count: 3,
            stale_timeout_ms: 10_000,
            max_buffer_entries: None,
        }
    }
}

/// Per-call detection thresholds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectParams {
    pub min_spread_pct: f64,
    pub persistence_ms: i64,
    pub min_persistence_count: u32,
}

impl From<&DetectorConfig> for DetectParams {
    fn from(config: &DetectorConfig) -> Self {
        Self {
            min_spread_pct: config.min_spread_pct,
            persistence_ms: config.persistence_ms,
            min_persistence_count: config.min_persistence_count,
        }
    }
}

pub struct OpportunityDetector {
    config: DetectorConfig,
    buffer: HashMap<OpportunityKey, Opportunity>,
}

impl OpportunityDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            buffer: HashMap::new(),
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn params(&self) -> DetectParams {
        DetectParams::from(&self.config)
    }

    /// Detect with the configured thresholds at the current time
    pub fn detect(&mut self, discovered: &[DiscoveredPrice]) -> Vec<Opportunity> {
        let params = self.params();
        self.detect_at(discovered, &params, now_ms())
    }

    /// Run one detection poll at `now` (ms). Returns confirmed opportunities,
    /// best estimated gross profit first.
    pub fn detect_at(
        &mut self,
        discovered: &[DiscoveredPrice],
        params: &DetectParams,
        now: i64,
    ) -> Vec<Opportunity> {
        let mut observed: HashSet<OpportunityKey> = HashSet::new();
        let mut confirmed = Vec::new();

        let mut seen_symbols: HashSet<&str> = HashSet::new();

        for snapshot in discovered {
            // one observation per symbol per poll
            if !seen_symbols.insert(snapshot.symbol.as_str()) {
                debug!(symbol = %snapshot.symbol, "Ignoring repeated snapshot in the same poll");
                continue;
            }
            if snapshot.valid_source_count() < 2 {
                debug!(symbol = %snapshot.symbol, "Skipping symbol without two usable prices");
                continue;
            }

            for pair in &snapshot.spreads {
                let magnitude = pair.spread_pct.abs();
                if !magnitude.is_finite() || magnitude < params.min_spread_pct {
                    continue;
                }

                let action = TradeAction::from_spread(pair.base, pair.quote, pair.spread_pct);
                let (source_price, target_price) = if action.buy == pair.base {
                    (pair.base_price, pair.quote_price)
                } else {
                    (pair.quote_price, pair.base_price)
                };
                let key = OpportunityKey {
                    symbol: snapshot.symbol.clone(),
                    action,
                };
                let gross = magnitude - self.config.fee_buffer_pct;

                let entry = self
                    .buffer
                    .entry(key.clone())
                    .and_modify(|opp| {
                        opp.last_seen_ts = now;
                        opp.persistence_count += 1;
                        opp.spread_pct = magnitude;
                        opp.source_price = source_price;
                        opp.target_price = target_price;
                        opp.estimated_gross_profit_pct = gross;
                    })
                    .or_insert_with(|| Opportunity {
                        id: uuid::Uuid::new_v4().to_string(),
                        symbol: snapshot.symbol.clone(),
                        action,
                        spread_pct: magnitude,
                        estimated_gross_profit_pct: gross,
                        source_price,
                        target_price,
                        first_seen_ts: now,
                        last_seen_ts: now,
                        persistence_count: 1,
                    });

                debug!(
                    key = %key,
                    spread_pct = magnitude,
                    count = entry.persistence_count,
                    "Spread observed"
                );

                if entry.last_seen_ts - entry.first_seen_ts >= params.persistence_ms
                    || entry.persistence_count >= params.min_persistence_count
                {
                    confirmed.push(entry.clone());
                }
                observed.insert(key);
            }
        }

        self.collect_garbage(&observed, now);

        confirmed.sort_by(|a, b| {
            b.estimated_gross_profit_pct
                .partial_cmp(&a.estimated_gross_profit_pct)
                .unwrap_or(Ordering::Equal)
        });

        if !confirmed.is_empty() {
            info!(
                confirmed = confirmed.len(),
                buffered = self.buffer.len(),
                "Opportunities confirmed"
            );
        }
        confirmed
    }

    fn collect_garbage(&mut self, observed: &HashSet<OpportunityKey>, now: i64) {
        let stale_timeout = self.config.stale_timeout_ms;
        let before = self.buffer.len();
        self.buffer
            .retain(|key, opp| observed.contains(key) || now - opp.last_seen_ts <= stale_timeout);

        if let Some(cap) = self.config.max_buffer_entries {
            if self.buffer.len() > cap {
                let mut by_age: Vec<(OpportunityKey, i64)> = self
                    .buffer
                    .iter()
                    .map(|(k, o)| (k.clone(), o.last_seen_ts))
                    .collect();
                by_age.sort_by_key(|(_, ts)| *ts);
                let excess = self.buffer.len() - cap;
                for (key, _) in by_age.into_iter().take(excess) {
                    self.buffer.remove(&key);
                }
            }
        }

        let purged = before.saturating_sub(self.buffer.len());
        if purged > 0 {
            debug!(purged, remaining = self.buffer.len(), "Opportunity buffer purged");
        }
    }

    pub fn buffered(&self, key: &OpportunityKey) -> Option<&Opportunity> {
        self.buffer.get(key)
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for OpportunityDetector {
    fn default() -> Self {
        Self::new(DetectorConfig::default())
    }
}
