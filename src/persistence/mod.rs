//! State persistence
//!
//! The whole process state is one JSON document. Stores load it (falling
//! back to a default when absent) and replace it atomically on save.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, info};

use crate::audit::AuditLog;
use crate::execution::ExecutionLog;
use crate::guardian::GuardianConfig;
use crate::portfolio::Portfolio;
use crate::runner::RunnerState;

/// Operator settings recorded alongside the state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub symbols: Vec<String>,
    pub poll_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            poll_interval_ms: 2_000,
        }
    }
}

/// Durable process-wide state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppState {
    pub portfolio: Portfolio,
    pub runner: RunnerState,
    pub guardian: GuardianConfig,
    pub audit: AuditLog,
    pub executions: ExecutionLog,
    pub settings: Settings,
}

impl AppState {
    pub fn new(initial_cash: f64) -> Self {
        Self {
            portfolio: Portfolio::new(initial_cash),
            ..Default::default()
        }
    }
}

/// Durable key-value store holding the single state document
pub trait StateStore: Send + Sync {
    /// Stored state, or None when nothing has been saved yet
    fn load(&self) -> Result<Option<AppState>>;

    /// Replace the stored state; all-or-nothing
    fn save(&self, state: &AppState) -> Result<()>;

    fn load_or(&self, default: AppState) -> Result<AppState> {
        Ok(self.load()?.unwrap_or(default))
    }
}

/// JSON file store. Saves write a sibling temp file and rename it over the
/// target so readers never see a partial document.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "state.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl StateStore for JsonFileStore {
    fn load(&self) -> Result<Option<AppState>> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "No state file found, starting fresh");
            return Ok(None);
        }
        let json = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read state file {}", self.path.display()))?;
        let state: AppState = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse state file {}", self.path.display()))?;
        info!(
            path = %self.path.display(),
            cash = %format!("${:.2}", state.portfolio.cash),
            audit_entries = state.audit.len(),
            executions = state.executions.len(),
            "State loaded"
        );
        Ok(Some(state))
    }

    fn save(&self, state: &AppState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).context("Failed to create state directory")?;
            }
        }
        let json = serde_json::to_vec(state).context("Failed to serialize state")?;
        let tmp = self.temp_path();
        fs::write(&tmp, json).context("Failed to write temp state file")?;
        fs::rename(&tmp, &self.path).context("Failed to replace state file")?;
        debug!(path = %self.path.display(), "State saved");
        Ok(())
    }
}

/// In-memory store keeping the serialized document
#[derive(Debug, Default)]
pub struct MemoryStore {
    document: RwLock<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn load(&self) -> Result<Option<AppState>> {
        let guard = self
            .document
            .read()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        match guard.as_deref() {
            Some(json) => Ok(Some(
                serde_json::from_str(json).context("Failed to parse stored state")?,
            )),
            None => Ok(None),
        }
    }

    fn save(&self, state: &AppState) -> Result<()> {
        let json = serde_json::to_string(state).context("Failed to serialize state")?;
        let mut guard = self
            .document
            .write()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        *guard = Some(json);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditAction;
    use crate::portfolio::Position;
    use crate::types::Exchange;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("crossarb_state_{}", uuid::Uuid::new_v4()))
    }

    fn sample_state() -> AppState {
        let mut state = AppState::new(25_000.0);
        state.portfolio.apply_pnl(12.5);
        state.portfolio.positions.push(Position {
            symbol: "BTCUSDT".to_string(),
            exchange: Exchange::Bybit,
            quantity: 0.01,
            avg_price: 50_000.0,
        });
        state.audit.record(
            AuditAction::ExecutionCompleted,
            Some("BTCUSDT"),
            serde_json::json!({"net_profit": 12.5}),
        );
        state.runner.poll_count = 7;
        state
    }

    #[test]
    fn missing_file_loads_default() {
        let dir = temp_dir();
        let store = JsonFileStore::new(dir.join("state.json"));
        let state = store.load_or(AppState::new(1_234.0)).unwrap();
        assert_eq!(state.portfolio.cash, 1_234.0);
        assert!(state.audit.is_empty());
    }

    #[test]
    fn file_round_trip_is_field_for_field() {
        let dir = temp_dir();
        let store = JsonFileStore::new(dir.join("nested").join("state.json"));
        let state = sample_state();

        store.save(&state).unwrap();
        assert!(!store.temp_path().exists());
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.portfolio, state.portfolio);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn corrupt_file_is_an_error_and_left_untouched() {
        let dir = temp_dir();
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("state.json");
        fs::write(&path, "{ not json").unwrap();

        let store = JsonFileStore::new(&path);
        assert!(store.load().is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), "{ not json");

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryStore::new();
        assert!(store.load().unwrap().is_none());
        let state = sample_state();
        store.save(&state).unwrap();
        assert_eq!(store.load().unwrap().unwrap(), state);
    }

    #[test]
    fn fractional_pnl_survives_both_stores() {
        let mut state = AppState::new(100_000.0);
        for pnl in [131.27391, -48.1097, 0.3333333, 17.777777, 1e-9] {
            state.portfolio.apply_pnl(pnl);
        }

        let memory = MemoryStore::new();
        memory.save(&state).unwrap();
        let loaded = memory.load().unwrap().unwrap();
        assert_eq!(loaded.portfolio, state.portfolio);
        assert_eq!(loaded.portfolio.cash.to_bits(), state.portfolio.cash.to_bits());

        let dir = temp_dir();
        let file = JsonFileStore::new(dir.join("state.json"));
        file.save(&state).unwrap();
        let loaded = file.load().unwrap().unwrap();
        assert_eq!(loaded.portfolio, state.portfolio);
        assert_eq!(loaded, state);

        let _ = fs::remove_dir_all(dir);
    }
}
