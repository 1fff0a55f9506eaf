//! Persistence boundary for the budget engine.
//!
//! Each call is one transaction over a whole field group: the engine loads a
//! `BudgetState`, mutates it in memory and saves it back in a single write.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use thiserror::Error;

use crate::models::{BudgetState, SessionRecord, Settings};

/// Errors surfaced by a budget store backend
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("budget store unavailable: {0}")]
    Unavailable(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupt value for {field}: {value}")]
    Corrupt { field: &'static str, value: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable key/value state consumed by the engine.
///
/// Writes are expected to be durable before returning. Callers tolerate the
/// loss of the most recent write on crash.
pub trait BudgetStore: Send + Sync {
    /// Load the full budget state
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read
    fn load_state(&self) -> Result<BudgetState, StoreError>;

    /// Persist the full budget state in one write
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be written
    fn save_state(&self, state: &BudgetState) -> Result<(), StoreError>;

    /// Load user settings, creating defaults on first use
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read
    fn load_settings(&self) -> Result<Settings, StoreError>;

    /// Persist user settings
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be written
    fn save_settings(&self, settings: &Settings) -> Result<(), StoreError>;

    /// Append a closed session to the session log
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be written
    fn append_session(&self, record: &SessionRecord) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    state: BudgetState,
    settings: Settings,
    sessions: Vec<SessionRecord>,
}

/// Volatile store used for dry runs and tests.
///
/// Can be switched into an unavailable mode to exercise the engine's
/// degraded paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_state(state: BudgetState) -> Self {
        let store = Self::new();
        if let Ok(mut inner) = store.inner.lock() {
            inner.state = state;
        }
        store
    }

    #[must_use]
    pub fn with_settings(self, settings: Settings) -> Self {
        if let Ok(mut inner) = self.inner.lock() {
            inner.settings = settings;
        }
        self
    }

    /// Make every subsequent call fail with `StoreError::Unavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Snapshot of the recorded session log
    #[must_use]
    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.inner
            .lock()
            .map(|inner| inner.sessions.clone())
            .unwrap_or_default()
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(String::from("memory store offline")));
        }
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable(String::from("memory store poisoned")))
    }
}

impl BudgetStore for MemoryStore {
    fn load_state(&self) -> Result<BudgetState, StoreError> {
        Ok(self.guard()?.state.clone())
    }

    fn save_state(&self, state: &BudgetState) -> Result<(), StoreError> {
        self.guard()?.state = state.clone();
        Ok(())
    }

    fn load_settings(&self) -> Result<Settings, StoreError> {
        Ok(self.guard()?.settings.clone())
    }

    fn save_settings(&self, settings: &Settings) -> Result<(), StoreError> {
        self.guard()?.settings = settings.clone();
        Ok(())
    }

    fn append_session(&self, record: &SessionRecord) -> Result<(), StoreError> {
        self.guard()?.sessions.push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_round_trips_state() {
        let store = MemoryStore::new();
        let state = BudgetState {
            remaining_units: -42,
            daily_session_count: 3,
            ..BudgetState::default()
        };
        store.save_state(&state).unwrap();
        assert_eq!(store.load_state().unwrap(), state);
    }

    #[test]
    fn test_unavailable_store_rejects_reads_and_writes() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.load_state(),
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.save_state(&BudgetState::default()).is_err());

        store.set_unavailable(false);
        assert!(store.load_state().is_ok());
    }

    #[test]
    fn test_default_settings_include_youtube() {
        let store = MemoryStore::new();
        let settings = store.load_settings().unwrap();
        assert!(settings.blocker_active);
        assert_eq!(settings.extractive_apps, vec!["com.google.android.youtube"]);
    }
}
