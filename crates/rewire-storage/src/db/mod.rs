//! SQLite-backed budget store.
//!
//! Budget state and settings are single-row tables; the session log lives in
//! its own module.

pub(crate) mod helpers;
mod sessions;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use crate::migrations;
use crate::models::{BudgetState, SessionRecord, Settings};
use crate::store::{BudgetStore, StoreError};
use helpers::{parse_optional_date, parse_optional_datetime, parse_string_list};

/// Database connection wrapper
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Create a new database connection
    ///
    /// # Errors
    ///
    /// Returns an error if database directory creation, connection opening, or schema initialization fails
    pub fn new(db_path: Option<PathBuf>) -> Result<Self> {
        let path = db_path.unwrap_or_else(Self::default_db_path);

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let conn = Connection::open(&path).context("Failed to open database connection")?;
        migrations::init_schema(&conn)?;

        log::info!("Database initialized at: {}", path.display());

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a private in-memory database
    ///
    /// # Errors
    ///
    /// Returns an error if schema initialization fails
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        migrations::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Get default database path
    fn default_db_path() -> PathBuf {
        let mut path = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push("rewire");
        path.push("rewire.db");
        path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable(String::from("connection mutex poisoned")))
    }

    // ==================== Budget State Methods ====================

    /// Get the budget state, or a fresh default if none was saved yet
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a stored value is corrupt
    pub fn get_budget_state(&self) -> Result<BudgetState, StoreError> {
        let conn = self.conn()?;
        let state = conn
            .query_row(
                "SELECT remaining_units, daily_session_count, cost_factor_base, compulsion_index,
                        daily_forbidden_time_ms, daily_session_time_sum_ms, last_budget_reset_date,
                        last_forbidden_at, last_decay_at, compulsion_index_at_last_forbidden
                 FROM budget_state WHERE id = 1",
                [],
                |row| {
                    Ok(BudgetState {
                        remaining_units: row.get(0)?,
                        daily_session_count: row.get(1)?,
                        cost_factor_base: row.get(2)?,
                        compulsion_index: row.get(3)?,
                        daily_forbidden_time_ms: row.get(4)?,
                        daily_session_time_sum_ms: row.get(5)?,
                        last_budget_reset_date: parse_optional_date(row.get(6)?)?,
                        last_forbidden_at: parse_optional_datetime(row.get(7)?)?,
                        last_decay_at: parse_optional_datetime(row.get(8)?)?,
                        compulsion_index_at_last_forbidden: row.get(9)?,
                    })
                },
            )
            .optional()?;

        Ok(state.unwrap_or_default())
    }

    /// Save the budget state as a single upsert
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails
    pub fn save_budget_state(&self, state: &BudgetState) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT INTO budget_state (id, remaining_units, daily_session_count, cost_factor_base,
                                       compulsion_index, daily_forbidden_time_ms, daily_session_time_sum_ms,
                                       last_budget_reset_date, last_forbidden_at, last_decay_at,
                                       compulsion_index_at_last_forbidden)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                remaining_units = ?1,
                daily_session_count = ?2,
                cost_factor_base = ?3,
                compulsion_index = ?4,
                daily_forbidden_time_ms = ?5,
                daily_session_time_sum_ms = ?6,
                last_budget_reset_date = ?7,
                last_forbidden_at = ?8,
                last_decay_at = ?9,
                compulsion_index_at_last_forbidden = ?10",
            params![
                state.remaining_units,
                state.daily_session_count,
                state.cost_factor_base,
                state.compulsion_index,
                state.daily_forbidden_time_ms,
                state.daily_session_time_sum_ms,
                state
                    .last_budget_reset_date
                    .map(|d| d.format("%Y-%m-%d").to_string()),
                state.last_forbidden_at.map(|dt| dt.to_rfc3339()),
                state.last_decay_at.map(|dt| dt.to_rfc3339()),
                state.compulsion_index_at_last_forbidden,
            ],
        )?;
        Ok(())
    }

    // ==================== Settings Methods ====================

    /// Get or create settings
    ///
    /// # Errors
    ///
    /// Returns an error if the database query or insert operation fails
    pub fn get_settings(&self) -> Result<Settings, StoreError> {
        let result: Option<Settings> = self
            .conn()?
            .query_row(
                "SELECT blocker_active, extractive_apps, forbidden_urls FROM settings WHERE id = 1",
                [],
                |row| {
                    Ok(Settings {
                        blocker_active: row.get::<_, i32>(0)? != 0,
                        extractive_apps: parse_string_list(&row.get::<_, String>(1)?),
                        forbidden_urls: parse_string_list(&row.get::<_, String>(2)?),
                    })
                },
            )
            .optional()?;

        if let Some(settings) = result {
            Ok(settings)
        } else {
            // Create default settings
            let settings = Settings::default_settings();
            self.update_settings(&settings)?;
            Ok(settings)
        }
    }

    /// Update settings
    ///
    /// # Errors
    ///
    /// Returns an error if the database update operation or JSON serialization fails
    pub fn update_settings(&self, settings: &Settings) -> Result<(), StoreError> {
        let extractive_apps_json = serde_json::to_string(&settings.extractive_apps)?;
        let forbidden_urls_json = serde_json::to_string(&settings.forbidden_urls)?;

        self.conn()?.execute(
            "INSERT INTO settings (id, blocker_active, extractive_apps, forbidden_urls)
             VALUES (1, ?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                blocker_active = ?1,
                extractive_apps = ?2,
                forbidden_urls = ?3",
            params![
                i32::from(settings.blocker_active),
                extractive_apps_json,
                forbidden_urls_json,
            ],
        )?;
        Ok(())
    }
}

impl BudgetStore for Database {
    fn load_state(&self) -> Result<BudgetState, StoreError> {
        self.get_budget_state()
    }

    fn save_state(&self, state: &BudgetState) -> Result<(), StoreError> {
        self.save_budget_state(state)
    }

    fn load_settings(&self) -> Result<Settings, StoreError> {
        self.get_settings()
    }

    fn save_settings(&self, settings: &Settings) -> Result<(), StoreError> {
        self.update_settings(settings)
    }

    fn append_session(&self, record: &SessionRecord) -> Result<(), StoreError> {
        self.insert_session(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};

    #[test]
    fn test_fresh_database_returns_default_state() {
        let db = Database::in_memory().unwrap();
        assert_eq!(db.get_budget_state().unwrap(), BudgetState::default());
    }

    #[test]
    fn test_budget_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rewire.db");

        let state = BudgetState {
            remaining_units: -50,
            daily_session_count: 4,
            cost_factor_base: 1.75,
            compulsion_index: 0.42,
            daily_forbidden_time_ms: 120_000,
            daily_session_time_sum_ms: 120_000,
            last_budget_reset_date: NaiveDate::from_ymd_opt(2024, 5, 1),
            last_forbidden_at: Some(Utc.with_ymd_and_hms(2024, 5, 1, 21, 30, 0).unwrap()),
            last_decay_at: None,
            compulsion_index_at_last_forbidden: 0.42,
        };

        {
            let db = Database::new(Some(path.clone())).unwrap();
            db.save_budget_state(&state).unwrap();
        }

        let db = Database::new(Some(path)).unwrap();
        assert_eq!(db.get_budget_state().unwrap(), state);
    }

    #[test]
    fn test_settings_created_on_first_read() {
        let db = Database::in_memory().unwrap();
        let settings = db.get_settings().unwrap();
        assert_eq!(settings, Settings::default_settings());

        let mut updated = settings;
        updated.forbidden_urls.push(String::from("reddit.com"));
        updated.blocker_active = false;
        db.update_settings(&updated).unwrap();

        assert_eq!(db.get_settings().unwrap(), updated);
    }
}
