//! Session log operations.

use chrono::{DateTime, Utc};
use rusqlite::params;

use super::helpers::{parse_datetime, parse_uuid};
use super::Database;
use crate::models::{EndReason, SessionRecord};
use crate::store::StoreError;

impl Database {
    /// Append a closed session
    ///
    /// # Errors
    ///
    /// Returns an error if the database insert operation fails
    pub fn insert_session(&self, record: &SessionRecord) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT INTO sessions (id, package, started_at, ended_at, forbidden_ms, units_charged, reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id.to_string(),
                record.package,
                record.started_at.to_rfc3339(),
                record.ended_at.to_rfc3339(),
                record.forbidden_ms,
                record.units_charged,
                record.reason.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Get sessions started within a date range, oldest first
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row holds corrupt data
    pub fn get_sessions(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SessionRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, package, started_at, ended_at, forbidden_ms, units_charged, reason
             FROM sessions
             WHERE started_at BETWEEN ?1 AND ?2
             ORDER BY started_at ASC",
        )?;

        let rows = stmt
            .query_map(params![start.to_rfc3339(), end.to_rfc3339()], |row| {
                Ok((
                    SessionRecord {
                        id: parse_uuid(&row.get::<_, String>(0)?)?,
                        package: row.get(1)?,
                        started_at: parse_datetime(&row.get::<_, String>(2)?)?,
                        ended_at: parse_datetime(&row.get::<_, String>(3)?)?,
                        forbidden_ms: row.get(4)?,
                        units_charged: row.get(5)?,
                        reason: EndReason::Shutdown,
                    },
                    row.get::<_, String>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(mut record, reason)| {
                record.reason = reason.parse().map_err(|_| StoreError::Corrupt {
                    field: "sessions.reason",
                    value: reason,
                })?;
                Ok(record)
            })
            .collect()
    }

    /// Delete all sessions started before the cutoff
    ///
    /// # Errors
    ///
    /// Returns an error if the database delete operation fails
    pub fn delete_sessions_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let deleted = self.conn()?.execute(
            "DELETE FROM sessions WHERE started_at < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn record_at(package: &str, started_at: DateTime<Utc>, reason: EndReason) -> SessionRecord {
        SessionRecord::new(
            package.to_string(),
            started_at,
            started_at + Duration::minutes(5),
            90_000,
            95,
            reason,
        )
    }

    #[test]
    fn test_sessions_filtered_by_range_and_ordered() {
        let db = Database::in_memory().unwrap();
        let morning = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
        let evening = Utc.with_ymd_and_hms(2024, 1, 1, 20, 0, 0).unwrap();
        let next_day = Utc.with_ymd_and_hms(2024, 1, 2, 9, 0, 0).unwrap();

        db.insert_session(&record_at("b.app", evening, EndReason::BudgetExhausted))
            .unwrap();
        db.insert_session(&record_at("a.app", morning, EndReason::ContextSwitch))
            .unwrap();
        db.insert_session(&record_at("c.app", next_day, EndReason::Shutdown))
            .unwrap();

        let day_end = Utc.with_ymd_and_hms(2024, 1, 1, 23, 59, 59).unwrap();
        let sessions = db.get_sessions(morning, day_end).unwrap();

        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].package, "a.app");
        assert_eq!(sessions[1].package, "b.app");
        assert_eq!(sessions[1].reason, EndReason::BudgetExhausted);
    }

    #[test]
    fn test_delete_sessions_before_cutoff() {
        let db = Database::in_memory().unwrap();
        let old = Utc.with_ymd_and_hms(2023, 6, 1, 9, 0, 0).unwrap();
        let recent = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();
        db.insert_session(&record_at("old.app", old, EndReason::ContextSwitch))
            .unwrap();
        db.insert_session(&record_at("new.app", recent, EndReason::ContextSwitch))
            .unwrap();

        let deleted = db
            .delete_sessions_before(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
            .unwrap();
        assert_eq!(deleted, 1);
    }
}
