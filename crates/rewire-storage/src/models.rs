use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Persisted economic state of the attention budget.
///
/// Only the budget engine mutates this; everything else reads snapshots.
/// Units are Dopamine Units (1 DU = 1 second at a 1.0x multiplier).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetState {
    /// May go negative: debt carries over across days
    pub remaining_units: i64,
    pub daily_session_count: u32,
    /// Slowly varying escalation base, never below 1.0
    pub cost_factor_base: f64,
    /// Smoothed compulsive-use signal in [0, 1]
    pub compulsion_index: f64,
    pub daily_forbidden_time_ms: i64,
    pub daily_session_time_sum_ms: i64,
    pub last_budget_reset_date: Option<NaiveDate>,
    pub last_forbidden_at: Option<DateTime<Utc>>,
    pub last_decay_at: Option<DateTime<Utc>>,
    pub compulsion_index_at_last_forbidden: f64,
}

impl Default for BudgetState {
    fn default() -> Self {
        Self {
            remaining_units: 0,
            daily_session_count: 0,
            cost_factor_base: 1.0,
            compulsion_index: 0.0,
            daily_forbidden_time_ms: 0,
            daily_session_time_sum_ms: 0,
            last_budget_reset_date: None,
            last_forbidden_at: None,
            last_decay_at: None,
            compulsion_index_at_last_forbidden: 0.0,
        }
    }
}

/// User-editable firewall settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub blocker_active: bool,
    /// Package names treated as extractive as soon as they reach the foreground
    pub extractive_apps: Vec<String>,
    /// Substring patterns matched against committed browser URLs
    pub forbidden_urls: Vec<String>,
}

impl Settings {
    #[must_use]
    pub fn default_settings() -> Self {
        Self {
            blocker_active: true,
            extractive_apps: vec![String::from("com.google.android.youtube")],
            forbidden_urls: Vec::new(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::default_settings()
    }
}

/// Why a sticky session was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// User switched to an unrelated foreground app
    ContextSwitch,
    /// Live budget exhaustion forced the session closed
    BudgetExhausted,
    /// The host shut the engine down mid-session
    Shutdown,
}

impl EndReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ContextSwitch => "context_switch",
            Self::BudgetExhausted => "budget_exhausted",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EndReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "context_switch" => Ok(Self::ContextSwitch),
            "budget_exhausted" => Ok(Self::BudgetExhausted),
            "shutdown" => Ok(Self::Shutdown),
            other => Err(format!("unknown end reason: {other}")),
        }
    }
}

/// One closed sticky session, kept for reporting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub package: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub forbidden_ms: i64,
    pub units_charged: i64,
    pub reason: EndReason,
}

impl SessionRecord {
    #[must_use]
    pub fn new(
        package: String,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        forbidden_ms: i64,
        units_charged: i64,
        reason: EndReason,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            package,
            started_at,
            ended_at,
            forbidden_ms,
            units_charged,
            reason,
        }
    }

    /// Wall-clock length of the session in whole seconds
    #[must_use]
    pub fn duration_seconds(&self) -> i64 {
        (self.ended_at - self.started_at).num_seconds().max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_default_state_has_unit_cost_factor() {
        let state = BudgetState::default();
        assert_eq!(state.remaining_units, 0);
        assert!((state.cost_factor_base - 1.0).abs() < f64::EPSILON);
        assert!(state.last_budget_reset_date.is_none());
    }

    #[test]
    fn test_end_reason_round_trips_through_str() {
        for reason in [
            EndReason::ContextSwitch,
            EndReason::BudgetExhausted,
            EndReason::Shutdown,
        ] {
            assert_eq!(reason.as_str().parse::<EndReason>(), Ok(reason));
        }
        assert!("bogus".parse::<EndReason>().is_err());
    }

    #[test]
    fn test_session_duration_never_negative() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 1, 9, 59, 0).unwrap();
        let record = SessionRecord::new(
            String::from("com.example"),
            start,
            end,
            0,
            0,
            EndReason::Shutdown,
        );
        assert_eq!(record.duration_seconds(), 0);
    }
}
