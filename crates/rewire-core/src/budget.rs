//! Dopamine Unit budget arithmetic.
//!
//! All economic rules live here: day rollover, session escalation, the
//! time-integrated exposure cost, compulsion feedback and abstinence decay.
//! The engine knows nothing about sessions or events; every public call is a
//! single load-mutate-save transaction against the injected `BudgetStore`, and
//! the day rollover always runs first so callers never see stale fields.
//!
//! Negative balances are debt, not errors. All arithmetic saturates.

use chrono::{DateTime, NaiveDate, Utc};
use rewire_storage::{BudgetState, BudgetStore, StoreError};
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::BudgetConfig;


/// Weight of the previous compulsion index in the moving average
const COMPULSION_SMOOTHING: f64 = 0.8;
/// Mean-session ratio at which the compulsion target starts rising
const RATIO_FLOOR: f64 = 0.05;
/// Ratio span mapped onto the [0, 1] compulsion target
const RATIO_SPAN: f64 = 0.45;
/// Clean hours required after a non-compulsive history
const DECAY_BASE_HOURS: f64 = 24.0;
/// Hours shaved off the clean window at full compulsion
const DECAY_COMPULSION_HOURS: f64 = 18.0;
/// Each further block of clean hours earns one more decay step
const DECAY_STEP_HOURS: f64 = 12.0;
const MAX_DECAY_STEPS: i64 = 5;
const COMPULSION_DECAY_PER_STEP: f64 = 0.1;

/// Outcome of charging a closed session
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Depletion {
    pub units: i64,
    pub remaining_units: i64,
    pub compulsion_index: f64,
}

/// Live pricing of an exposure, computed in one transaction
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quote {
    pub remaining_units: i64,
    pub cost_units: i64,
    pub entry_multiplier: f64,
    pub instantaneous_multiplier: f64,
}

impl Quote {
    /// Budget is gone, or the exposure would consume all of it
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.remaining_units <= 0 || self.cost_units >= self.remaining_units
    }
}

/// Pure pricing rules over one state snapshot
struct Tariff<'a> {
    state: &'a BudgetState,
    config: &'a BudgetConfig,
}

impl Tariff<'_> {
    /// Compulsion index after the day-one protection clamp
    fn effective_compulsion(&self) -> f64 {
        let c = self.state.compulsion_index.clamp(0.0, 1.0);
        if self.state.daily_session_count < self.config.day_one_sessions {
            c.min(self.config.day_one_cap)
        } else {
            c
        }
    }

    fn entry_multiplier(&self) -> f64 {
        let c = self.effective_compulsion();
        self.state.cost_factor_base
            + (0.5 + 0.5 * c) * f64::from(self.state.daily_session_count)
    }

    /// Per-second growth of the multiplier within one exposure
    fn ramp(&self) -> f64 {
        (0.001 + 0.005 * self.effective_compulsion()) * self.config.grace_multiplier
    }

    fn instantaneous_multiplier(&self, elapsed_ms: i64) -> f64 {
        self.entry_multiplier() + self.ramp() * seconds(elapsed_ms)
    }

    fn escalated_cost(&self, elapsed_ms: i64) -> i64 {
        integrated_cost(self.entry_multiplier(), self.ramp(), elapsed_ms)
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn wait_seconds(&self) -> u32 {
        let multiplier = self.entry_multiplier();
        // log2 is undefined at or below zero; fall back to the base wait
        let multiplier = if multiplier > 0.0 { multiplier } else { 1.0 };
        let wait = f64::from(self.config.base_wait_seconds) * (1.0 + multiplier.log2());
        wait.round().max(0.0) as u32
    }
}

/// Time integral of `f_entry + alpha * t` over the exposure, in whole units.
///
/// Zero elapsed time costs nothing; any positive exposure costs at least one
/// unit. Negative input (clock skew) is treated as zero.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn integrated_cost(f_entry: f64, alpha: f64, elapsed_ms: i64) -> i64 {
    if elapsed_ms <= 0 {
        return 0;
    }
    let s = seconds(elapsed_ms);
    let raw = s * f_entry + 0.5 * alpha * s * s;
    // float-to-int casts saturate, so runaway debt pins at i64 bounds
    (raw.round() as i64).max(1)
}

#[allow(clippy::cast_precision_loss)]
fn seconds(elapsed_ms: i64) -> f64 {
    elapsed_ms.max(0) as f64 / 1000.0
}

#[allow(clippy::cast_precision_loss)]
fn hours_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    ((to - from).num_milliseconds().max(0)) as f64 / 3_600_000.0
}

/// Budget engine bound to a store and a clock
pub struct BudgetEngine {
    store: Arc<dyn BudgetStore>,
    clock: Arc<dyn Clock>,
    config: BudgetConfig,
}

impl BudgetEngine {
    #[must_use]
    pub fn new(store: Arc<dyn BudgetStore>, clock: Arc<dyn Clock>, config: BudgetConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Load, roll the day over if needed, run `f`, and save once if anything changed
    fn transact<T>(
        &self,
        f: impl FnOnce(&mut BudgetState, &BudgetConfig, DateTime<Utc>) -> T,
    ) -> Result<T, StoreError> {
        let now = self.clock.now();
        let today = self.clock.today();
        let before = self.store.load_state()?;
        let mut state = before.clone();

        self.roll_day(&mut state, now, today);
        let out = f(&mut state, &self.config, now);

        if state != before {
            self.store.save_state(&state)?;
        }
        Ok(out)
    }

    /// Cumulative day reset: decay first, then add the allowance on top of
    /// whatever balance (surplus or debt) is left.
    fn roll_day(&self, state: &mut BudgetState, now: DateTime<Utc>, today: NaiveDate) {
        // A clock moving backwards never re-grants an allowance
        let is_new_day = state.last_budget_reset_date.map_or(true, |last| today > last);
        if !is_new_day {
            return;
        }

        self.apply_decay_check(state, now);

        let carried = state.remaining_units;
        state.remaining_units = carried.saturating_add(self.config.daily_allowance_units);
        state.daily_session_count = 0;
        state.daily_forbidden_time_ms = 0;
        state.daily_session_time_sum_ms = 0;
        state.last_budget_reset_date = Some(today);

        log::info!(
            "Day reset for {today}: carried {carried} DU, now {} DU",
            state.remaining_units
        );
    }

    fn apply_decay_check(&self, state: &mut BudgetState, now: DateTime<Utc>) -> bool {
        let Some(last_forbidden) = state.last_forbidden_at else {
            return false;
        };
        // Measure from the later of the last exposure and the last relief, so
        // one clean window is not rewarded twice.
        let reference = state
            .last_decay_at
            .map_or(last_forbidden, |decayed| decayed.max(last_forbidden));
        self.apply_decay(state, hours_between(reference, now), now)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn apply_decay(&self, state: &mut BudgetState, hours_clean: f64, now: DateTime<Utc>) -> bool {
        let hours_clean = hours_clean.max(0.0);
        let threshold = DECAY_BASE_HOURS
            - DECAY_COMPULSION_HOURS * state.compulsion_index_at_last_forbidden.clamp(0.0, 1.0);
        if hours_clean < threshold {
            return false;
        }

        let steps = (((hours_clean - threshold) / DECAY_STEP_HOURS).floor() as i64 + 1)
            .clamp(1, MAX_DECAY_STEPS);
        #[allow(clippy::cast_precision_loss)]
        let steps_f = steps as f64;

        state.cost_factor_base = (state.cost_factor_base - self.config.decay_step * steps_f).max(1.0);
        state.compulsion_index =
            (state.compulsion_index - COMPULSION_DECAY_PER_STEP * steps_f).max(0.0);
        state.last_decay_at = Some(now);

        log::info!(
            "Decay after {hours_clean:.1}h clean ({steps} steps): factor {:.2}, compulsion {:.2}",
            state.cost_factor_base,
            state.compulsion_index
        );
        true
    }

    /// Roll the budget over if the calendar day changed.
    ///
    /// Returns `true` when a reset happened.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written
    pub fn reset_if_new_day(&self) -> Result<bool, StoreError> {
        let today = self.clock.today();
        let before = self.store.load_state()?;
        let mut state = before.clone();
        self.roll_day(&mut state, self.clock.now(), today);
        let reset = state.last_budget_reset_date != before.last_budget_reset_date;
        if state != before {
            self.store.save_state(&state)?;
        }
        Ok(reset)
    }

    /// Force a cumulative reset now, regardless of the date
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written
    pub fn reset_all_stats(&self) -> Result<BudgetState, StoreError> {
        let mut state = self.store.load_state()?;
        state.last_budget_reset_date = None;
        self.roll_day(&mut state, self.clock.now(), self.clock.today());
        self.store.save_state(&state)?;
        log::info!("All stats reset manually");
        Ok(state)
    }

    /// Fresh snapshot of the budget state
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written
    pub fn snapshot(&self) -> Result<BudgetState, StoreError> {
        self.transact(|state, _, _| state.clone())
    }

    /// Remaining units, possibly negative
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written
    pub fn remaining_budget(&self) -> Result<i64, StoreError> {
        self.transact(|state, _, _| state.remaining_units)
    }

    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written
    pub fn has_budget(&self) -> Result<bool, StoreError> {
        Ok(self.remaining_budget()? > 0)
    }

    /// Entry multiplier for the next exposure: grows with today's session count
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written
    pub fn current_multiplier(&self) -> Result<f64, StoreError> {
        self.transact(|state, config, _| Tariff { state, config }.entry_multiplier())
    }

    /// Multiplier after `elapsed_ms` of continuous exposure
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written
    pub fn instantaneous_multiplier(&self, elapsed_ms: i64) -> Result<f64, StoreError> {
        self.transact(|state, config, _| {
            Tariff { state, config }.instantaneous_multiplier(elapsed_ms)
        })
    }

    /// Units an exposure of `elapsed_ms` costs under the current state
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written
    pub fn escalated_cost(&self, elapsed_ms: i64) -> Result<i64, StoreError> {
        self.transact(|state, config, _| Tariff { state, config }.escalated_cost(elapsed_ms))
    }

    /// Remaining budget and exposure price in one read
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written
    pub fn quote(&self, elapsed_ms: i64) -> Result<Quote, StoreError> {
        self.transact(|state, config, _| {
            let tariff = Tariff { state, config };
            Quote {
                remaining_units: state.remaining_units,
                cost_units: tariff.escalated_cost(elapsed_ms),
                entry_multiplier: tariff.entry_multiplier(),
                instantaneous_multiplier: tariff.instantaneous_multiplier(elapsed_ms),
            }
        })
    }

    /// Friction delay before entry is allowed
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written
    pub fn wait_seconds(&self) -> Result<u32, StoreError> {
        self.transact(|state, config, _| Tariff { state, config }.wait_seconds())
    }

    /// Count a new sticky session. Call once per session start, never on re-entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written
    pub fn increment_session_count(&self) -> Result<u32, StoreError> {
        self.transact(|state, _, _| {
            state.daily_session_count = state.daily_session_count.saturating_add(1);
            state.daily_session_count
        })
    }

    /// Charge a closed session's forbidden time and update the compulsion index
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written
    pub fn deplete_budget(&self, elapsed_ms: i64) -> Result<Depletion, StoreError> {
        let elapsed_ms = elapsed_ms.max(0);
        let depletion = self.transact(|state, config, now| {
            state.daily_forbidden_time_ms = state.daily_forbidden_time_ms.saturating_add(elapsed_ms);
            state.daily_session_time_sum_ms =
                state.daily_session_time_sum_ms.saturating_add(elapsed_ms);

            let target = compulsion_target(state);
            state.compulsion_index = COMPULSION_SMOOTHING * state.compulsion_index
                + (1.0 - COMPULSION_SMOOTHING) * target;

            let units = Tariff { state, config }.escalated_cost(elapsed_ms);
            state.remaining_units = state.remaining_units.saturating_sub(units);
            state.last_forbidden_at = Some(now);
            state.compulsion_index_at_last_forbidden = state.compulsion_index;

            Depletion {
                units,
                remaining_units: state.remaining_units,
                compulsion_index: state.compulsion_index,
            }
        })?;

        log::info!(
            "Spent {:.1}s = {} DU (compulsion {:.2}). Remaining: {} DU",
            seconds(elapsed_ms),
            depletion.units,
            depletion.compulsion_index,
            depletion.remaining_units
        );
        Ok(depletion)
    }

    /// Abstinence relief given hours since the last forbidden exposure.
    ///
    /// Returns `true` when relief was applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written
    pub fn decay_if_clean(&self, hours_since_last_forbidden: f64) -> Result<bool, StoreError> {
        self.transact(|state, _, now| self.apply_decay(state, hours_since_last_forbidden, now))
    }

    /// Derive the clean window from the store and apply relief if earned
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written
    pub fn check_decay(&self) -> Result<bool, StoreError> {
        self.transact(|state, _, now| self.apply_decay_check(state, now))
    }
}

/// Map today's mean-session/total ratio onto a [0, 1] compulsion target
#[allow(clippy::cast_precision_loss)]
fn compulsion_target(state: &BudgetState) -> f64 {
    if state.daily_forbidden_time_ms <= 0 {
        return 0.0;
    }
    let sessions = f64::from(state.daily_session_count.max(1));
    let mean_session = state.daily_session_time_sum_ms as f64 / sessions;
    let ratio = mean_session / state.daily_forbidden_time_ms as f64;
    ((ratio - RATIO_FLOOR) / RATIO_SPAN).clamp(0.0, 1.0)
}
