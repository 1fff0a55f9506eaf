//! Sticky-session state machine.
//!
//! `Idle -> Active(package)` on a consumed approval, `Clean <-> Forbidden`
//! inside a session, and `Active -> Idle` on a real context switch or live
//! budget exhaustion. Forbidden time is accumulated per session and charged
//! to the budget exactly once, when the session ends.

use chrono::{DateTime, Utc};
use rewire_storage::{BudgetStore, EndReason, SessionRecord};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use crate::budget::BudgetEngine;
use crate::classifier::{EventKind, Signal};
use crate::config::TrackerConfig;
use crate::enforcement::{EnforcementSink, GateReason, GateRequest};


/// Last gated target, remembered so an approval knows what it approves
#[derive(Debug, Clone, PartialEq, Eq)]
struct Interception {
    package: String,
    pattern: Option<String>,
    /// Extractive apps are forbidden as a whole, so their session opens forbidden
    extractive: bool,
}

#[derive(Debug, Clone)]
struct ActiveSession {
    package: String,
    started_at: DateTime<Utc>,
    extractive: bool,
    approved_patterns: HashSet<String>,
    accumulated_forbidden_ms: i64,
    forbidden_since: Option<DateTime<Utc>>,
}

impl ActiveSession {
    fn open_segment(&mut self, now: DateTime<Utc>) {
        if self.forbidden_since.is_none() {
            self.forbidden_since = Some(now);
            log::debug!("Forbidden segment opened in '{}'", self.package);
        }
    }

    fn close_segment(&mut self, now: DateTime<Utc>) {
        if let Some(since) = self.forbidden_since.take() {
            let segment = (now - since).num_milliseconds().max(0);
            self.accumulated_forbidden_ms = self.accumulated_forbidden_ms.saturating_add(segment);
            log::debug!(
                "Forbidden segment closed in '{}' after {segment}ms",
                self.package
            );
        }
    }

    /// Closed segments plus the open one, if any
    fn live_forbidden_ms(&self, now: DateTime<Utc>) -> i64 {
        let open = self
            .forbidden_since
            .map_or(0, |since| (now - since).num_milliseconds().max(0));
        self.accumulated_forbidden_ms.saturating_add(open)
    }
}

/// A terminated session whose depletion could not be written yet
#[derive(Debug, Clone)]
struct PendingDepletion {
    package: String,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    forbidden_ms: i64,
    reason: EndReason,
}

/// Read-only view of the tracker for status displays
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerStatus {
    pub active_package: Option<String>,
    pub forbidden: bool,
    pub live_forbidden_ms: i64,
    pub session_started_at: Option<DateTime<Utc>>,
    pub pending_approval: Option<String>,
    pub pending_depletions: usize,
    pub pending_session_counts: u32,
}

pub struct SessionTracker {
    engine: Arc<BudgetEngine>,
    store: Arc<dyn BudgetStore>,
    sink: Arc<dyn EnforcementSink>,
    config: TrackerConfig,
    session: Option<ActiveSession>,
    last_intercepted: Option<Interception>,
    /// One-shot temp-allow, consumed by the next event from its package
    pending_approval: Option<Interception>,
    pending_depletions: VecDeque<PendingDepletion>,
    /// Session starts the store failed to count
    pending_increments: u32,
    last_gate_at: Option<DateTime<Utc>>,
}

impl SessionTracker {
    #[must_use]
    pub fn new(
        engine: Arc<BudgetEngine>,
        store: Arc<dyn BudgetStore>,
        sink: Arc<dyn EnforcementSink>,
        config: TrackerConfig,
    ) -> Self {
        Self {
            engine,
            store,
            sink,
            config,
            session: None,
            last_intercepted: None,
            pending_approval: None,
            pending_depletions: VecDeque::new(),
            pending_increments: 0,
            last_gate_at: None,
        }
    }

    #[must_use]
    pub fn active_package(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.package.as_str())
    }

    #[must_use]
    pub fn is_forbidden_open(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.forbidden_since.is_some())
    }

    #[must_use]
    pub fn live_forbidden_ms(&self, now: DateTime<Utc>) -> i64 {
        self.session
            .as_ref()
            .map_or(0, |s| s.live_forbidden_ms(now))
    }

    #[must_use]
    pub fn status(&self, now: DateTime<Utc>) -> TrackerStatus {
        TrackerStatus {
            active_package: self.session.as_ref().map(|s| s.package.clone()),
            forbidden: self.is_forbidden_open(),
            live_forbidden_ms: self.live_forbidden_ms(now),
            session_started_at: self.session.as_ref().map(|s| s.started_at),
            pending_approval: self.pending_approval.as_ref().map(|p| p.package.clone()),
            pending_depletions: self.pending_depletions.len(),
            pending_session_counts: self.pending_increments,
        }
    }

    /// The user passed the gate for `package`. The next event from that
    /// package opens (or re-enters) its sticky session.
    pub fn approve(&mut self, package: &str, extractive: bool) {
        let approval = match &self.last_intercepted {
            Some(last) if last.package == package => last.clone(),
            _ => Interception {
                package: package.to_string(),
                pattern: None,
                extractive,
            },
        };
        log::info!(
            "Approved entry to '{package}' (pattern: {})",
            approval.pattern.as_deref().unwrap_or("-")
        );
        self.pending_approval = Some(approval);
    }

    /// The user backed out of the gate; restart the URL gate cooldown
    pub fn gate_dismissed(&mut self, now: DateTime<Utc>) {
        log::debug!("Gate dismissed");
        self.last_gate_at = Some(now);
    }

    /// Every non-noise event passes through here before its signals
    pub fn on_activity(&mut self, package: &str, kind: EventKind, now: DateTime<Utc>) {
        let Some(pending) = &self.pending_approval else {
            return;
        };
        if pending.package == package {
            if let Some(approval) = self.pending_approval.take() {
                self.begin_session(approval, now);
            }
        } else if kind == EventKind::WindowStateChanged {
            log::debug!(
                "Dropping approval for '{}': '{package}' took the foreground",
                pending.package
            );
            self.pending_approval = None;
        }
    }

    pub fn on_signal(&mut self, signal: &Signal, now: DateTime<Utc>) {
        match signal {
            Signal::ForegroundExtractive(package) => self.on_extractive_foreground(package, now),
            Signal::ForegroundOther(package) => {
                if self.active_package().is_some_and(|active| active != package.as_str()) {
                    self.terminate(EndReason::ContextSwitch, now);
                }
            }
            Signal::ForbiddenUrlCommitted { package, pattern } => {
                self.on_forbidden_url(package, pattern, now);
            }
            Signal::SafeUrlConfirmed(package) => {
                if let Some(session) = self.session.as_mut().filter(|s| &s.package == package) {
                    session.close_segment(now);
                }
            }
            Signal::TransientNoise | Signal::Irrelevant => {}
        }
    }

    fn on_extractive_foreground(&mut self, package: &str, now: DateTime<Utc>) {
        if let Some(session) = self.session.as_mut() {
            if session.package == package {
                session.open_segment(now);
                return;
            }
            self.terminate(EndReason::ContextSwitch, now);
        }
        self.last_intercepted = Some(Interception {
            package: package.to_string(),
            pattern: None,
            extractive: true,
        });
        self.request_gate(package, None, GateReason::ExtractiveApp, now);
    }

    fn on_forbidden_url(&mut self, package: &str, pattern: &str, now: DateTime<Utc>) {
        let cooled_down = self.gate_cooled_down(now);
        match self.session.as_mut() {
            Some(session) if session.package == package => {
                session.open_segment(now);
                if session.approved_patterns.contains(pattern) || !cooled_down {
                    return;
                }
                session.approved_patterns.insert(pattern.to_string());
                self.last_intercepted = Some(Interception {
                    package: package.to_string(),
                    pattern: Some(pattern.to_string()),
                    extractive: false,
                });
                self.request_gate(package, Some(pattern), GateReason::NewPattern, now);
            }
            // The foreground switch away from the active package is still debouncing
            Some(_) => {}
            None => {
                if !cooled_down {
                    return;
                }
                self.last_intercepted = Some(Interception {
                    package: package.to_string(),
                    pattern: Some(pattern.to_string()),
                    extractive: false,
                });
                self.request_gate(package, Some(pattern), GateReason::ForbiddenUrl, now);
            }
        }
    }

    fn begin_session(&mut self, approval: Interception, now: DateTime<Utc>) {
        if let Some(session) = self.session.as_mut() {
            if session.package == approval.package {
                // Re-entry: keep the running totals and the counter as they are
                if let Some(pattern) = approval.pattern {
                    session.approved_patterns.insert(pattern);
                }
                if approval.extractive {
                    session.open_segment(now);
                }
                log::debug!("Re-entered active session '{}'", session.package);
                return;
            }
            self.terminate(EndReason::ContextSwitch, now);
        }

        self.flush_pending();
        if !self.pending_depletions.is_empty() {
            log::warn!(
                "Not opening '{}': {} earlier session(s) still uncharged",
                approval.package,
                self.pending_depletions.len()
            );
            self.pending_approval = Some(approval);
            return;
        }

        self.pending_increments += 1;
        self.flush_increments();

        let mut session = ActiveSession {
            package: approval.package,
            started_at: now,
            extractive: approval.extractive,
            approved_patterns: approval.pattern.into_iter().collect(),
            accumulated_forbidden_ms: 0,
            forbidden_since: None,
        };
        if approval.extractive {
            session.open_segment(now);
        }
        log::info!("Sticky session started: '{}'", session.package);
        self.session = Some(session);
    }

    /// End the active session: close the segment, charge once, log it
    pub fn terminate(&mut self, reason: EndReason, now: DateTime<Utc>) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        session.close_segment(now);

        let pending = PendingDepletion {
            package: session.package,
            started_at: session.started_at,
            ended_at: now,
            forbidden_ms: session.accumulated_forbidden_ms,
            reason,
        };
        log::info!(
            "Sticky session ended: '{}' ({reason}, {}ms forbidden)",
            pending.package,
            pending.forbidden_ms
        );
        if let Err(pending) = self.charge(pending) {
            self.pending_depletions.push_back(pending);
        }
    }

    /// Deplete and record one session; hands it back if the store failed
    fn charge(&self, pending: PendingDepletion) -> Result<(), PendingDepletion> {
        let units = if pending.forbidden_ms > 0 {
            match self.engine.deplete_budget(pending.forbidden_ms) {
                Ok(depletion) => depletion.units,
                Err(e) => {
                    log::warn!(
                        "Failed to charge {}ms for '{}', will retry: {e}",
                        pending.forbidden_ms,
                        pending.package
                    );
                    return Err(pending);
                }
            }
        } else {
            0
        };

        let record = SessionRecord::new(
            pending.package,
            pending.started_at,
            pending.ended_at,
            pending.forbidden_ms,
            units,
            pending.reason,
        );
        if let Err(e) = self.store.append_session(&record) {
            log::warn!("Failed to record session for '{}': {e}", record.package);
        }
        Ok(())
    }

    /// Count session starts; anything the store rejects stays queued
    fn flush_increments(&mut self) {
        while self.pending_increments > 0 {
            if let Err(e) = self.engine.increment_session_count() {
                log::warn!(
                    "Failed to count {} session start(s), will retry: {e}",
                    self.pending_increments
                );
                return;
            }
            self.pending_increments -= 1;
        }
    }

    /// Retry session counts and depletions that failed earlier, oldest first
    pub fn flush_pending(&mut self) {
        self.flush_increments();
        while let Some(pending) = self.pending_depletions.pop_front() {
            if let Err(pending) = self.charge(pending) {
                self.pending_depletions.push_front(pending);
                return;
            }
        }
    }

    /// Re-evaluate the live budget of the active session.
    ///
    /// Returns `true` when exhaustion terminated the session. An unreadable
    /// store counts as exhausted.
    pub fn check_live(&mut self, now: DateTime<Utc>) -> bool {
        let Some(session) = &self.session else {
            return false;
        };
        let package = session.package.clone();
        let extractive = session.extractive;
        let total = session.live_forbidden_ms(now);

        let exhausted = match self.engine.quote(total) {
            Ok(quote) => quote.is_exhausted(),
            Err(e) => {
                log::warn!("Budget unreadable during live check, enforcing: {e}");
                true
            }
        };
        if !exhausted {
            return false;
        }

        log::info!("Budget exhausted in '{package}' after {total}ms forbidden");
        self.terminate(EndReason::BudgetExhausted, now);
        self.last_intercepted = Some(Interception {
            package: package.clone(),
            pattern: None,
            extractive,
        });
        self.sink.force_home();
        self.request_gate(&package, None, GateReason::BudgetExhausted, now);
        true
    }

    /// Periodic work: retry failed depletions, then re-check the live budget
    pub fn tick(&mut self, now: DateTime<Utc>) {
        self.flush_pending();
        self.check_live(now);
    }

    fn gate_cooled_down(&self, now: DateTime<Utc>) -> bool {
        self.last_gate_at.map_or(true, |last| {
            (now - last).num_milliseconds().max(0) >= self.config.gate_cooldown_ms
        })
    }

    fn request_gate(
        &mut self,
        package: &str,
        pattern: Option<&str>,
        reason: GateReason,
        now: DateTime<Utc>,
    ) {
        let wait_seconds = self.engine.wait_seconds().unwrap_or_else(|e| {
            log::warn!("Failed to price the gate wait: {e}");
            self.engine.config().base_wait_seconds
        });
        let remaining_units = self.engine.remaining_budget().ok();

        log::info!("Gate requested for '{package}' ({})", reason.as_str());
        self.sink.request_gate(GateRequest {
            package: package.to_string(),
            pattern: pattern.map(str::to_string),
            reason,
            wait_seconds,
            remaining_units,
        });
        self.last_gate_at = Some(now);
    }
}
