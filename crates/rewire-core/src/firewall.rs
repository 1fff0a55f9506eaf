//! Host-facing facade: one owner for the engine, classifier and tracker.
//!
//! Callers must serialise access (the daemon does this by owning the
//! firewall inside its event loop).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rewire_storage::{BudgetState, BudgetStore, EndReason, Settings, StoreError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::budget::BudgetEngine;
use crate::classifier::{EventClassifier, EventKind, RawEvent, Signal};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::enforcement::EnforcementSink;
use crate::session_tracker::{SessionTracker, TrackerStatus};

/// Everything the ongoing status display shows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirewallStatus {
    pub blocker_active: bool,
    pub remaining_units: i64,
    pub daily_session_count: u32,
    pub entry_multiplier: f64,
    pub instantaneous_multiplier: f64,
    /// What the active session would cost if it ended now
    pub live_cost_units: i64,
    pub compulsion_index: f64,
    pub cost_factor_base: f64,
    pub wait_seconds: u32,
    pub session: TrackerStatus,
}

pub struct AttentionFirewall {
    engine: Arc<BudgetEngine>,
    store: Arc<dyn BudgetStore>,
    classifier: EventClassifier,
    tracker: SessionTracker,
    settings: Settings,
}

impl AttentionFirewall {
    /// Wire up a firewall over `store` and run the start-up day and decay checks
    ///
    /// # Errors
    ///
    /// Returns an error if settings cannot be loaded or the classifier fails to build
    pub fn new(
        store: Arc<dyn BudgetStore>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn EnforcementSink>,
        config: EngineConfig,
    ) -> Result<Self> {
        let settings = store.load_settings().context("Failed to load settings")?;
        let engine = Arc::new(BudgetEngine::new(store.clone(), clock, config.budget));
        let classifier = EventClassifier::new(config.classifier, &settings)?;
        let tracker = SessionTracker::new(engine.clone(), store.clone(), sink, config.tracker);

        let firewall = Self {
            engine,
            store,
            classifier,
            tracker,
            settings,
        };
        firewall.wake();
        Ok(firewall)
    }

    fn now(&self) -> DateTime<Utc> {
        self.engine.clock().now()
    }

    /// Day rollover and abstinence relief; run on start and on app switches
    fn wake(&self) {
        if let Err(e) = self.engine.reset_if_new_day() {
            log::warn!("Day rollover check failed: {e}");
        }
        if let Err(e) = self.engine.check_decay() {
            log::warn!("Decay check failed: {e}");
        }
    }

    #[must_use]
    pub fn engine(&self) -> &BudgetEngine {
        &self.engine
    }

    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// # Errors
    ///
    /// Returns an error if the store cannot be read
    pub fn remaining_budget(&self) -> Result<i64, StoreError> {
        self.engine.remaining_budget()
    }

    /// # Errors
    ///
    /// Returns an error if the store cannot be read
    pub fn current_multiplier(&self) -> Result<f64, StoreError> {
        self.engine.current_multiplier()
    }

    /// # Errors
    ///
    /// Returns an error if the store cannot be read
    pub fn wait_seconds(&self) -> Result<u32, StoreError> {
        self.engine.wait_seconds()
    }

    /// The user passed the gate for `package`
    pub fn on_approved_entry(&mut self, package: &str) {
        let extractive = self.classifier.is_extractive(package);
        self.tracker.approve(package, extractive);
    }

    pub fn on_foreground_changed(&mut self, package: &str, timestamp: DateTime<Utc>) -> Vec<Signal> {
        self.on_raw_event(&RawEvent::new(
            package,
            EventKind::WindowStateChanged,
            timestamp,
        ))
    }

    /// Address-bar text reported by the host for `package`
    pub fn on_content_signal(
        &mut self,
        package: &str,
        raw_value: &str,
        timestamp: DateTime<Utc>,
    ) -> Vec<Signal> {
        self.on_raw_event(
            &RawEvent::new(package, EventKind::WindowContentChanged, timestamp)
                .with_address_bar(raw_value, false),
        )
    }

    /// Classify one event and drive the tracker with its signals.
    ///
    /// Event timestamps only order events inside the classifier. Session
    /// time is read from the clock, the same source ticks and shutdown use.
    pub fn on_raw_event(&mut self, event: &RawEvent) -> Vec<Signal> {
        if !self.settings.blocker_active {
            return Vec::new();
        }

        let now = self.now();
        let signals = self.classifier.classify(event);
        if !matches!(signals.as_slice(), [Signal::TransientNoise]) {
            self.tracker.on_activity(&event.package, event.kind, now);
        }
        for signal in &signals {
            if matches!(signal, Signal::ForegroundOther(_)) {
                self.wake();
            }
            self.tracker.on_signal(signal, now);
        }
        if self.tracker.active_package().is_some() {
            self.tracker.check_live(now);
        }
        signals
    }

    pub fn on_gate_dismissed(&mut self) {
        let now = self.now();
        self.tracker.gate_dismissed(now);
    }

    /// Live re-check, driven by the ticker while a forbidden segment is open
    pub fn tick(&mut self) {
        let now = self.now();
        if let Err(e) = self.engine.reset_if_new_day() {
            log::warn!("Day rollover check failed: {e}");
        }
        self.tracker.tick(now);
    }

    #[must_use]
    pub fn is_forbidden_open(&self) -> bool {
        self.tracker.is_forbidden_open()
    }

    /// Snapshot for status displays
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read
    pub fn status(&self) -> Result<FirewallStatus, StoreError> {
        let session = self.tracker.status(self.now());
        let state = self.engine.snapshot()?;
        let quote = self.engine.quote(session.live_forbidden_ms)?;
        let wait_seconds = self.engine.wait_seconds()?;

        Ok(FirewallStatus {
            blocker_active: self.settings.blocker_active,
            remaining_units: state.remaining_units,
            daily_session_count: state.daily_session_count,
            entry_multiplier: quote.entry_multiplier,
            instantaneous_multiplier: quote.instantaneous_multiplier,
            live_cost_units: quote.cost_units,
            compulsion_index: state.compulsion_index,
            cost_factor_base: state.cost_factor_base,
            wait_seconds,
            session,
        })
    }

    /// Re-read settings from the store, e.g. after the CLI edited the lists
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read
    pub fn reload_settings(&mut self) -> Result<(), StoreError> {
        let settings = self.store.load_settings()?;
        self.apply_settings(settings);
        Ok(())
    }

    /// Turn the blocker on or off and persist the switch
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written
    pub fn set_blocker_active(&mut self, active: bool) -> Result<(), StoreError> {
        let mut settings = self.settings.clone();
        settings.blocker_active = active;
        self.store.save_settings(&settings)?;
        self.apply_settings(settings);
        Ok(())
    }

    fn apply_settings(&mut self, settings: Settings) {
        self.classifier.apply_settings(&settings);
        if !settings.blocker_active && self.settings.blocker_active {
            log::info!("Blocker switched off");
            let now = self.now();
            self.tracker.terminate(EndReason::Shutdown, now);
        }
        self.settings = settings;
    }

    /// Force a cumulative reset now
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written
    pub fn reset_all_stats(&self) -> Result<BudgetState, StoreError> {
        self.engine.reset_all_stats()
    }

    /// Close and charge any running session before the host stops
    pub fn shutdown(&mut self) {
        let now = self.now();
        self.tracker.terminate(EndReason::Shutdown, now);
        self.tracker.flush_pending();
        let pending = self.tracker.status(now).pending_depletions;
        if pending > 0 {
            log::warn!("Shutting down with {pending} uncharged session(s)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::enforcement::{GateReason, RecordingSink};
    use chrono::{Duration, TimeZone};
    use rewire_storage::MemoryStore;

    const YOUTUBE: &str = "com.google.android.youtube";
    const CHROME: &str = "com.android.chrome";
    const LAUNCHER: &str = "com.sec.android.app.launcher";
    const NOTES: &str = "com.example.notes";

    struct Fixture {
        firewall: AttentionFirewall,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        sink: Arc<RecordingSink>,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 9, 0, 0).unwrap()
    }

    fn fixture(urls: &[&str]) -> Fixture {
        let settings = Settings {
            forbidden_urls: urls.iter().map(ToString::to_string).collect(),
            ..Settings::default()
        };
        let store = Arc::new(MemoryStore::new().with_settings(settings));
        let clock = Arc::new(ManualClock::new(t0()));
        let sink = Arc::new(RecordingSink::new());
        let firewall = AttentionFirewall::new(
            store.clone(),
            clock.clone(),
            sink.clone(),
            EngineConfig::default(),
        )
        .unwrap();
        Fixture {
            firewall,
            store,
            clock,
            sink,
        }
    }

    impl Fixture {
        /// Move the clock and return it, so engine and events agree on time
        fn at(&self, secs: i64) -> DateTime<Utc> {
            let now = t0() + Duration::seconds(secs);
            self.clock.set(now);
            now
        }
    }

    #[test]
    fn test_start_grants_first_allowance() {
        let f = fixture(&[]);
        assert_eq!(f.firewall.remaining_budget().unwrap(), 1800);
        assert!((f.firewall.current_multiplier().unwrap() - 1.0).abs() < 1e-9);
        assert_eq!(f.firewall.wait_seconds().unwrap(), 30);
    }

    #[test]
    fn test_extractive_app_round_trip() {
        let mut f = fixture(&[]);
        let now = f.at(0);
        f.firewall.on_foreground_changed(YOUTUBE, now);
        assert_eq!(f.sink.gates()[0].reason, GateReason::ExtractiveApp);

        // Gate UI is our own package, then the user approves
        let own = EngineConfig::default().classifier.own_package;
        let now = f.at(2);
        f.firewall.on_foreground_changed(&own, now);
        f.firewall.on_approved_entry(YOUTUBE);
        let now = f.at(5);
        f.firewall.on_foreground_changed(YOUTUBE, now);

        let status = f.firewall.status().unwrap();
        assert_eq!(status.session.active_package.as_deref(), Some(YOUTUBE));
        assert!(status.session.forbidden);
        assert_eq!(status.daily_session_count, 1);

        // Home is noise: the session survives
        let now = f.at(30);
        f.firewall.on_foreground_changed(LAUNCHER, now);
        let now = f.at(35);
        f.firewall.on_foreground_changed(YOUTUBE, now);
        assert!(f.firewall.is_forbidden_open());

        let now = f.at(65);
        f.firewall.on_foreground_changed("com.google.android.gm", now);
        assert!(!f.firewall.is_forbidden_open());

        let sessions = f.store.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].forbidden_ms, 60_000);
        assert_eq!(
            f.firewall.remaining_budget().unwrap(),
            1800 - sessions[0].units_charged
        );
    }

    #[test]
    fn test_browser_content_signals_drive_sessions() {
        let mut f = fixture(&["reddit.com"]);
        let now = f.at(0);
        f.firewall.on_content_signal(CHROME, "reddit.com/r/rust", now);
        let now = f.at(1);
        f.firewall.on_content_signal(CHROME, "reddit.com/r/rust", now);
        assert_eq!(f.sink.gates()[0].pattern.as_deref(), Some("reddit.com"));

        f.firewall.on_approved_entry(CHROME);
        let now = f.at(3);
        f.firewall.on_content_signal(CHROME, "reddit.com/r/rust", now);
        assert!(f.firewall.is_forbidden_open());

        let now = f.at(20);
        f.firewall.on_content_signal(CHROME, "docs.rs", now);
        let now = f.at(21);
        f.firewall.on_content_signal(CHROME, "docs.rs", now);
        assert!(!f.firewall.is_forbidden_open());

        let status = f.firewall.status().unwrap();
        assert_eq!(status.session.live_forbidden_ms, 18_000);
        assert!(status.live_cost_units >= 18);
    }

    #[test]
    fn test_late_event_from_previous_app_keeps_session() {
        let mut f = fixture(&[]);
        let now = f.at(0);
        f.firewall.on_foreground_changed(NOTES, now);
        let now = f.at(10);
        f.firewall.on_foreground_changed(YOUTUBE, now);
        f.firewall.on_approved_entry(YOUTUBE);
        let now = f.at(12);
        f.firewall
            .on_raw_event(&RawEvent::new(YOUTUBE, EventKind::WindowContentChanged, now));
        assert!(f.firewall.is_forbidden_open());

        // Delivered now, stamped from before the switch to YouTube
        f.at(13);
        let late = RawEvent::new(NOTES, EventKind::WindowStateChanged, t0() + Duration::seconds(1));
        assert_eq!(f.firewall.on_raw_event(&late), vec![Signal::Irrelevant]);

        assert!(f.firewall.is_forbidden_open());
        assert!(f.store.sessions().is_empty());
    }

    #[test]
    fn test_blocker_off_ignores_events_and_ends_session() {
        let mut f = fixture(&[]);
        f.firewall.on_approved_entry(YOUTUBE);
        let now = f.at(0);
        f.firewall.on_foreground_changed(YOUTUBE, now);
        assert!(f.firewall.is_forbidden_open());

        f.at(10);
        f.firewall.set_blocker_active(false).unwrap();
        assert!(!f.firewall.is_forbidden_open());
        assert_eq!(f.store.sessions()[0].reason, EndReason::Shutdown);
        assert!(!f.store.load_settings().unwrap().blocker_active);

        let now = f.at(20);
        assert!(f.firewall.on_foreground_changed(YOUTUBE, now).is_empty());
        assert_eq!(f.sink.gates().len(), 0);
    }

    #[test]
    fn test_reload_settings_picks_up_new_lists() {
        let mut f = fixture(&[]);
        let mut settings = f.store.load_settings().unwrap();
        settings.extractive_apps.push(String::from("com.zhiliaoapp.musically"));
        f.store.save_settings(&settings).unwrap();

        f.firewall.reload_settings().unwrap();
        let now = f.at(0);
        f.firewall.on_foreground_changed("com.zhiliaoapp.musically", now);
        assert_eq!(f.sink.gates().len(), 1);
    }

    #[test]
    fn test_tick_enforces_exhaustion() {
        let mut f = fixture(&[]);
        f.firewall.on_approved_entry(YOUTUBE);
        let now = f.at(0);
        f.firewall.on_foreground_changed(YOUTUBE, now);

        f.at(1500);
        f.firewall.tick();
        assert!(!f.firewall.is_forbidden_open());
        assert_eq!(f.sink.home_count(), 1);
        assert_eq!(f.store.sessions()[0].reason, EndReason::BudgetExhausted);
    }

    #[test]
    fn test_shutdown_charges_running_session() {
        let mut f = fixture(&[]);
        f.firewall.on_approved_entry(YOUTUBE);
        let now = f.at(0);
        f.firewall.on_foreground_changed(YOUTUBE, now);

        f.at(40);
        f.firewall.shutdown();
        assert_eq!(f.store.sessions()[0].forbidden_ms, 40_000);
        assert!(f.firewall.remaining_budget().unwrap() < 1800);
    }
}
