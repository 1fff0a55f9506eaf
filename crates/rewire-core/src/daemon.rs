use crate::{
    classifier::RawEvent,
    clock::{Clock, SystemClock},
    config::{get_data_dir, EngineConfig},
    enforcement::{ChannelSink, EnforcementAction, GateRequest},
    firewall::AttentionFirewall,
    ipc::{listen, DaemonIpcHandler, IpcCommand, IpcRequest, IpcResponse},
    source::{spawn_source, EventSource},
    ticker::LiveTicker,
};
use anyhow::Result;
use rewire_storage::BudgetStore;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio::time::interval;

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(60);
const EVENT_QUEUE: usize = 256;
const COMMAND_QUEUE: usize = 16;

/// What woke the loop up
enum Step {
    Event(RawEvent),
    SourceClosed,
    Command(IpcCommand),
    LiveTick,
    Housekeeping,
    Interrupt,
}

/// Single owner of the firewall. Events, IPC commands and ticks are
/// serialised through one `select!` loop.
pub struct Daemon {
    firewall: AttentionFirewall,
    ticker: LiveTicker,
    enforcement: mpsc::UnboundedReceiver<EnforcementAction>,
    pending_gate: Option<GateRequest>,
}

impl Daemon {
    /// # Errors
    ///
    /// Returns an error if the firewall cannot be built over `store`
    pub fn new(store: Arc<dyn BudgetStore>, config: EngineConfig) -> Result<Self> {
        Self::with_clock(store, Arc::new(SystemClock), config)
    }

    /// # Errors
    ///
    /// Returns an error if the firewall cannot be built over `store`
    pub fn with_clock(
        store: Arc<dyn BudgetStore>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Result<Self> {
        let (sink, enforcement) = ChannelSink::channel();
        let ticker = LiveTicker::new(Duration::from_millis(config.tracker.tick_interval_ms));
        let firewall = AttentionFirewall::new(store, clock, Arc::new(sink), config)?;

        Ok(Self {
            firewall,
            ticker,
            enforcement,
            pending_gate: None,
        })
    }

    #[must_use]
    pub fn firewall(&self) -> &AttentionFirewall {
        &self.firewall
    }

    #[must_use]
    pub fn pending_gate(&self) -> Option<&GateRequest> {
        self.pending_gate.as_ref()
    }

    /// Run until Ctrl-C or an IPC shutdown. `source` feeds raw events; without
    /// one the daemon only answers IPC and keeps the budget day current.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory cannot be resolved
    pub async fn run_with_signals(&mut self, source: Option<Box<dyn EventSource>>) -> Result<()> {
        let sock_path = get_data_dir()?.join("rewire.sock");
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<IpcCommand>(COMMAND_QUEUE);
        let ipc_handler = Arc::new(DaemonIpcHandler::new(cmd_tx));

        tokio::spawn(async move {
            if let Err(e) = listen(ipc_handler, &sock_path).await {
                log::error!("IPC listener failed: {e}");
            }
        });

        let (event_tx, mut event_rx) = mpsc::channel::<RawEvent>(EVENT_QUEUE);
        let mut source_open = match source {
            Some(source) => {
                spawn_source(source, event_tx);
                true
            }
            None => false,
        };

        let mut housekeeping = interval(HOUSEKEEPING_INTERVAL);
        log::info!("Daemon started with signal handling and IPC");

        loop {
            let step = tokio::select! {
                event = event_rx.recv(), if source_open => match event {
                    Some(event) => Step::Event(event),
                    None => Step::SourceClosed,
                },
                Some(command) = cmd_rx.recv() => Step::Command(command),
                _ = self.ticker.tick() => Step::LiveTick,
                _ = housekeeping.tick() => Step::Housekeeping,
                _ = tokio::signal::ctrl_c() => Step::Interrupt,
            };

            match step {
                Step::Event(event) => self.handle_event(&event),
                Step::SourceClosed => {
                    log::info!("Event source closed, continuing with IPC only");
                    source_open = false;
                }
                Step::Command((request, reply)) => {
                    let response = self.handle_request(request);
                    let stop = matches!(response, IpcResponse::Shutdown);
                    if reply.send(response).is_err() {
                        log::warn!("IPC client went away before the reply");
                    }
                    if stop {
                        log::info!("Shutdown requested over IPC");
                        break;
                    }
                }
                Step::LiveTick | Step::Housekeeping => self.tick(),
                Step::Interrupt => {
                    log::info!("Received Ctrl-C, shutting down...");
                    break;
                }
            }

            self.drain_enforcement();
            self.ticker.sync(self.firewall.is_forbidden_open());
        }

        self.firewall.shutdown();
        self.drain_enforcement();
        log::info!("Daemon shut down gracefully.");
        Ok(())
    }

    /// Feed one raw event through the firewall
    pub fn handle_event(&mut self, event: &RawEvent) {
        let signals = self.firewall.on_raw_event(event);
        if !signals.is_empty() {
            log::debug!("{} -> {signals:?}", event.package);
        }
    }

    /// Live re-check and day rollover against the daemon clock
    pub fn tick(&mut self) {
        self.firewall.tick();
    }

    /// Answer one IPC request against the live firewall
    pub fn handle_request(&mut self, request: IpcRequest) -> IpcResponse {
        match request {
            IpcRequest::Status => match self.firewall.status() {
                Ok(status) => IpcResponse::Status {
                    status,
                    pending_gate: self.pending_gate.clone(),
                },
                Err(e) => IpcResponse::Error(e.to_string()),
            },
            IpcRequest::Approve { package } => {
                log::info!("Entry approved for {package}");
                self.firewall.on_approved_entry(&package);
                self.pending_gate = None;
                IpcResponse::Ok
            }
            IpcRequest::DismissGate => {
                self.firewall.on_gate_dismissed();
                self.pending_gate = None;
                IpcResponse::Ok
            }
            IpcRequest::ReloadSettings => match self.firewall.reload_settings() {
                Ok(()) => {
                    log::info!("Settings reloaded");
                    IpcResponse::Ok
                }
                Err(e) => IpcResponse::Error(e.to_string()),
            },
            IpcRequest::Shutdown => IpcResponse::Shutdown,
        }
    }

    /// Collect enforcement requests the firewall issued since the last call
    pub fn drain_enforcement(&mut self) {
        while let Ok(action) = self.enforcement.try_recv() {
            match action {
                EnforcementAction::Gate(request) => {
                    log::info!(
                        "Gate requested for {} ({}, wait {}s)",
                        request.package,
                        request.reason.as_str(),
                        request.wait_seconds
                    );
                    self.pending_gate = Some(request);
                }
                EnforcementAction::ForceHome => log::info!("Forcing return to home screen"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::EventKind;
    use crate::clock::ManualClock;
    use crate::enforcement::GateReason;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use rewire_storage::{BudgetState, EndReason, MemoryStore};

    const YOUTUBE: &str = "com.google.android.youtube";
    const NOTES: &str = "com.example.notes";

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 8, 12, 18, 0, 0).unwrap()
    }

    fn daemon() -> (Daemon, Arc<MemoryStore>, Arc<ManualClock>) {
        let state = BudgetState {
            remaining_units: 1800,
            last_budget_reset_date: Some(t0().date_naive()),
            ..BudgetState::default()
        };
        let store = Arc::new(MemoryStore::with_state(state));
        let clock = Arc::new(ManualClock::new(t0()));
        let daemon = Daemon::with_clock(store.clone(), clock.clone(), EngineConfig::default())
            .unwrap();
        (daemon, store, clock)
    }

    fn foreground(daemon: &mut Daemon, clock: &ManualClock, package: &str, at: DateTime<Utc>) {
        clock.set(at);
        daemon.handle_event(&RawEvent::new(package, EventKind::WindowStateChanged, at));
        daemon.drain_enforcement();
    }

    #[test]
    fn test_extractive_app_leaves_pending_gate() {
        let (mut daemon, _, clock) = daemon();
        foreground(&mut daemon, &clock, YOUTUBE, t0());

        let gate = daemon.pending_gate().unwrap();
        assert_eq!(gate.package, YOUTUBE);
        assert_eq!(gate.reason, GateReason::ExtractiveApp);
        assert_eq!(gate.wait_seconds, 30);
    }

    #[test]
    fn test_approve_clears_gate_and_opens_session() {
        let (mut daemon, _, clock) = daemon();
        foreground(&mut daemon, &clock, YOUTUBE, t0());

        let response = daemon.handle_request(IpcRequest::Approve {
            package: String::from(YOUTUBE),
        });
        assert_eq!(response, IpcResponse::Ok);
        assert!(daemon.pending_gate().is_none());

        let later = t0() + ChronoDuration::seconds(2);
        clock.set(later);
        daemon.handle_event(&RawEvent::new(YOUTUBE, EventKind::WindowContentChanged, later));
        assert!(daemon.firewall().is_forbidden_open());

        match daemon.handle_request(IpcRequest::Status) {
            IpcResponse::Status { status, pending_gate } => {
                assert_eq!(status.session.active_package.as_deref(), Some(YOUTUBE));
                assert_eq!(status.daily_session_count, 1);
                assert!(pending_gate.is_none());
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn test_switching_away_charges_the_session() {
        let (mut daemon, store, clock) = daemon();
        foreground(&mut daemon, &clock, YOUTUBE, t0());
        daemon.handle_request(IpcRequest::Approve {
            package: String::from(YOUTUBE),
        });
        let start = t0() + ChronoDuration::seconds(1);
        clock.set(start);
        daemon.handle_event(&RawEvent::new(YOUTUBE, EventKind::WindowContentChanged, start));

        foreground(&mut daemon, &clock, NOTES, start + ChronoDuration::seconds(60));

        assert!(!daemon.firewall().is_forbidden_open());
        assert_eq!(store.sessions().len(), 1);
        assert!(store.load_state().unwrap().remaining_units < 1800);
    }

    #[test]
    fn test_dismiss_and_shutdown_requests() {
        let (mut daemon, _, clock) = daemon();
        foreground(&mut daemon, &clock, YOUTUBE, t0());

        assert_eq!(daemon.handle_request(IpcRequest::DismissGate), IpcResponse::Ok);
        assert!(daemon.pending_gate().is_none());
        assert_eq!(daemon.handle_request(IpcRequest::Shutdown), IpcResponse::Shutdown);
    }

    #[test]
    fn test_reload_picks_up_new_extractive_app() {
        let (mut daemon, store, clock) = daemon();
        let mut settings = store.load_settings().unwrap();
        settings.extractive_apps.push(String::from(NOTES));
        store.save_settings(&settings).unwrap();

        assert_eq!(daemon.handle_request(IpcRequest::ReloadSettings), IpcResponse::Ok);
        foreground(&mut daemon, &clock, NOTES, t0());
        assert_eq!(daemon.pending_gate().map(|g| g.package.as_str()), Some(NOTES));
    }

    #[test]
    fn test_session_time_follows_daemon_clock_not_event_stamps() {
        let (mut daemon, store, clock) = daemon();
        // The host stamps events an hour behind the daemon clock
        let skew = ChronoDuration::hours(1);
        clock.set(t0());
        daemon.handle_event(&RawEvent::new(YOUTUBE, EventKind::WindowStateChanged, t0() - skew));
        daemon.drain_enforcement();
        daemon.handle_request(IpcRequest::Approve {
            package: String::from(YOUTUBE),
        });

        let start = t0() + ChronoDuration::seconds(1);
        clock.set(start);
        daemon.handle_event(&RawEvent::new(YOUTUBE, EventKind::WindowContentChanged, start - skew));
        assert!(daemon.firewall().is_forbidden_open());

        // Ten seconds of use, not an hour and ten seconds
        let later = start + ChronoDuration::seconds(10);
        clock.set(later);
        daemon.tick();
        assert!(daemon.firewall().is_forbidden_open());

        daemon.handle_event(&RawEvent::new(NOTES, EventKind::WindowStateChanged, later - skew));
        assert!(!daemon.firewall().is_forbidden_open());
        let sessions = store.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].forbidden_ms, 10_000);
        assert_eq!(sessions[0].reason, EndReason::ContextSwitch);
    }

    #[test]
    fn test_status_reports_store_failure() {
        let (mut daemon, store, _) = daemon();
        store.set_unavailable(true);
        assert!(matches!(
            daemon.handle_request(IpcRequest::Status),
            IpcResponse::Error(_)
        ));
    }
}
