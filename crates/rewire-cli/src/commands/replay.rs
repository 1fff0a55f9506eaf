//! Replay a recorded event log through a firewall driven by the log's own
//! timestamps, printing every enforcement request.

use anyhow::Result;
use rewire_core::{
    config::EngineConfig,
    enforcement::RecordingSink,
    source::{EventSource, JsonLinesSource},
    AttentionFirewall, EnforcementAction, ManualClock, Signal,
};
use rewire_storage::{BudgetStore, Database, MemoryStore};
use std::{path::Path, sync::Arc};

use super::helpers::{format_duration_ms, format_units, rule};

#[derive(Debug, Clone, Copy, Default)]
pub struct ReplayOptions {
    /// Pass each gate immediately, as a user tapping through would
    pub approve: bool,
    /// Replay against a copy of the stored state
    pub dry_run: bool,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct ReplaySummary {
    events: usize,
    gates: usize,
    force_home: usize,
}

pub async fn handle_replay_command(path: &Path, options: ReplayOptions) -> Result<()> {
    let db = Database::new(None)?;
    let config = EngineConfig::load_default()?;
    let store: Arc<dyn BudgetStore> = if options.dry_run {
        Arc::new(MemoryStore::with_state(db.get_budget_state()?).with_settings(db.get_settings()?))
    } else {
        Arc::new(db)
    };

    let mut source = JsonLinesSource::open(path).await?;
    println!("Replaying {}", path.display());
    println!("{}", rule(40));
    let summary = replay(&mut source, store, config, options.approve).await?;

    println!("{}", rule(40));
    println!(
        "{} event(s), {} gate(s), {} forced home",
        summary.events, summary.gates, summary.force_home
    );
    if options.dry_run {
        println!("Dry run: stored state left untouched.");
    }
    Ok(())
}

async fn replay(
    source: &mut dyn EventSource,
    store: Arc<dyn BudgetStore>,
    config: EngineConfig,
    approve: bool,
) -> Result<ReplaySummary> {
    let mut summary = ReplaySummary::default();
    // The clock starts at the first event so day rollover follows the log
    let Some(first) = source.next_event().await? else {
        println!("No events in log");
        return Ok(summary);
    };

    let clock = Arc::new(ManualClock::new(first.timestamp));
    let sink = Arc::new(RecordingSink::new());
    let mut firewall = AttentionFirewall::new(store, clock.clone(), sink.clone(), config)?;

    let mut next = Some(first);
    while let Some(event) = next {
        clock.set(event.timestamp);
        summary.events += 1;
        let signals = firewall.on_raw_event(&event);
        for signal in &signals {
            if !matches!(signal, Signal::TransientNoise) {
                log::debug!("{} {:?}", event.timestamp.format("%H:%M:%S%.3f"), signal);
            }
        }

        for action in sink.drain() {
            match action {
                EnforcementAction::Gate(gate) => {
                    summary.gates += 1;
                    println!(
                        "{}  GATE  {} ({}) wait {}s, {}",
                        event.timestamp.format("%H:%M:%S"),
                        gate.package,
                        gate.reason.as_str(),
                        gate.wait_seconds,
                        gate.remaining_units
                            .map_or_else(|| String::from("budget unknown"), format_units)
                    );
                    if approve {
                        firewall.on_approved_entry(&gate.package);
                    }
                }
                EnforcementAction::ForceHome => {
                    summary.force_home += 1;
                    println!("{}  HOME", event.timestamp.format("%H:%M:%S"));
                }
            }
        }
        next = source.next_event().await?;
    }

    let status = firewall.status()?;
    if let Some(package) = &status.session.active_package {
        println!(
            "Session in {package} still open, {} forbidden; charging on close",
            format_duration_ms(status.session.live_forbidden_ms)
        );
    }
    firewall.shutdown();
    println!("Remaining: {}", format_units(firewall.remaining_budget()?));
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rewire_storage::BudgetState;

    const LOG: &str = r#"{"package":"com.android.launcher3","kind":"window_state_changed","timestamp":"2024-05-01T20:00:00Z"}
{"package":"com.google.android.youtube","kind":"window_state_changed","timestamp":"2024-05-01T20:00:05Z"}
{"package":"com.google.android.youtube","kind":"window_content_changed","timestamp":"2024-05-01T20:00:40Z"}
{"package":"com.example.notes","kind":"window_state_changed","timestamp":"2024-05-01T20:10:40Z"}
"#;

    fn store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::with_state(BudgetState {
            remaining_units: 1800,
            last_budget_reset_date: chrono::NaiveDate::from_ymd_opt(2024, 5, 1),
            ..BudgetState::default()
        }))
    }

    #[tokio::test]
    async fn test_replay_without_approval_only_gates() {
        let store = store();
        let mut source = JsonLinesSource::new(LOG.as_bytes());
        let summary = replay(&mut source, store.clone(), EngineConfig::default(), false)
            .await
            .unwrap();

        assert_eq!(
            summary,
            ReplaySummary {
                events: 4,
                gates: 1,
                force_home: 0
            }
        );
        assert!(store.sessions().is_empty());
        assert_eq!(store.load_state().unwrap().remaining_units, 1800);
    }

    #[tokio::test]
    async fn test_replay_with_approval_charges_session() {
        let store = store();
        let mut source = JsonLinesSource::new(LOG.as_bytes());
        let summary = replay(&mut source, store.clone(), EngineConfig::default(), true)
            .await
            .unwrap();

        assert_eq!(summary.gates, 1);
        let sessions = store.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].package, "com.google.android.youtube");
        // Opened by the content event at 20:00:40, closed by notes at 20:10:40
        assert_eq!(sessions[0].forbidden_ms, 600_000);
        assert!(store.load_state().unwrap().remaining_units < 1800);
    }

    #[tokio::test]
    async fn test_empty_log() {
        let mut source = JsonLinesSource::new("# nothing\n".as_bytes());
        let summary = replay(&mut source, store(), EngineConfig::default(), false)
            .await
            .unwrap();
        assert_eq!(summary, ReplaySummary::default());
    }
}
