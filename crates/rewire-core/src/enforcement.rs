use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Why the friction gate is being shown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateReason {
    /// An extractive app reached the foreground with no session
    ExtractiveApp,
    /// A browser committed a forbidden URL with no session
    ForbiddenUrl,
    /// A forbidden pattern not yet approved in the running session
    NewPattern,
    /// Live exhaustion closed the session
    BudgetExhausted,
}

impl GateReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ExtractiveApp => "extractive app",
            Self::ForbiddenUrl => "forbidden url",
            Self::NewPattern => "new pattern",
            Self::BudgetExhausted => "budget exhausted",
        }
    }
}

/// What the host needs to render the decision gate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateRequest {
    pub package: String,
    pub pattern: Option<String>,
    pub reason: GateReason,
    /// Friction delay before the host may offer approval
    pub wait_seconds: u32,
    /// `None` when the store could not be read
    pub remaining_units: Option<i64>,
}

/// Side effects the firewall asks the host to perform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnforcementAction {
    Gate(GateRequest),
    ForceHome,
}

/// Host-implemented enforcement. The core only calls these.
pub trait EnforcementSink: Send + Sync {
    /// Show the friction / decision UI
    fn request_gate(&self, request: GateRequest);

    /// Terminate the current foreground context
    fn force_home(&self);
}

/// Keeps every action in memory, for replays and tests
#[derive(Debug, Default)]
pub struct RecordingSink {
    actions: Mutex<Vec<EnforcementAction>>,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, action: EnforcementAction) {
        if let Ok(mut actions) = self.actions.lock() {
            actions.push(action);
        }
    }

    #[must_use]
    pub fn actions(&self) -> Vec<EnforcementAction> {
        self.actions
            .lock()
            .map(|actions| actions.clone())
            .unwrap_or_default()
    }

    /// Remove and return everything recorded so far
    pub fn drain(&self) -> Vec<EnforcementAction> {
        self.actions
            .lock()
            .map(|mut actions| std::mem::take(&mut *actions))
            .unwrap_or_default()
    }

    #[must_use]
    pub fn gates(&self) -> Vec<GateRequest> {
        self.actions()
            .into_iter()
            .filter_map(|action| match action {
                EnforcementAction::Gate(request) => Some(request),
                EnforcementAction::ForceHome => None,
            })
            .collect()
    }

    #[must_use]
    pub fn home_count(&self) -> usize {
        self.actions()
            .iter()
            .filter(|action| matches!(action, EnforcementAction::ForceHome))
            .count()
    }
}

impl EnforcementSink for RecordingSink {
    fn request_gate(&self, request: GateRequest) {
        self.push(EnforcementAction::Gate(request));
    }

    fn force_home(&self) {
        self.push(EnforcementAction::ForceHome);
    }
}

/// Forwards actions to an async consumer, such as the daemon loop
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<EnforcementAction>,
}

impl ChannelSink {
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EnforcementAction>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, action: EnforcementAction) {
        if self.tx.send(action).is_err() {
            log::warn!("Enforcement receiver dropped, action lost");
        }
    }
}

impl EnforcementSink for ChannelSink {
    fn request_gate(&self, request: GateRequest) {
        self.send(EnforcementAction::Gate(request));
    }

    fn force_home(&self) {
        self.send(EnforcementAction::ForceHome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(package: &str) -> GateRequest {
        GateRequest {
            package: package.to_string(),
            pattern: None,
            reason: GateReason::ExtractiveApp,
            wait_seconds: 30,
            remaining_units: Some(100),
        }
    }

    #[test]
    fn test_recording_sink_keeps_order() {
        let sink = RecordingSink::new();
        sink.request_gate(gate("a"));
        sink.force_home();
        sink.request_gate(gate("b"));

        assert_eq!(sink.home_count(), 1);
        let packages: Vec<_> = sink.gates().into_iter().map(|g| g.package).collect();
        assert_eq!(packages, vec!["a", "b"]);

        assert_eq!(sink.drain().len(), 3);
        assert!(sink.actions().is_empty());
    }

    #[tokio::test]
    async fn test_channel_sink_forwards_actions() {
        let (sink, mut rx) = ChannelSink::channel();
        sink.force_home();
        sink.request_gate(gate("a"));

        assert_eq!(rx.recv().await, Some(EnforcementAction::ForceHome));
        assert_eq!(rx.recv().await, Some(EnforcementAction::Gate(gate("a"))));
    }
}
