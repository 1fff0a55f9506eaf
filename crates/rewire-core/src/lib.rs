pub mod budget;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod daemon;
pub mod enforcement;
pub mod firewall;
pub mod ipc;
pub mod node;
pub mod session_tracker;
pub mod source;
pub mod ticker;

pub use budget::{BudgetEngine, Depletion, Quote};
pub use classifier::{EventClassifier, EventKind, RawEvent, Signal};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use daemon::Daemon;
pub use enforcement::{EnforcementAction, EnforcementSink, GateReason, GateRequest};
pub use firewall::{AttentionFirewall, FirewallStatus};
pub use session_tracker::{SessionTracker, TrackerStatus};
