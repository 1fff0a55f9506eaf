use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Periodic re-check that only runs while a forbidden segment is open.
///
/// Stopping drops the interval, so a stopped ticker never fires. Starting an
/// already running ticker keeps its phase.
#[derive(Debug)]
pub struct LiveTicker {
    period: Duration,
    interval: Option<Interval>,
}

impl LiveTicker {
    #[must_use]
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            interval: None,
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.interval.is_some()
    }

    /// Start or stop to match whether a forbidden segment is open
    pub fn sync(&mut self, forbidden_open: bool) {
        match (forbidden_open, self.interval.is_some()) {
            (true, false) => {
                let mut interval = interval_at(Instant::now() + self.period, self.period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.interval = Some(interval);
                log::debug!("Live ticker started ({}ms)", self.period.as_millis());
            }
            (false, true) => {
                self.interval = None;
                log::debug!("Live ticker stopped");
            }
            _ => {}
        }
    }

    /// Wait for the next tick; pends forever while stopped
    pub async fn tick(&mut self) -> Instant {
        match self.interval.as_mut() {
            Some(interval) => interval.tick().await,
            None => std::future::pending().await,
        }
    }
}
