//! Cancellable repeating tick source for the session loop.

use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};
use tracing::trace;

/// At most one live interval. Re-`start`ing replaces it.
#[derive(Debug, Default)]
pub struct TickScheduler {
    interval: Option<Interval>,
}

impl TickScheduler {
    #[must_use]
    pub const fn new() -> Self {
        Self { interval: None }
    }

    /// Tick every `period`, first tick one period from now. Late ticks are
    /// delayed, never bursted.
    pub fn start(&mut self, period: Duration) {
        let period = period.max(Duration::from_millis(1));
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.interval = Some(interval);
        trace!(?period, "tick scheduler started");
    }

    /// Stop ticking. Idempotent.
    pub fn cancel(&mut self) {
        if self.interval.take().is_some() {
            trace!("tick scheduler cancelled");
        }
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.interval.is_some()
    }

    #[must_use]
    pub fn period(&self) -> Option<Duration> {
        self.interval.as_ref().map(Interval::period)
    }

    /// Wait for the next tick; pending forever while inactive.
    pub async fn next(&mut self) {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending().await,
        }
    }
}
