//! Global atomic counters for Autodeploy.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at shutdown or after each reaper tick).

use std::sync::atomic::{AtomicU64, Ordering};

use crate::domain::BuildStatus;

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    events_received: AtomicU64,
    events_skipped: AtomicU64,
    events_failed: AtomicU64,
    builds_dispatched: AtomicU64,
    builds_succeeded: AtomicU64,
    builds_failed: AtomicU64,
    builds_timed_out: AtomicU64,
    builds_cancelled: AtomicU64,
    runners_provisioned: AtomicU64,
    runners_retired: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! counter {
    ($inc:ident, $get:ident) => {
        pub fn $inc(&self) {
            self.$get.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(metric = stringify!($get), "counter incremented");
        }

        pub fn $get(&self) -> u64 {
            self.$get.load(Ordering::Relaxed)
        }
    };
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            events_received: AtomicU64::new(0),
            events_skipped: AtomicU64::new(0),
            events_failed: AtomicU64::new(0),
            builds_dispatched: AtomicU64::new(0),
            builds_succeeded: AtomicU64::new(0),
            builds_failed: AtomicU64::new(0),
            builds_timed_out: AtomicU64::new(0),
            builds_cancelled: AtomicU64::new(0),
            runners_provisioned: AtomicU64::new(0),
            runners_retired: AtomicU64::new(0),
        }
    }

    counter!(inc_events_received, events_received);
    counter!(inc_events_skipped, events_skipped);
    counter!(inc_events_failed, events_failed);
    counter!(inc_builds_dispatched, builds_dispatched);
    counter!(inc_runners_provisioned, runners_provisioned);
    counter!(inc_runners_retired, runners_retired);

    /// Count a finished build under its terminal status.
    pub fn inc_build_finished(&self, status: BuildStatus) {
        let counter = match status {
            BuildStatus::Succeeded => &self.builds_succeeded,
            BuildStatus::Failed => &self.builds_failed,
            BuildStatus::TimedOut => &self.builds_timed_out,
            BuildStatus::Cancelled => &self.builds_cancelled,
            BuildStatus::Queued | BuildStatus::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "builds_finished", status = %status, "counter incremented");
    }

    pub fn builds_succeeded(&self) -> u64 {
        self.builds_succeeded.load(Ordering::Relaxed)
    }

    pub fn builds_failed(&self) -> u64 {
        self.builds_failed.load(Ordering::Relaxed)
    }

    pub fn builds_timed_out(&self) -> u64 {
        self.builds_timed_out.load(Ordering::Relaxed)
    }

    pub fn builds_cancelled(&self) -> u64 {
        self.builds_cancelled.load(Ordering::Relaxed)
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            events_received = self.events_received(),
            events_skipped = self.events_skipped(),
            events_failed = self.events_failed(),
            builds_dispatched = self.builds_dispatched(),
            builds_succeeded = self.builds_succeeded(),
            builds_failed = self.builds_failed(),
            builds_timed_out = self.builds_timed_out(),
            builds_cancelled = self.builds_cancelled(),
            runners_provisioned = self.runners_provisioned(),
            runners_retired = self.runners_retired(),
        );
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.events_received,
            &self.events_skipped,
            &self.events_failed,
            &self.builds_dispatched,
            &self.builds_succeeded,
            &self.builds_failed,
            &self.builds_timed_out,
            &self.builds_cancelled,
            &self.runners_provisioned,
            &self.runners_retired,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
