//! Scheduled idle-runner expiry.
//!
//! Drives [`RunnerPool::reap`] on a fixed interval using the pool's clock.
//! A failed sweep is logged and the next tick tries again.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::domain::Result;
use crate::pool::{ReapReport, RunnerPool};

/// Default sweep interval.
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(3600);

pub struct IdleReaper {
    pool: Arc<RunnerPool>,
    interval: Duration,
}

impl IdleReaper {
    pub fn new(pool: Arc<RunnerPool>, interval: Duration) -> Self {
        Self { pool, interval }
    }

    /// One sweep at the pool clock's current time.
    pub async fn sweep_once(&self) -> Result<ReapReport> {
        let now = self.pool.clock().now();
        self.pool.reap(now).await
    }

    /// Run sweeps in a background task until [`ReaperHandle::stop`].
    ///
    /// The first sweep happens immediately.
    pub fn spawn(self) -> ReaperHandle {
        let (shutdown, mut stop) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = self.interval.as_secs(), "idle reaper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => match self.sweep_once().await {
                        Ok(report) => debug!(
                            retired = report.retired.len(),
                            failed = report.failed.len(),
                            "idle sweep"
                        ),
                        Err(e) => warn!(error = %e, "idle sweep failed"),
                    },
                    _ = stop.changed() => break,
                }
            }
            info!("idle reaper stopped");
        });
        ReaperHandle { shutdown, task }
    }
}

pub struct ReaperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    /// Stop the reaper and wait for an in-flight sweep to finish.
    pub async fn stop(self) {
        self.shutdown.send_replace(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "idle reaper task ended abnormally");
        }
    }
}
