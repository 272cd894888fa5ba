//! Runner pool: reusable build machines keyed by canonical runner spec.
//!
//! - At most one provisioning per key: every state change for a key happens
//!   under that key's async lock, and provisioning holds it throughout.
//! - A busy runner is never shared. Acquirers that find it busy wait for the
//!   key's release notification, or [`WAIT_RECHECK`] at most, and re-check.
//!   A `Provisioning` or `Retiring` record seen under the key lock belongs to
//!   nobody (its owner would still hold the lock) and is cleared.
//! - Ready runners idle for longer than the threshold are torn down by
//!   [`RunnerPool::reap`].
//!
//! The slot map (key → lock + notifier) is a std mutex held only for map
//! bookkeeping, never across an await. Slots are created on first use and
//! pruned once nobody holds them and the key's record is gone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use runner_state::{MachineId, RunnerKey, RunnerRecord, RunnerState, RunnerStore};
use serde::Serialize;
use tokio::sync::{Mutex, Notify, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::domain::{AutodeployError, ProvisioningError, Result, RunnerRef, RunnerSpec};
use crate::metrics::METRICS;
use crate::obs;

/// Default idle expiry for ready runners.
pub const DEFAULT_IDLE_THRESHOLD_DAYS: i64 = 7;

/// Longest an acquirer parks on a busy runner before looking at the record again.
pub const WAIT_RECHECK: std::time::Duration = std::time::Duration::from_secs(30);

/// Creates and destroys build machines.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Create a machine for `spec`. `key` is the pool key, usable as an
    /// idempotency token by the provider.
    async fn provision(
        &self,
        spec: &RunnerSpec,
        key: &RunnerKey,
    ) -> std::result::Result<MachineId, ProvisioningError>;

    async fn teardown(&self, machine: &MachineId) -> std::result::Result<(), ProvisioningError>;
}

/// Exclusive use of one runner, returned by [`RunnerPool::acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerHandle {
    pub key: RunnerKey,
    pub machine_id: MachineId,
    pub spec: RunnerSpec,
}

impl RunnerHandle {
    pub fn to_ref(&self) -> RunnerRef {
        RunnerRef {
            key: self.key.clone(),
            machine_id: self.machine_id.clone(),
        }
    }
}

/// Snapshot of a pool's lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub provisioned: u64,
    pub reused: u64,
    pub released: u64,
    pub retired: u64,
    pub provisioning_failures: u64,
}

#[derive(Default)]
struct PoolCounters {
    provisioned: AtomicU64,
    reused: AtomicU64,
    released: AtomicU64,
    retired: AtomicU64,
    provisioning_failures: AtomicU64,
}

impl PoolCounters {
    fn snapshot(&self) -> PoolStats {
        PoolStats {
            provisioned: self.provisioned.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            retired: self.retired.load(Ordering::Relaxed),
            provisioning_failures: self.provisioning_failures.load(Ordering::Relaxed),
        }
    }
}

/// Result of one idle sweep.
#[derive(Debug, Default)]
pub struct ReapReport {
    pub retired: Vec<RunnerKey>,
    /// Runners whose teardown failed; they are back to `Ready`.
    pub failed: Vec<(RunnerKey, ProvisioningError)>,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.retired.is_empty() && self.failed.is_empty()
    }
}

/// Result of startup reconciliation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// `Busy`/`Retiring` records put back to `Ready`.
    pub restored: usize,
    /// `Provisioning` records (or records without a machine) removed.
    pub discarded: usize,
}

#[derive(Clone, Default)]
struct KeySlot {
    lock: Arc<Mutex<()>>,
    released: Arc<Notify>,
}

type SlotMap = StdMutex<HashMap<RunnerKey, KeySlot>>;

enum Retire {
    Retired,
    Skipped,
}

pub struct RunnerPool {
    store: Arc<dyn RunnerStore>,
    provisioner: Arc<dyn Provisioner>,
    clock: Arc<dyn Clock>,
    idle_threshold: chrono::Duration,
    slots: Arc<SlotMap>,
    counters: PoolCounters,
}

impl RunnerPool {
    pub fn new(store: Arc<dyn RunnerStore>, provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            store,
            provisioner,
            clock: Arc::new(SystemClock),
            idle_threshold: chrono::Duration::days(DEFAULT_IDLE_THRESHOLD_DAYS),
            slots: Arc::new(StdMutex::new(HashMap::new())),
            counters: PoolCounters::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_idle_threshold(mut self, threshold: chrono::Duration) -> Self {
        self.idle_threshold = threshold;
        self
    }

    pub fn idle_threshold(&self) -> chrono::Duration {
        self.idle_threshold
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot()
    }

    /// Current records, ordered by key.
    pub async fn records(&self) -> Result<Vec<RunnerRecord>> {
        Ok(self.store.list().await?)
    }

    pub async fn get(&self, key: &RunnerKey) -> Result<Option<RunnerRecord>> {
        Ok(self.store.get(key).await?)
    }

    /// Take exclusive use of a runner for `spec`, provisioning one if the
    /// pool has none for its key.
    #[instrument(skip_all, fields(runner = %spec.descriptor()))]
    pub async fn acquire(&self, spec: &RunnerSpec) -> Result<RunnerHandle> {
        let key = spec.key();
        let slot = self.slot(&key);

        loop {
            let lock = slot.lock.clone().lock_owned().await;

            match self.store.get(&key).await? {
                Some(mut record) if record.state == RunnerState::Ready => {
                    let Some(machine_id) = record.machine_id.clone() else {
                        warn!(key = %key.short(), "ready record without machine, discarding");
                        self.store.remove(&key).await?;
                        drop(lock);
                        continue;
                    };
                    record.state = RunnerState::Busy;
                    record.last_used_at = self.clock.now();
                    self.store.put(&record).await?;

                    self.counters.reused.fetch_add(1, Ordering::Relaxed);
                    obs::emit_runner_acquired(&key, &machine_id, false);
                    return Ok(RunnerHandle {
                        key,
                        machine_id,
                        spec: *spec,
                    });
                }
                Some(record) if record.state == RunnerState::Busy => {
                    debug!(key = %key.short(), "runner busy, waiting for release");
                    let released = slot.released.notified();
                    drop(lock);
                    if tokio::time::timeout(WAIT_RECHECK, released).await.is_err() {
                        debug!(key = %key.short(), "no release yet, re-checking runner");
                    }
                }
                Some(record) => {
                    warn!(key = %key.short(), state = %record.state, "clearing abandoned runner record");
                    self.clear_abandoned(&record).await?;
                    drop(lock);
                }
                None => {
                    let provisioned = self.provision(spec, key.clone(), lock).await;
                    if provisioned.is_err() {
                        drop(slot);
                        self.prune(&key);
                    }
                    return provisioned;
                }
            }
        }
    }

    async fn provision(
        &self,
        spec: &RunnerSpec,
        key: RunnerKey,
        lock: OwnedMutexGuard<()>,
    ) -> Result<RunnerHandle> {
        let mut record = RunnerRecord::provisioning(key.clone(), spec.descriptor(), self.clock.now());
        self.store.put(&record).await?;
        let guard = ProvisioningGuard {
            lock: Some(lock),
            key: key.clone(),
            store: self.store.clone(),
        };

        info!(key = %key.short(), "provisioning runner");
        let machine_id = match self.provisioner.provision(spec, &key).await {
            Ok(machine_id) => machine_id,
            Err(e) => {
                self.counters
                    .provisioning_failures
                    .fetch_add(1, Ordering::Relaxed);
                obs::emit_provisioning_failed(&key, &e);
                guard.abort().await?;
                return Err(e.into());
            }
        };

        record.machine_id = Some(machine_id.clone());
        record.state = RunnerState::Busy;
        record.last_used_at = self.clock.now();
        if let Err(e) = self.store.put(&record).await {
            warn!(key = %key.short(), machine = %machine_id, error = %e, "failed to record provisioned runner, tearing it down");
            if let Err(teardown) = self.provisioner.teardown(&machine_id).await {
                obs::emit_teardown_failed(&key, &teardown);
            }
            let _ = guard.abort().await;
            return Err(e.into());
        }
        drop(guard.disarm());

        self.counters.provisioned.fetch_add(1, Ordering::Relaxed);
        METRICS.inc_runners_provisioned();
        obs::emit_runner_acquired(&key, &machine_id, true);
        Ok(RunnerHandle {
            key,
            machine_id,
            spec: *spec,
        })
    }

    /// Return a busy runner to the pool and wake one round of waiters.
    #[instrument(skip_all, fields(key = %handle.key.short(), machine = %handle.machine_id))]
    pub async fn release(&self, handle: &RunnerHandle) -> Result<()> {
        let slot = self.slot(&handle.key);
        let outcome = {
            let _lock = slot.lock.lock().await;
            self.release_locked(handle, &slot).await
        };
        if matches!(outcome, Err(AutodeployError::UnknownRunner { .. })) {
            drop(slot);
            self.prune(&handle.key);
        }
        outcome
    }

    async fn release_locked(&self, handle: &RunnerHandle, slot: &KeySlot) -> Result<()> {
        let Some(mut record) = self.store.get(&handle.key).await? else {
            return Err(AutodeployError::UnknownRunner {
                key: handle.key.to_string(),
            });
        };
        if record.state != RunnerState::Busy
            || record.machine_id.as_ref() != Some(&handle.machine_id)
        {
            return Err(AutodeployError::RunnerNotBusy {
                key: handle.key.to_string(),
                state: record.state,
            });
        }

        record.state = RunnerState::Ready;
        record.last_used_at = self.clock.now();
        self.store.put(&record).await?;
        slot.released.notify_waiters();

        self.counters.released.fetch_add(1, Ordering::Relaxed);
        obs::emit_runner_released(&handle.key, &handle.machine_id);
        Ok(())
    }

    /// Drop a `Provisioning`/`Retiring` record whose owner is gone. Caller
    /// holds the key lock.
    async fn clear_abandoned(&self, record: &RunnerRecord) -> Result<()> {
        if let Some(machine_id) = &record.machine_id {
            if let Err(e) = self.provisioner.teardown(machine_id).await {
                obs::emit_teardown_failed(&record.key, &e);
            }
        }
        self.store.remove(&record.key).await?;
        Ok(())
    }

    /// Take a busy runner out of the pool for good: tear its machine down and
    /// forget the record.
    ///
    /// For a runner that could not be released; waiters on the key wake and
    /// provision a fresh one.
    #[instrument(skip_all, fields(key = %handle.key.short(), machine = %handle.machine_id))]
    pub async fn discard(&self, handle: &RunnerHandle) -> Result<()> {
        let slot = self.slot(&handle.key);
        let outcome = {
            let _lock = slot.lock.lock().await;
            self.discard_locked(handle, &slot).await
        };
        drop(slot);
        if outcome.is_ok() {
            self.prune(&handle.key);
        }
        outcome
    }

    async fn discard_locked(&self, handle: &RunnerHandle, slot: &KeySlot) -> Result<()> {
        let Some(record) = self.store.get(&handle.key).await? else {
            slot.released.notify_waiters();
            return Ok(());
        };
        if record.state != RunnerState::Busy
            || record.machine_id.as_ref() != Some(&handle.machine_id)
        {
            return Err(AutodeployError::RunnerNotBusy {
                key: handle.key.to_string(),
                state: record.state,
            });
        }

        if let Err(e) = self.provisioner.teardown(&handle.machine_id).await {
            obs::emit_teardown_failed(&handle.key, &e);
        }
        self.store.remove(&handle.key).await?;
        slot.released.notify_waiters();

        self.counters.retired.fetch_add(1, Ordering::Relaxed);
        METRICS.inc_runners_retired();
        obs::emit_runner_retired(&handle.key, Some(&handle.machine_id));
        Ok(())
    }

    /// Tear down every ready runner idle for strictly longer than the
    /// threshold. Busy and provisioning runners are never touched.
    #[instrument(skip(self))]
    pub async fn reap(&self, now: DateTime<Utc>) -> Result<ReapReport> {
        let mut report = ReapReport::default();
        let candidates: Vec<RunnerKey> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|r| r.state == RunnerState::Ready && r.is_idle(now, self.idle_threshold))
            .map(|r| r.key)
            .collect();

        for key in candidates {
            match self.retire_key(&key, Some(now)).await {
                Ok(Retire::Retired) => report.retired.push(key),
                Ok(Retire::Skipped) => {}
                Err(AutodeployError::Provisioning(e)) => report.failed.push((key, e)),
                Err(e) => return Err(e),
            }
        }

        if !report.is_empty() {
            info!(
                retired = report.retired.len(),
                failed = report.failed.len(),
                "idle sweep finished"
            );
        }
        Ok(report)
    }

    /// Tear down a ready runner now, regardless of idle time.
    ///
    /// Returns `false` if the runner is not ready (busy, provisioning).
    pub async fn retire(&self, key: &RunnerKey) -> Result<bool> {
        if self.store.get(key).await?.is_none() {
            return Err(AutodeployError::UnknownRunner {
                key: key.to_string(),
            });
        }
        match self.retire_key(key, None).await? {
            Retire::Retired => Ok(true),
            Retire::Skipped => Ok(false),
        }
    }

    async fn retire_key(&self, key: &RunnerKey, idle_at: Option<DateTime<Utc>>) -> Result<Retire> {
        let slot = self.slot(key);
        let outcome = {
            let _lock = slot.lock.lock().await;
            self.retire_locked(key, idle_at).await
        };
        drop(slot);
        if matches!(outcome, Ok(Retire::Retired)) {
            self.prune(key);
        }
        outcome
    }

    async fn retire_locked(&self, key: &RunnerKey, idle_at: Option<DateTime<Utc>>) -> Result<Retire> {
        // Re-check under the lock; the record may have been acquired since listing.
        let Some(mut record) = self.store.get(key).await? else {
            return Ok(Retire::Skipped);
        };
        if record.state != RunnerState::Ready {
            return Ok(Retire::Skipped);
        }
        if let Some(now) = idle_at {
            if !record.is_idle(now, self.idle_threshold) {
                return Ok(Retire::Skipped);
            }
        }

        record.state = RunnerState::Retiring;
        self.store.put(&record).await?;

        if let Some(machine_id) = &record.machine_id {
            if let Err(e) = self.provisioner.teardown(machine_id).await {
                obs::emit_teardown_failed(key, &e);
                record.state = RunnerState::Ready;
                self.store.put(&record).await?;
                return Err(e.into());
            }
        }
        self.store.remove(key).await?;

        self.counters.retired.fetch_add(1, Ordering::Relaxed);
        METRICS.inc_runners_retired();
        obs::emit_runner_retired(key, record.machine_id.as_ref());
        Ok(Retire::Retired)
    }

    /// Reconcile persisted records left behind by a previous process.
    ///
    /// Run once at startup, before any acquire.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for record in self.store.list().await? {
            let slot = self.slot(&record.key);
            let _lock = slot.lock.lock().await;
            let Some(mut record) = self.store.get(&record.key).await? else {
                continue;
            };
            match (record.state, &record.machine_id) {
                (RunnerState::Ready, Some(_)) => {}
                (RunnerState::Busy | RunnerState::Retiring, Some(_)) => {
                    record.state = RunnerState::Ready;
                    self.store.put(&record).await?;
                    report.restored += 1;
                }
                (_, _) => {
                    warn!(key = %record.key.short(), state = %record.state, "discarding orphaned runner record");
                    self.store.remove(&record.key).await?;
                    report.discarded += 1;
                }
            }
        }
        if report.restored + report.discarded > 0 {
            info!(
                restored = report.restored,
                discarded = report.discarded,
                "runner pool recovered"
            );
        }
        Ok(report)
    }

    fn slot(&self, key: &RunnerKey) -> KeySlot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry(key.clone()).or_default().clone()
    }

    fn prune(&self, key: &RunnerKey) {
        prune_slot(&self.slots, key);
    }

    #[cfg(test)]
    fn tracked_slots(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn prune_slot(slots: &SlotMap, key: &RunnerKey) {
    let mut slots = slots.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(slot) = slots.get(key) {
        if Arc::strong_count(&slot.lock) == 1 {
            slots.remove(key);
        }
    }
}

/// Removes the `Provisioning` record if the acquire is abandoned mid-provision.
///
/// The key lock travels with the guard so the record is gone before the
/// next acquirer can look at it.
struct ProvisioningGuard {
    lock: Option<OwnedMutexGuard<()>>,
    key: RunnerKey,
    store: Arc<dyn RunnerStore>,
}

impl ProvisioningGuard {
    fn disarm(mut self) -> Option<OwnedMutexGuard<()>> {
        self.lock.take()
    }

    async fn abort(mut self) -> Result<()> {
        let lock = self.lock.take();
        let removed = self.store.remove(&self.key).await;
        drop(lock);
        Ok(removed?)
    }
}

impl Drop for ProvisioningGuard {
    fn drop(&mut self) {
        let Some(lock) = self.lock.take() else {
            return;
        };
        let key = self.key.clone();
        let store = self.store.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = store.remove(&key).await {
                        warn!(key = %key.short(), error = %e, "failed to remove abandoned provisioning record");
                    }
                    drop(lock);
                });
            }
            Err(_) => {
                warn!(key = %key.short(), "no runtime to clean up abandoned provisioning record");
            }
        }
    }
}
