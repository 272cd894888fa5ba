//! In-memory provisioner and build executor.
//!
//! Used by the test suites and by `autodeploy serve` in dry-run mode.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use runner_state::{MachineId, RunnerKey};
use tracing::debug;

use crate::dispatch::{BuildExecutor, BuildRequest, RemoteBuildId, RemoteOutcome};
use crate::domain::{ProvisioningError, RunnerSpec};
use crate::pool::Provisioner;

/// Provisioner that hands out sequential machine ids.
pub struct FakeProvisioner {
    prefix: String,
    delay: Option<Duration>,
    teardown_delay: Option<Duration>,
    next_id: AtomicU64,
    calls: AtomicUsize,
    provisioned: AtomicUsize,
    fail_next: Mutex<Option<String>>,
    fail_next_teardown: Mutex<Option<String>>,
    torn_down: Mutex<Vec<MachineId>>,
}

impl Default for FakeProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeProvisioner {
    pub fn new() -> Self {
        Self {
            prefix: "fake".to_string(),
            delay: None,
            teardown_delay: None,
            next_id: AtomicU64::new(1),
            calls: AtomicUsize::new(0),
            provisioned: AtomicUsize::new(0),
            fail_next: Mutex::new(None),
            fail_next_teardown: Mutex::new(None),
            torn_down: Mutex::new(Vec::new()),
        }
    }

    /// Machine ids become `<prefix>-<n>`.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Sleep this long inside every `provision` call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sleep this long inside every `teardown` call.
    pub fn with_teardown_delay(mut self, delay: Duration) -> Self {
        self.teardown_delay = Some(delay);
        self
    }

    /// Make the next `provision` fail with `message`.
    pub fn fail_next(&self, message: impl Into<String>) {
        *self.fail_next.lock().unwrap_or_else(PoisonError::into_inner) = Some(message.into());
    }

    /// Make the next `teardown` fail with `message`.
    pub fn fail_next_teardown(&self, message: impl Into<String>) {
        *self
            .fail_next_teardown
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(message.into());
    }

    /// Number of `provision` calls, successful or not.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of machines successfully provisioned.
    pub fn provisioned(&self) -> usize {
        self.provisioned.load(Ordering::SeqCst)
    }

    pub fn torn_down(&self) -> Vec<MachineId> {
        self.torn_down
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    async fn provision(
        &self,
        spec: &RunnerSpec,
        key: &RunnerKey,
    ) -> Result<MachineId, ProvisioningError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self
            .fail_next
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(message) = failure {
            return Err(ProvisioningError::ProviderFailure {
                key: key.to_string(),
                message,
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let machine = MachineId(format!("{}-{id}", self.prefix));
        self.provisioned.fetch_add(1, Ordering::SeqCst);
        debug!(machine = %machine, spec = %spec.descriptor(), "fake machine provisioned");
        Ok(machine)
    }

    async fn teardown(&self, machine: &MachineId) -> Result<(), ProvisioningError> {
        if let Some(delay) = self.teardown_delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self
            .fail_next_teardown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(message) = failure {
            return Err(ProvisioningError::TeardownFailure {
                machine: machine.to_string(),
                message,
            });
        }
        self.torn_down
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(machine.clone());
        Ok(())
    }
}

/// Executor whose builds all end the same scripted way after a fixed delay.
pub struct ScriptedExecutor {
    outcome: RemoteOutcome,
    delay: Duration,
    start_failure: Option<String>,
    next_id: AtomicU64,
    requests: Mutex<Vec<BuildRequest>>,
    cancelled: Mutex<Vec<RemoteBuildId>>,
}

impl ScriptedExecutor {
    pub fn new(outcome: RemoteOutcome) -> Self {
        Self {
            outcome,
            delay: Duration::ZERO,
            start_failure: None,
            next_id: AtomicU64::new(1),
            requests: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(RemoteOutcome::Succeeded)
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self::new(RemoteOutcome::Failed {
            message: message.into(),
        })
    }

    /// Every build takes this long to finish.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// `start` always fails with `message`.
    pub fn with_start_failure(mut self, message: impl Into<String>) -> Self {
        self.start_failure = Some(message.into());
        self
    }

    /// Requests that reached `start`, in order.
    pub fn requests(&self) -> Vec<BuildRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn cancelled(&self) -> Vec<RemoteBuildId> {
        self.cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl BuildExecutor for ScriptedExecutor {
    async fn start(&self, request: &BuildRequest) -> anyhow::Result<RemoteBuildId> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        if let Some(message) = &self.start_failure {
            return Err(anyhow!("{message}"));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(RemoteBuildId(format!("build-{id}")))
    }

    async fn wait(&self, _build: &RemoteBuildId) -> anyhow::Result<RemoteOutcome> {
        tokio::time::sleep(self.delay).await;
        Ok(self.outcome.clone())
    }

    async fn cancel(&self, build: &RemoteBuildId) -> anyhow::Result<()> {
        self.cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(build.clone());
        Ok(())
    }
}
