//! Build dispatch onto an acquired runner.
//!
//! [`BuildDispatcher::run`] starts the build through the [`BuildExecutor`],
//! then races completion, the runner's timeout, and an optional external abort
//! in one `select!`. Whatever wins decides the job's terminal status. The
//! runner goes back to the pool exactly once on every path, including when
//! the `run` future itself is dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use runner_state::MachineId;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{warn, Instrument};
use uuid::Uuid;

use crate::clock::Clock;
use crate::domain::{BuildJob, BuildStatus, DispatchError, GitEvent, RunnerSpec, Target};
use crate::metrics::METRICS;
use crate::obs;
use crate::pool::{RunnerHandle, RunnerPool};

/// Identifier of a build on the remote build service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteBuildId(pub String);

impl std::fmt::Display for RemoteBuildId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Code the build checks out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSource {
    /// `owner/name`
    pub repo: String,
    /// Branch for pushes, head branch for pull requests.
    pub reference: String,
    pub commit: String,
}

impl BuildSource {
    pub fn from_event(event: &GitEvent) -> Self {
        let reference = match event {
            GitEvent::Push(push) => push.branch.clone(),
            GitEvent::PullRequest(pr) => pr.head.clone(),
        };
        Self {
            repo: event.repo().full_name(),
            reference,
            commit: event.commit().id.clone(),
        }
    }
}

/// Everything the executor needs to start one build.
#[derive(Debug, Clone, Serialize)]
pub struct BuildRequest {
    pub job_id: Uuid,
    pub target: Target,
    pub machine_id: MachineId,
    pub spec: RunnerSpec,
    pub source: Option<BuildSource>,
}

/// How a remote build ended on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RemoteOutcome {
    Succeeded,
    Failed { message: String },
}

/// Remote build service.
#[async_trait]
pub trait BuildExecutor: Send + Sync {
    async fn start(&self, request: &BuildRequest) -> anyhow::Result<RemoteBuildId>;

    /// Resolve when the build finishes. An `Err` means the build's state
    /// could not be observed and is treated as a remote failure.
    async fn wait(&self, build: &RemoteBuildId) -> anyhow::Result<RemoteOutcome>;

    /// Force-stop a running build. Best effort.
    async fn cancel(&self, build: &RemoteBuildId) -> anyhow::Result<()>;
}

/// Trigger side of an external abort; see [`abort_pair`].
#[derive(Debug, Clone)]
pub struct AbortHandle(Arc<watch::Sender<bool>>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.send_replace(true);
    }
}

/// Wait side of an external abort.
#[derive(Debug, Clone)]
pub struct AbortSignal(watch::Receiver<bool>);

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolve once aborted. Never resolves if the handle is dropped first.
    pub async fn aborted(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

pub fn abort_pair() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(false);
    (AbortHandle(Arc::new(tx)), AbortSignal(rx))
}

/// Per-run options.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub source: Option<BuildSource>,
    pub abort: Option<AbortSignal>,
}

pub struct BuildDispatcher {
    executor: Arc<dyn BuildExecutor>,
    pool: Arc<RunnerPool>,
    clock: Arc<dyn Clock>,
}

impl BuildDispatcher {
    pub fn new(executor: Arc<dyn BuildExecutor>, pool: Arc<RunnerPool>) -> Self {
        let clock = pool.clock();
        Self {
            executor,
            pool,
            clock,
        }
    }

    /// Run `target` on `handle` and release the runner afterwards.
    pub async fn run(&self, target: Target, handle: RunnerHandle) -> BuildJob {
        self.run_with(target, handle, BuildOptions::default()).await
    }

    pub async fn run_with(
        &self,
        target: Target,
        handle: RunnerHandle,
        options: BuildOptions,
    ) -> BuildJob {
        let mut guard = RunGuard {
            pool: self.pool.clone(),
            executor: self.executor.clone(),
            handle: Some(handle.clone()),
            remote: None,
        };
        let mut job = BuildJob::queued(target, handle.to_ref(), self.clock.now());
        let span = obs::build_span(&job.id, &job.target.stage, &handle.key);

        self.drive(&mut job, &handle, options, &mut guard)
            .instrument(span.clone())
            .await;
        guard.release().instrument(span).await;
        job
    }

    async fn drive(
        &self,
        job: &mut BuildJob,
        handle: &RunnerHandle,
        options: BuildOptions,
        guard: &mut RunGuard,
    ) {
        let request = BuildRequest {
            job_id: job.id,
            target: job.target.clone(),
            machine_id: handle.machine_id.clone(),
            spec: handle.spec,
            source: options.source,
        };

        let remote = match self.executor.start(&request).await {
            Ok(remote) => remote,
            Err(e) => {
                let failure = DispatchError::StartFailure {
                    message: format!("{e:#}"),
                };
                self.finish(job, BuildStatus::Failed, Some(failure));
                return;
            }
        };
        guard.remote = Some(remote.clone());
        if let Err(e) = job.start() {
            warn!(error = %e, "unexpected job state at start");
        }
        METRICS.inc_builds_dispatched();
        obs::emit_build_started(&job.id, &remote);

        let timeout = handle.spec.timeout.as_duration();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut abort = options.abort;

        let (status, failure) = tokio::select! {
            biased;
            result = self.executor.wait(&remote) => match result {
                Ok(RemoteOutcome::Succeeded) => (BuildStatus::Succeeded, None),
                Ok(RemoteOutcome::Failed { message }) => {
                    (BuildStatus::Failed, Some(DispatchError::RemoteFailure { message }))
                }
                Err(e) => (
                    BuildStatus::Failed,
                    Some(DispatchError::RemoteFailure {
                        message: format!("{e:#}"),
                    }),
                ),
            },
            _ = tokio::time::sleep_until(deadline) => {
                self.cancel_remote(&remote).await;
                (BuildStatus::TimedOut, Some(DispatchError::TimedOut { after: timeout }))
            }
            _ = wait_for_abort(abort.as_mut()) => {
                self.cancel_remote(&remote).await;
                (BuildStatus::Cancelled, Some(DispatchError::Cancelled))
            }
        };
        guard.remote = None;
        self.finish(job, status, failure);
    }

    async fn cancel_remote(&self, remote: &RemoteBuildId) {
        if let Err(e) = self.executor.cancel(remote).await {
            warn!(build = %remote, error = %e, "failed to cancel remote build");
        }
    }

    fn finish(&self, job: &mut BuildJob, status: BuildStatus, failure: Option<DispatchError>) {
        if let Err(e) = job.finish(status, failure, self.clock.now()) {
            warn!(error = %e, "build already finished");
            return;
        }
        METRICS.inc_build_finished(status);
        let duration_ms = job
            .duration()
            .and_then(|d| d.to_std().ok())
            .map_or(0, |d: Duration| d.as_millis() as u64);
        obs::emit_build_finished(&job.id, status, duration_ms, job.failure.as_ref());
    }
}

async fn wait_for_abort(signal: Option<&mut AbortSignal>) {
    match signal {
        Some(signal) => signal.aborted().await,
        None => std::future::pending().await,
    }
}

/// Owns the runner for the length of one run.
///
/// `release` hands it back in-line; if the run is dropped instead, `Drop`
/// cancels any in-flight remote build and releases from a spawned task.
struct RunGuard {
    pool: Arc<RunnerPool>,
    executor: Arc<dyn BuildExecutor>,
    handle: Option<RunnerHandle>,
    remote: Option<RemoteBuildId>,
}

impl RunGuard {
    async fn release(mut self) {
        if let Some(handle) = self.handle.take() {
            release_runner(&self.pool, &handle).await;
        }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let pool = self.pool.clone();
        let executor = self.executor.clone();
        let remote = self.remote.take();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Some(remote) = remote {
                        if let Err(e) = executor.cancel(&remote).await {
                            warn!(build = %remote, error = %e, "failed to cancel abandoned build");
                        }
                    }
                    release_runner(&pool, &handle).await;
                });
            }
            Err(_) => {
                warn!(key = %handle.key.short(), "no runtime to release abandoned runner");
            }
        }
    }
}

/// Release attempts before a runner that cannot be returned is discarded.
const RELEASE_ATTEMPTS: u32 = 3;
const RELEASE_BACKOFF: Duration = Duration::from_millis(200);

async fn release_runner(pool: &RunnerPool, handle: &RunnerHandle) {
    let mut attempt = 1;
    loop {
        match pool.release(handle).await {
            Ok(()) => return,
            Err(e) if e.is_retryable() && attempt < RELEASE_ATTEMPTS => {
                warn!(key = %handle.key.short(), machine = %handle.machine_id, attempt, error = %e, "failed to release runner, retrying");
                tokio::time::sleep(RELEASE_BACKOFF * attempt).await;
                attempt += 1;
            }
            Err(e) if e.is_retryable() => {
                warn!(key = %handle.key.short(), machine = %handle.machine_id, error = %e, "giving up on release, discarding runner");
                if let Err(e) = pool.discard(handle).await {
                    warn!(key = %handle.key.short(), machine = %handle.machine_id, error = %e, "failed to discard runner");
                }
                return;
            }
            Err(e) => {
                warn!(key = %handle.key.short(), machine = %handle.machine_id, error = %e, "failed to release runner");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_abort_signal_resolves_after_abort() {
        let (handle, mut signal) = abort_pair();
        assert!(!signal.is_aborted());
        handle.abort();
        signal.aborted().await;
        assert!(signal.is_aborted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_signal_pending_when_handle_dropped() {
        let (handle, mut signal) = abort_pair();
        drop(handle);
        let waited =
            tokio::time::timeout(Duration::from_secs(5), signal.aborted()).await;
        assert!(waited.is_err());
    }

    #[test]
    fn test_remote_outcome_serde() {
        let json = serde_json::to_value(RemoteOutcome::Failed {
            message: "exit 2".to_string(),
        })
        .unwrap();
        assert_eq!(json["result"], "failed");
    }
}
