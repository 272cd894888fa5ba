//! Target and runner-spec resolution through user-supplied functions.
//!
//! User functions are injected as [`TargetFn`] / [`RunnerFn`] trait objects.
//! Each call is bounded by the resolution timeout and isolated from panics:
//! an `Err`, a panic, or a timeout all become a [`ResolutionError`] tagged
//! with the stage it came from. Nothing is retried.
//!
//! A function that blocks the thread without awaiting cannot be preempted
//! by the timeout; user functions are expected to be async-friendly.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::domain::{
    GitEvent, ResolutionError, ResolutionStage, Result, RunnerSpec, RunnerSpecInput, Target,
};

/// Maps a git event to the stage it deploys to. `None` means "do not deploy".
#[async_trait]
pub trait TargetFn: Send + Sync {
    async fn target(&self, event: &GitEvent) -> anyhow::Result<Option<Target>>;
}

/// Argument handed to the runner function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerInput {
    pub stage: String,
}

/// Maps a stage to the runner it builds on.
#[async_trait]
pub trait RunnerFn: Send + Sync {
    async fn runner(&self, input: &RunnerInput) -> anyhow::Result<RunnerSpecInput>;
}

/// Closure adapter for [`TargetFn`]; see [`target_fn`].
pub struct FnTarget<F>(F);

#[async_trait]
impl<F, Fut> TargetFn for FnTarget<F>
where
    F: Fn(GitEvent) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Option<Target>>> + Send,
{
    async fn target(&self, event: &GitEvent) -> anyhow::Result<Option<Target>> {
        (self.0)(event.clone()).await
    }
}

/// Closure adapter for [`RunnerFn`]; see [`runner_fn`].
pub struct FnRunner<F>(F);

#[async_trait]
impl<F, Fut> RunnerFn for FnRunner<F>
where
    F: Fn(RunnerInput) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<RunnerSpecInput>> + Send,
{
    async fn runner(&self, input: &RunnerInput) -> anyhow::Result<RunnerSpecInput> {
        (self.0)(input.clone()).await
    }
}

/// Wrap an async closure as a target function.
///
/// ```ignore
/// let f = target_fn(|event| async move {
///     Ok(match event {
///         GitEvent::Push(p) if p.branch == "main" => Some(Target::new("production")),
///         _ => None,
///     })
/// });
/// ```
pub fn target_fn<F, Fut>(f: F) -> Arc<dyn TargetFn>
where
    F: Fn(GitEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<Target>>> + Send + 'static,
{
    Arc::new(FnTarget(f))
}

/// Wrap an async closure as a runner function.
pub fn runner_fn<F, Fut>(f: F) -> Arc<dyn RunnerFn>
where
    F: Fn(RunnerInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<RunnerSpecInput>> + Send + 'static,
{
    Arc::new(FnRunner(f))
}

/// Invokes the target function once per event.
#[derive(Clone)]
pub struct TargetResolver {
    target_fn: Arc<dyn TargetFn>,
    timeout: Duration,
}

impl TargetResolver {
    pub fn new(target_fn: Arc<dyn TargetFn>, timeout: Duration) -> Self {
        Self { target_fn, timeout }
    }

    #[instrument(skip_all, fields(event_type = %event.event_type(), repo = %event.repo().full_name()))]
    pub async fn resolve(&self, event: &GitEvent) -> Result<Option<Target>> {
        let target = guarded(
            ResolutionStage::Target,
            self.timeout,
            self.target_fn.target(event),
        )
        .await?;

        match &target {
            Some(t) => {
                t.validate()?;
                debug!(stage = %t.stage, "target resolved");
            }
            None => debug!("no target for event"),
        }
        Ok(target)
    }
}

/// Invokes the runner function for a stage and canonicalizes the result.
#[derive(Clone)]
pub struct RunnerSpecResolver {
    runner_fn: Option<Arc<dyn RunnerFn>>,
    timeout: Duration,
}

impl RunnerSpecResolver {
    pub fn new(runner_fn: Option<Arc<dyn RunnerFn>>, timeout: Duration) -> Self {
        Self { runner_fn, timeout }
    }

    #[instrument(skip(self))]
    pub async fn resolve(&self, stage: &str) -> Result<RunnerSpec> {
        let Some(runner_fn) = &self.runner_fn else {
            return Ok(RunnerSpec::default());
        };

        let input = RunnerInput {
            stage: stage.to_string(),
        };
        let raw = guarded(ResolutionStage::Runner, self.timeout, runner_fn.runner(&input)).await?;
        let spec = raw.canonicalize()?;
        debug!(spec = %spec.descriptor(), "runner spec resolved");
        Ok(spec)
    }
}

async fn guarded<T, F>(
    stage: ResolutionStage,
    timeout: Duration,
    call: F,
) -> std::result::Result<T, ResolutionError>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(timeout, AssertUnwindSafe(call).catch_unwind()).await {
        Err(_) => {
            warn!(%stage, timeout_ms = timeout.as_millis() as u64, "user function timed out");
            Err(ResolutionError::Timeout {
                stage,
                after: timeout,
            })
        }
        Ok(Err(panic)) => {
            let message = panic_message(panic.as_ref());
            warn!(%stage, %message, "user function panicked");
            Err(ResolutionError::UserFunctionThrew { stage, message })
        }
        Ok(Ok(Err(e))) => Err(ResolutionError::UserFunctionThrew {
            stage,
            message: format!("{e:#}"),
        }),
        Ok(Ok(Ok(value))) => Ok(value),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
