//! Autodeploy pipeline.
//!
//! webhook → normalize → target → runner spec → acquire runner → dispatch.
//! An event without a target is a no-op. Each delivery is independent: an
//! error ends that delivery's pipeline and nothing else.

use std::sync::Arc;
use std::time::Duration;

use runner_state::{MemoryRunnerStore, RunnerKey, RunnerStore};
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{info, instrument, Instrument};

use crate::clock::{Clock, SystemClock};
use crate::config::AutodeployConfig;
use crate::dispatch::{AbortSignal, BuildDispatcher, BuildExecutor, BuildOptions, BuildSource};
use crate::domain::{
    AutodeployError, BuildJob, EventType, GitEvent, MachineResources, Result, RunnerSpec, Target,
};
use crate::metrics::METRICS;
use crate::normalize::EventNormalizer;
use crate::obs;
use crate::pool::{Provisioner, RunnerPool, DEFAULT_IDLE_THRESHOLD_DAYS};
use crate::resolve::{RunnerFn, RunnerSpecResolver, TargetFn, TargetResolver};

/// Default bound on each user-function call.
pub const DEFAULT_RESOLUTION_TIMEOUT: Duration = Duration::from_secs(30);

/// What happened to one event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeployOutcome {
    /// The target function returned no target.
    Skipped { event_type: EventType },
    /// A build ran (successfully or not; see the job's status).
    Built(BuildJob),
}

impl DeployOutcome {
    pub fn job(&self) -> Option<&BuildJob> {
        match self {
            DeployOutcome::Built(job) => Some(job),
            DeployOutcome::Skipped { .. } => None,
        }
    }
}

/// Resolved target and runner for an event, without side effects.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeployPlan {
    pub target: Target,
    pub spec: RunnerSpec,
    pub runner_key: RunnerKey,
    pub descriptor: String,
    pub resources: Option<MachineResources>,
}

pub struct Autodeploy {
    targets: TargetResolver,
    runners: RunnerSpecResolver,
    pool: Arc<RunnerPool>,
    dispatcher: BuildDispatcher,
}

impl Autodeploy {
    pub fn builder() -> AutodeployBuilder {
        AutodeployBuilder::default()
    }

    pub fn pool(&self) -> &Arc<RunnerPool> {
        &self.pool
    }

    /// Normalize a raw payload and run it through the pipeline.
    pub async fn handle_webhook(&self, payload: &Value, hint: Option<&str>) -> Result<DeployOutcome> {
        METRICS.inc_events_received();
        let result = match EventNormalizer::normalize(payload, hint) {
            Ok(event) => self.process(event, None).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = &result {
            METRICS.inc_events_failed();
            obs::emit_event_failed(e, e.is_retryable());
        }
        result
    }

    /// Run an already-normalized event through the pipeline.
    pub async fn handle_event(&self, event: GitEvent) -> Result<DeployOutcome> {
        self.handle_event_with(event, None).await
    }

    /// Like [`handle_event`](Self::handle_event), with an external abort for the build.
    pub async fn handle_event_with(
        &self,
        event: GitEvent,
        abort: Option<AbortSignal>,
    ) -> Result<DeployOutcome> {
        METRICS.inc_events_received();
        let result = self.process(event, abort).await;
        if let Err(e) = &result {
            METRICS.inc_events_failed();
            obs::emit_event_failed(e, e.is_retryable());
        }
        result
    }

    #[instrument(skip_all, fields(event_type = %event.event_type(), commit = %event.commit().short_id()))]
    async fn process(&self, event: GitEvent, abort: Option<AbortSignal>) -> Result<DeployOutcome> {
        obs::emit_event_received(&event);

        let Some(target) = self.targets.resolve(&event).await? else {
            METRICS.inc_events_skipped();
            obs::emit_event_skipped(event.event_type());
            return Ok(DeployOutcome::Skipped {
                event_type: event.event_type(),
            });
        };
        let spec = self.runners.resolve(&target.stage).await?;
        let handle = self.pool.acquire(&spec).await?;

        let options = BuildOptions {
            source: Some(BuildSource::from_event(&event)),
            abort,
        };
        let job = self.dispatcher.run_with(target, handle, options).await;
        info!(job_id = %job.id, status = %job.status, "event processed");
        Ok(DeployOutcome::Built(job))
    }

    /// Resolve target and runner spec only. Never touches the pool.
    pub async fn plan(&self, event: &GitEvent) -> Result<Option<DeployPlan>> {
        let Some(target) = self.targets.resolve(event).await? else {
            return Ok(None);
        };
        let spec = self.runners.resolve(&target.stage).await?;
        Ok(Some(DeployPlan {
            runner_key: spec.key(),
            descriptor: spec.descriptor(),
            resources: spec.resources(),
            target,
            spec,
        }))
    }

    /// Process one delivery on its own task.
    pub fn spawn_delivery(
        self: &Arc<Self>,
        payload: Value,
        hint: Option<String>,
    ) -> JoinHandle<Result<DeployOutcome>> {
        let this = Arc::clone(self);
        let span = obs::delivery_span(hint.as_deref());
        tokio::spawn(
            async move { this.handle_webhook(&payload, hint.as_deref()).await }.instrument(span),
        )
    }
}

/// Wires an [`Autodeploy`] from strategies and collaborators.
pub struct AutodeployBuilder {
    target_fn: Option<Arc<dyn TargetFn>>,
    runner_fn: Option<Arc<dyn RunnerFn>>,
    provisioner: Option<Arc<dyn Provisioner>>,
    executor: Option<Arc<dyn BuildExecutor>>,
    store: Option<Arc<dyn RunnerStore>>,
    clock: Arc<dyn Clock>,
    resolution_timeout: Duration,
    idle_threshold: chrono::Duration,
}

impl Default for AutodeployBuilder {
    fn default() -> Self {
        Self {
            target_fn: None,
            runner_fn: None,
            provisioner: None,
            executor: None,
            store: None,
            clock: Arc::new(SystemClock),
            resolution_timeout: DEFAULT_RESOLUTION_TIMEOUT,
            idle_threshold: chrono::Duration::days(DEFAULT_IDLE_THRESHOLD_DAYS),
        }
    }
}

impl AutodeployBuilder {
    /// Take timeouts, target rules and stage runners from a configuration.
    pub fn config(mut self, config: &AutodeployConfig) -> Result<Self> {
        self.target_fn = Some(Arc::new(config.target_rules()?));
        self.runner_fn = Some(Arc::new(config.stage_runners()));
        self.resolution_timeout = config.resolution_timeout();
        self.idle_threshold = config.idle_threshold();
        Ok(self)
    }

    pub fn target_fn(mut self, target_fn: Arc<dyn TargetFn>) -> Self {
        self.target_fn = Some(target_fn);
        self
    }

    pub fn runner_fn(mut self, runner_fn: Arc<dyn RunnerFn>) -> Self {
        self.runner_fn = Some(runner_fn);
        self
    }

    pub fn provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn BuildExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Defaults to a process-local [`MemoryRunnerStore`].
    pub fn store(mut self, store: Arc<dyn RunnerStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn resolution_timeout(mut self, timeout: Duration) -> Self {
        self.resolution_timeout = timeout;
        self
    }

    pub fn idle_threshold(mut self, threshold: chrono::Duration) -> Self {
        self.idle_threshold = threshold;
        self
    }

    pub fn build(self) -> Result<Autodeploy> {
        let missing = |what: &str| AutodeployError::Configuration(format!("{what} is required"));
        let target_fn = self.target_fn.ok_or_else(|| missing("target function"))?;
        let provisioner = self.provisioner.ok_or_else(|| missing("provisioner"))?;
        let executor = self.executor.ok_or_else(|| missing("build executor"))?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryRunnerStore::new()));

        let pool = Arc::new(
            RunnerPool::new(store, provisioner)
                .with_clock(self.clock)
                .with_idle_threshold(self.idle_threshold),
        );
        Ok(Autodeploy {
            targets: TargetResolver::new(target_fn, self.resolution_timeout),
            runners: RunnerSpecResolver::new(self.runner_fn, self.resolution_timeout),
            dispatcher: BuildDispatcher::new(executor, pool.clone()),
            pool,
        })
    }
}
