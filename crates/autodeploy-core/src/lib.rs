//! Autodeploy Core Library
//!
//! Turns git webhook events into builds: normalize the event, ask the
//! user's target function where it deploys, ask the runner function what
//! it builds on, take a pooled runner for that spec, and dispatch the build.

pub mod clock;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod fakes;
pub mod metrics;
pub mod normalize;
pub mod obs;
pub mod orchestrator;
pub mod pool;
pub mod reaper;
pub mod resolve;
pub mod rules;
pub mod telemetry;

pub use domain::{
    Architecture, AutodeployError, BuildJob, BuildStatus, BuildTimeout, Commit, ComputeSize,
    DispatchError, Engine, EventType, GitEvent, MachineResources, NormalizationError,
    ProvisioningError, PullRequestEvent, PushEvent, Repo, ResolutionError, ResolutionStage,
    Result, RunnerRef, RunnerSpec, RunnerSpecInput, Sender, Target, ValidationError,
};

pub use runner_state::{
    MachineId, MemoryRunnerStore, RunnerKey, RunnerRecord, RunnerState, RunnerStore,
    StoreConfig, SurrealRunnerStore,
};

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AutodeployConfig, StoreSettings};
pub use metrics::METRICS;
pub use telemetry::init_tracing;
pub use dispatch::{
    abort_pair, AbortHandle, AbortSignal, BuildDispatcher, BuildExecutor, BuildOptions,
    BuildRequest, BuildSource, RemoteBuildId, RemoteOutcome,
};
pub use normalize::EventNormalizer;
pub use orchestrator::{Autodeploy, AutodeployBuilder, DeployOutcome, DeployPlan};
pub use pool::{
    PoolStats, Provisioner, ReapReport, RecoveryReport, RunnerHandle, RunnerPool,
};
pub use reaper::{IdleReaper, ReaperHandle};
pub use resolve::{
    runner_fn, target_fn, RunnerFn, RunnerInput, RunnerSpecResolver, TargetFn, TargetResolver,
};
pub use rules::{StageRunners, TargetRule, TargetRules};
