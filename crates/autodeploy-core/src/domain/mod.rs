//! Domain models for Autodeploy.
//!
//! Canonical definitions for the core entities:
//! - `GitEvent`: normalized push / pull-request event
//! - `Target`: stage + env an event deploys to
//! - `RunnerSpec`: canonical build-runner specification
//! - `BuildJob`: one build on one runner

pub mod build_job;
pub mod error;
pub mod event;
pub mod runner_spec;
pub mod target;

// Re-export main types and errors
pub use build_job::{BuildJob, BuildStatus, InvalidTransition, RunnerRef};
pub use error::{
    AutodeployError, DispatchError, NormalizationError, ProvisioningError, ResolutionError,
    ResolutionStage, Result, ValidationError,
};
pub use event::{Commit, EventType, GitEvent, PullRequestEvent, PushEvent, Repo, Sender};
pub use runner_spec::{
    Architecture, BuildTimeout, ComputeSize, Engine, MachineResources, RunnerSpec,
    RunnerSpecInput,
};
pub use target::Target;
