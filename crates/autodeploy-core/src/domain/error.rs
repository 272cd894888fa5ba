//! Domain-level error taxonomy for Autodeploy.
//!
//! Each pipeline step has its own error enum; [`AutodeployError`] is the
//! umbrella returned by the orchestrator. Errors are scoped to one event's
//! pipeline and never retried automatically.

use std::time::Duration;

use runner_state::{RunnerState, StorageError};
use serde::{Deserialize, Serialize};

use super::runner_spec::{Architecture, BuildTimeout, ComputeSize};

/// Errors produced while turning a raw webhook payload into a `GitEvent`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizationError {
    #[error("unsupported event type: {event_type}")]
    UnsupportedEvent { event_type: String },

    #[error("malformed payload at `{field}`: {reason}")]
    MalformedPayload { field: String, reason: String },
}

impl NormalizationError {
    pub(crate) fn malformed(field: impl Into<String>, reason: impl Into<String>) -> Self {
        NormalizationError::MalformedPayload {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Which user function a resolution error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStage {
    Target,
    Runner,
}

impl std::fmt::Display for ResolutionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolutionStage::Target => f.write_str("target"),
            ResolutionStage::Runner => f.write_str("runner"),
        }
    }
}

/// Errors produced while invoking a user-supplied resolver function.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionError {
    #[error("{stage} function timed out after {}ms", .after.as_millis())]
    Timeout {
        stage: ResolutionStage,
        after: Duration,
    },

    #[error("{stage} function failed: {message}")]
    UserFunctionThrew {
        stage: ResolutionStage,
        message: String,
    },
}

impl ResolutionError {
    pub fn stage(&self) -> ResolutionStage {
        match self {
            ResolutionError::Timeout { stage, .. } => *stage,
            ResolutionError::UserFunctionThrew { stage, .. } => *stage,
        }
    }
}

/// Errors produced by target and runner-spec validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{architecture} does not support compute size {compute}")]
    IncompatibleArchCompute {
        architecture: Architecture,
        compute: ComputeSize,
    },

    #[error("timeout {requested} exceeds the {ceiling} ceiling")]
    TimeoutExceedsCeiling {
        requested: BuildTimeout,
        ceiling: BuildTimeout,
    },

    #[error("invalid timeout `{value}`: expected `<integer> minute(s)|hour(s)`")]
    InvalidTimeout { value: String },

    #[error("invalid stage name `{stage}`")]
    InvalidStage { stage: String },
}

/// Errors surfaced by the provisioning engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvisioningError {
    #[error("provider failed to provision runner {key}: {message}")]
    ProviderFailure { key: String, message: String },

    #[error("provider failed to tear down machine {machine}: {message}")]
    TeardownFailure { machine: String, message: String },
}

/// Errors surfaced while running a build job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DispatchError {
    #[error("build failed to start: {message}")]
    StartFailure { message: String },

    #[error("build timed out after {}s", .after.as_secs())]
    TimedOut { after: Duration },

    #[error("build failed remotely: {message}")]
    RemoteFailure { message: String },

    #[error("build was cancelled")]
    Cancelled,
}

/// Autodeploy errors.
#[derive(Debug, thiserror::Error)]
pub enum AutodeployError {
    #[error("normalization error: {0}")]
    Normalization(#[from] NormalizationError),

    #[error("resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("provisioning error: {0}")]
    Provisioning(#[from] ProvisioningError),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("unknown runner: {key}")]
    UnknownRunner { key: String },

    #[error("runner {key} is {state}, not busy")]
    RunnerNotBusy { key: String, state: RunnerState },

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl AutodeployError {
    /// Whether the caller may retry the same event later (with its own back-off).
    ///
    /// Only provider and storage failures qualify; a malformed payload or an
    /// invalid spec will not become valid on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AutodeployError::Provisioning(_) | AutodeployError::Storage(_)
        )
    }
}

/// Result type for Autodeploy operations.
pub type Result<T> = std::result::Result<T, AutodeployError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_error_display_names_stage() {
        let err = ResolutionError::Timeout {
            stage: ResolutionStage::Target,
            after: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "target function timed out after 1500ms");
        assert_eq!(err.stage(), ResolutionStage::Target);

        let err = ResolutionError::UserFunctionThrew {
            stage: ResolutionStage::Runner,
            message: "boom".to_string(),
        };
        assert!(err.to_string().starts_with("runner function failed"));
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::IncompatibleArchCompute {
            architecture: Architecture::Arm64,
            compute: ComputeSize::Medium,
        };
        assert_eq!(err.to_string(), "arm64 does not support compute size medium");
    }

    #[test]
    fn test_retryable_classification() {
        let provisioning: AutodeployError = ProvisioningError::ProviderFailure {
            key: "abc".to_string(),
            message: "throttled".to_string(),
        }
        .into();
        assert!(provisioning.is_retryable());

        let malformed: AutodeployError =
            NormalizationError::malformed("branch", "missing").into();
        assert!(!malformed.is_retryable());

        let validation: AutodeployError = ValidationError::InvalidStage {
            stage: String::new(),
        }
        .into();
        assert!(!validation.is_retryable());
    }

    #[test]
    fn test_dispatch_error_serde_tagged() {
        let err = DispatchError::RemoteFailure {
            message: "exit 1".to_string(),
        };
        let json = serde_json::to_value(&err).expect("serialize");
        assert_eq!(json["kind"], "remote_failure");
    }
}
