//! Build job lifecycle.
//!
//! A job moves `Queued → Running → {Succeeded | Failed | TimedOut | Cancelled}`
//! (or straight from `Queued` to `Failed`/`Cancelled`). Once terminal it is
//! frozen: further transitions are rejected.

use chrono::{DateTime, Utc};
use runner_state::{MachineId, RunnerKey};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::DispatchError;
use super::target::Target;

/// Status of a build job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BuildStatus::Queued | BuildStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Queued => "queued",
            BuildStatus::Running => "running",
            BuildStatus::Succeeded => "succeeded",
            BuildStatus::Failed => "failed",
            BuildStatus::TimedOut => "timed_out",
            BuildStatus::Cancelled => "cancelled",
        }
    }

    fn can_transition_to(&self, next: BuildStatus) -> bool {
        match self {
            BuildStatus::Queued => matches!(
                next,
                BuildStatus::Running | BuildStatus::Failed | BuildStatus::Cancelled
            ),
            BuildStatus::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected status change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid build status transition: {current} -> {requested}")]
pub struct InvalidTransition {
    pub current: BuildStatus,
    pub requested: BuildStatus,
}

/// Runner a job executed on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerRef {
    pub key: RunnerKey,
    pub machine_id: MachineId,
}

/// One build of a target on a runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildJob {
    pub id: Uuid,
    pub target: Target,
    pub runner: RunnerRef,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: BuildStatus,
    pub failure: Option<DispatchError>,
}

impl BuildJob {
    pub fn queued(target: Target, runner: RunnerRef, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            target,
            runner,
            started_at: now,
            finished_at: None,
            status: BuildStatus::Queued,
            failure: None,
        }
    }

    pub fn start(&mut self) -> Result<(), InvalidTransition> {
        self.transition(BuildStatus::Running)
    }

    pub fn succeed(&mut self, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.finish(BuildStatus::Succeeded, None, now)
    }

    /// Record a terminal status and the error behind it (if any).
    pub fn finish(
        &mut self,
        status: BuildStatus,
        failure: Option<DispatchError>,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        if !status.is_terminal() {
            return Err(InvalidTransition {
                current: self.status,
                requested: status,
            });
        }
        self.transition(status)?;
        self.failure = failure;
        self.finished_at = Some(now);
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock duration, once finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|end| end - self.started_at)
    }

    fn transition(&mut self, next: BuildStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                current: self.status,
                requested: next,
            });
        }
        self.status = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> BuildJob {
        BuildJob::queued(
            Target::new("production"),
            RunnerRef {
                key: RunnerKey::from_canonical(b"spec"),
                machine_id: MachineId("cb-1".to_string()),
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_happy_path() {
        let mut job = job();
        assert_eq!(job.status, BuildStatus::Queued);
        job.start().unwrap();
        job.succeed(Utc::now()).unwrap();
        assert_eq!(job.status, BuildStatus::Succeeded);
        assert!(job.is_finished());
        assert!(job.duration().is_some());
    }

    #[test]
    fn test_terminal_status_is_written_once() {
        let mut job = job();
        job.start().unwrap();
        job.finish(
            BuildStatus::TimedOut,
            Some(DispatchError::TimedOut {
                after: std::time::Duration::from_secs(60),
            }),
            Utc::now(),
        )
        .unwrap();

        let err = job.succeed(Utc::now()).unwrap_err();
        assert_eq!(err.current, BuildStatus::TimedOut);
        assert_eq!(job.status, BuildStatus::TimedOut);
    }

    #[test]
    fn test_start_failure_goes_straight_to_failed() {
        let mut job = job();
        job.finish(
            BuildStatus::Failed,
            Some(DispatchError::StartFailure {
                message: "no capacity".to_string(),
            }),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(job.status, BuildStatus::Failed);
    }

    #[test]
    fn test_cannot_time_out_before_running() {
        let mut job = job();
        assert!(job.finish(BuildStatus::TimedOut, None, Utc::now()).is_err());
        assert!(job.finish(BuildStatus::Running, None, Utc::now()).is_err());
    }

    #[test]
    fn test_status_serde_names() {
        let json = serde_json::to_string(&BuildStatus::TimedOut).unwrap();
        assert_eq!(json, r#""timed_out""#);
    }
}
