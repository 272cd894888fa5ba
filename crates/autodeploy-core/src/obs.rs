//! Structured observability hooks for the deploy pipeline.
//!
//! - `build_span`: span tagging everything logged during one build
//! - `emit_*`: lifecycle events with stable `event = "..."` names
//!
//! Events are emitted at `info!` level (filter with `AUTODEPLOY_LOG`);
//! failures at `warn!`.

use runner_state::{MachineId, RunnerKey};
use tracing::{info, warn};
use uuid::Uuid;

use crate::dispatch::RemoteBuildId;
use crate::domain::{BuildStatus, DispatchError, EventType, GitEvent};

/// Span for one build job. Attach with `Instrument::instrument`; async code
/// must not hold an entered span across awaits.
pub fn build_span(job_id: &Uuid, stage: &str, key: &RunnerKey) -> tracing::Span {
    tracing::info_span!("autodeploy.build", job_id = %job_id, stage = %stage, runner = %key.short())
}

/// Span for one webhook delivery.
pub fn delivery_span(hint: Option<&str>) -> tracing::Span {
    tracing::info_span!("autodeploy.delivery", event_type = hint.unwrap_or("-"))
}

pub fn emit_event_received(event: &GitEvent) {
    info!(
        event = "event.received",
        event_type = %event.event_type(),
        repo = %event.repo().full_name(),
        commit = %event.commit().short_id(),
        sender = %event.sender().username,
    );
}

pub fn emit_event_skipped(event_type: EventType) {
    info!(event = "event.skipped", event_type = %event_type);
}

pub fn emit_event_failed(error: &dyn std::fmt::Display, retryable: bool) {
    warn!(event = "event.failed", error = %error, retryable = retryable);
}

pub fn emit_runner_acquired(key: &RunnerKey, machine: &MachineId, provisioned: bool) {
    info!(
        event = "runner.acquired",
        runner = %key.short(),
        machine = %machine,
        provisioned = provisioned,
    );
}

pub fn emit_runner_released(key: &RunnerKey, machine: &MachineId) {
    info!(event = "runner.released", runner = %key.short(), machine = %machine);
}

pub fn emit_runner_retired(key: &RunnerKey, machine: Option<&MachineId>) {
    info!(
        event = "runner.retired",
        runner = %key.short(),
        machine = machine.map(|m| m.0.as_str()).unwrap_or("-"),
    );
}

pub fn emit_provisioning_failed(key: &RunnerKey, error: &dyn std::fmt::Display) {
    warn!(event = "runner.provisioning_failed", runner = %key.short(), error = %error);
}

pub fn emit_teardown_failed(key: &RunnerKey, error: &dyn std::fmt::Display) {
    warn!(event = "runner.teardown_failed", runner = %key.short(), error = %error);
}

pub fn emit_build_started(job_id: &Uuid, remote: &RemoteBuildId) {
    info!(event = "build.started", job_id = %job_id, remote_build = %remote);
}

/// Build reached a terminal status.
pub fn emit_build_finished(
    job_id: &Uuid,
    status: BuildStatus,
    duration_ms: u64,
    failure: Option<&DispatchError>,
) {
    match failure {
        None => info!(
            event = "build.finished",
            job_id = %job_id,
            status = %status,
            duration_ms = duration_ms,
        ),
        Some(failure) => warn!(
            event = "build.finished",
            job_id = %job_id,
            status = %status,
            duration_ms = duration_ms,
            error = %failure,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_span_create() {
        let key = RunnerKey::from_canonical(b"spec");
        let span = build_span(&Uuid::new_v4(), "production", &key);
        let _entered = span.enter();
        emit_build_started(&Uuid::new_v4(), &RemoteBuildId("build-1".to_string()));
    }
}
