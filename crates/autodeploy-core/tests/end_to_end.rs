use std::sync::Arc;
use std::time::Duration;

use autodeploy_core::fakes::{FakeProvisioner, ScriptedExecutor};
use autodeploy_core::{
    runner_fn, target_fn, Architecture, Autodeploy, AutodeployConfig, AutodeployError,
    BuildStatus, ComputeSize, DeployOutcome, EventType, GitEvent, IdleReaper, ManualClock,
    NormalizationError, ResolutionError, ResolutionStage, RunnerSpecInput, RunnerState,
    SurrealRunnerStore, Target,
};
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn push_payload(branch: &str) -> Value {
    json!({
        "type": "push",
        "repo": { "id": 1296269, "owner": "octocat", "repo": "Hello-World" },
        "branch": branch,
        "commit": {
            "id": "b7e7c4c559e0e5b4bc6f8d98e0e5e5e5e5e5e5e5",
            "message": "Update the README with new information"
        },
        "sender": { "id": 1, "username": "octocat" }
    })
}

fn pull_request_payload(number: u64) -> Value {
    json!({
        "type": "pull_request",
        "repo": { "id": 1296269, "owner": "octocat", "repo": "Hello-World" },
        "number": number,
        "base": "main",
        "head": "changes",
        "commit": {
            "id": "b7e7c4c559e0e5b4bc6f8d98e0e5e5e5e5e5e5e5",
            "message": "Update the README with new information"
        },
        "sender": { "id": 1, "username": "octocat" }
    })
}

/// The canonical example: main deploys to production, every PR to its own stage.
fn production_and_previews() -> Arc<dyn autodeploy_core::TargetFn> {
    target_fn(|event| async move {
        Ok(match event {
            GitEvent::Push(push) if push.branch == "main" => Some(Target::new("production")),
            GitEvent::PullRequest(pr) => Some(Target::new(format!("pr-{}", pr.number))),
            _ => None,
        })
    })
}

fn built(outcome: DeployOutcome) -> autodeploy_core::BuildJob {
    match outcome {
        DeployOutcome::Built(job) => job,
        other => panic!("expected a build, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[tokio::test]
async fn push_to_main_deploys_to_production() {
    let executor = Arc::new(ScriptedExecutor::succeeding());
    let autodeploy = Autodeploy::builder()
        .target_fn(production_and_previews())
        .provisioner(Arc::new(FakeProvisioner::new()))
        .executor(executor.clone())
        .build()
        .expect("build");

    let outcome = autodeploy
        .handle_webhook(&push_payload("main"), Some("push"))
        .await
        .expect("handle");
    let job = built(outcome);

    assert_eq!(job.target.stage, "production");
    assert_eq!(job.status, BuildStatus::Succeeded);

    let request = &executor.requests()[0];
    let source = request.source.as_ref().expect("source");
    assert_eq!(source.repo, "octocat/Hello-World");
    assert_eq!(source.reference, "main");
}

#[tokio::test]
async fn pull_request_deploys_to_numbered_stage() {
    let autodeploy = Autodeploy::builder()
        .target_fn(production_and_previews())
        .provisioner(Arc::new(FakeProvisioner::new()))
        .executor(Arc::new(ScriptedExecutor::succeeding()))
        .build()
        .expect("build");

    let job = built(
        autodeploy
            .handle_webhook(&pull_request_payload(42), Some("pull_request"))
            .await
            .expect("handle"),
    );
    assert_eq!(job.target.stage, "pr-42");
}

#[tokio::test]
async fn event_without_target_is_skipped_and_provisions_nothing() {
    let provisioner = Arc::new(FakeProvisioner::new());
    let autodeploy = Autodeploy::builder()
        .target_fn(production_and_previews())
        .provisioner(provisioner.clone())
        .executor(Arc::new(ScriptedExecutor::succeeding()))
        .build()
        .expect("build");

    let outcome = autodeploy
        .handle_webhook(&push_payload("dev"), Some("push"))
        .await
        .expect("handle");

    assert_eq!(
        outcome,
        DeployOutcome::Skipped {
            event_type: EventType::Push
        }
    );
    assert_eq!(provisioner.calls(), 0);
}

#[tokio::test]
async fn runners_are_reused_across_events_and_chosen_per_stage() {
    let provisioner = Arc::new(FakeProvisioner::new());
    let autodeploy = Autodeploy::builder()
        .target_fn(production_and_previews())
        .runner_fn(runner_fn(|input| async move {
            Ok(if input.stage == "production" {
                RunnerSpecInput::default()
                    .architecture(Architecture::Arm64)
                    .compute(ComputeSize::Large)
                    .timeout("20 minutes")
            } else {
                RunnerSpecInput::default()
            })
        }))
        .provisioner(provisioner.clone())
        .executor(Arc::new(ScriptedExecutor::succeeding()))
        .build()
        .expect("build");

    let first = built(autodeploy.handle_webhook(&push_payload("main"), None).await.expect("1"));
    let second = built(autodeploy.handle_webhook(&push_payload("main"), None).await.expect("2"));
    let preview = built(
        autodeploy
            .handle_webhook(&pull_request_payload(7), None)
            .await
            .expect("3"),
    );

    assert_eq!(first.runner, second.runner);
    assert_ne!(first.runner.key, preview.runner.key);
    assert_eq!(provisioner.provisioned(), 2);

    let records = autodeploy.pool().records().await.expect("records");
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.state == RunnerState::Ready));
    assert!(records
        .iter()
        .any(|r| r.descriptor == "codebuild/arm64/large/20 minutes"));
}

#[tokio::test]
async fn plan_resolves_without_side_effects() {
    let provisioner = Arc::new(FakeProvisioner::new());
    let autodeploy = Autodeploy::builder()
        .target_fn(production_and_previews())
        .provisioner(provisioner.clone())
        .executor(Arc::new(ScriptedExecutor::succeeding()))
        .build()
        .expect("build");

    let event = autodeploy_core::EventNormalizer::normalize(&push_payload("main"), None)
        .expect("normalize");
    let plan = autodeploy.plan(&event).await.expect("plan").expect("target");

    assert_eq!(plan.target.stage, "production");
    assert_eq!(plan.descriptor, "codebuild/x86_64/small/1 hour");
    assert_eq!(plan.runner_key, plan.spec.key());
    assert_eq!(provisioner.calls(), 0);
}

// ---------------------------------------------------------------------------
// Errors stay with their event
// ---------------------------------------------------------------------------

#[tokio::test]
async fn malformed_payload_is_reported_with_field() {
    let autodeploy = Autodeploy::builder()
        .target_fn(production_and_previews())
        .provisioner(Arc::new(FakeProvisioner::new()))
        .executor(Arc::new(ScriptedExecutor::succeeding()))
        .build()
        .expect("build");

    let mut payload = push_payload("main");
    payload["commit"].as_object_mut().expect("object").remove("id");

    let err = autodeploy
        .handle_webhook(&payload, Some("push"))
        .await
        .unwrap_err();
    assert!(!err.is_retryable());
    match err {
        AutodeployError::Normalization(NormalizationError::MalformedPayload { field, .. }) => {
            assert_eq!(field, "commit.id");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn throwing_target_fn_does_not_affect_other_deliveries() {
    let autodeploy = Arc::new(
        Autodeploy::builder()
            .target_fn(target_fn(|event| async move {
                match event {
                    GitEvent::Push(push) if push.branch == "explode" => {
                        Err(anyhow::anyhow!("cannot route {}", push.branch))
                    }
                    _ => Ok(Some(Target::new("production"))),
                }
            }))
            .provisioner(Arc::new(FakeProvisioner::new()))
            .executor(Arc::new(
                ScriptedExecutor::succeeding().with_delay(Duration::from_millis(10)),
            ))
            .build()
            .expect("build"),
    );

    let bad = autodeploy.spawn_delivery(push_payload("explode"), Some("push".to_string()));
    let good = autodeploy.spawn_delivery(push_payload("main"), Some("push".to_string()));

    let bad = bad.await.expect("join").unwrap_err();
    assert!(matches!(
        bad,
        AutodeployError::Resolution(ResolutionError::UserFunctionThrew {
            stage: ResolutionStage::Target,
            ..
        })
    ));
    let good = good.await.expect("join").expect("good delivery");
    assert_eq!(built(good).status, BuildStatus::Succeeded);
}

#[tokio::test]
async fn incompatible_runner_spec_fails_before_provisioning() {
    let provisioner = Arc::new(FakeProvisioner::new());
    let autodeploy = Autodeploy::builder()
        .target_fn(production_and_previews())
        .runner_fn(runner_fn(|_| async {
            Ok(RunnerSpecInput::default()
                .architecture(Architecture::Arm64)
                .compute(ComputeSize::Xlarge))
        }))
        .provisioner(provisioner.clone())
        .executor(Arc::new(ScriptedExecutor::succeeding()))
        .build()
        .expect("build");

    let err = autodeploy
        .handle_webhook(&push_payload("main"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, AutodeployError::Validation(_)));
    assert_eq!(provisioner.calls(), 0);
}

// ---------------------------------------------------------------------------
// Configuration-driven, persistent store, idle expiry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn configured_rules_with_surreal_store_and_reaper() {
    let config = AutodeployConfig::from_toml(
        r#"
idle_threshold_days = 7

[[rules]]
event = "push"
branch = "main"
stage = "production"

[[rules]]
event = "pull_request"
stage = "pr-{number}"

[runners.production]
architecture = "arm64"
compute = "large"
"#,
    )
    .expect("config");
    config.validate().expect("valid");

    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap(),
    ));
    let provisioner = Arc::new(FakeProvisioner::new());
    let store = Arc::new(SurrealRunnerStore::in_memory().await.expect("store"));
    let autodeploy = Autodeploy::builder()
        .config(&config)
        .expect("rules")
        .provisioner(provisioner.clone())
        .executor(Arc::new(ScriptedExecutor::succeeding()))
        .store(store)
        .clock(clock.clone())
        .build()
        .expect("build");

    let job = built(
        autodeploy
            .handle_webhook(&pull_request_payload(42), None)
            .await
            .expect("pr"),
    );
    assert_eq!(job.target.stage, "pr-42");
    let job = built(autodeploy.handle_webhook(&push_payload("main"), None).await.expect("main"));
    assert_eq!(job.target.stage, "production");
    assert_eq!(autodeploy.pool().records().await.expect("records").len(), 2);

    let reaper = IdleReaper::new(autodeploy.pool().clone(), Duration::from_secs(3600));
    clock.advance(chrono::Duration::days(7));
    assert!(reaper.sweep_once().await.expect("sweep").is_empty());

    clock.advance(chrono::Duration::seconds(1));
    let report = reaper.sweep_once().await.expect("sweep");
    assert_eq!(report.retired.len(), 2);
    assert_eq!(provisioner.torn_down().len(), 2);
    assert!(autodeploy.pool().records().await.expect("records").is_empty());
}
