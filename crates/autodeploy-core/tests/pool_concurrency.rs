use std::sync::Arc;
use std::time::Duration;

use autodeploy_core::fakes::FakeProvisioner;
use autodeploy_core::{
    Architecture, ComputeSize, RunnerPool, RunnerSpec, RunnerSpecInput, RunnerState,
};
use chrono::{DateTime, Utc};
use runner_state::{MachineId, MemoryRunnerStore};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn pool_with(provisioner: Arc<FakeProvisioner>) -> Arc<RunnerPool> {
    Arc::new(RunnerPool::new(
        Arc::new(MemoryRunnerStore::new()),
        provisioner,
    ))
}

fn arm_large() -> RunnerSpec {
    RunnerSpecInput::default()
        .architecture(Architecture::Arm64)
        .compute(ComputeSize::Large)
        .timeout("20 minutes")
        .canonicalize()
        .expect("valid spec")
}

// ---------------------------------------------------------------------------
// Single provisioning per key
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_acquires_provision_once() {
    let provisioner =
        Arc::new(FakeProvisioner::new().with_delay(Duration::from_millis(50)));
    let pool = pool_with(provisioner.clone());
    let spec = arm_large();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let handle = pool.acquire(&spec).await.expect("acquire");
            tokio::time::sleep(Duration::from_millis(5)).await;
            pool.release(&handle).await.expect("release");
            handle.machine_id
        }));
    }

    let mut machines = Vec::new();
    for task in tasks {
        machines.push(task.await.expect("join"));
    }

    assert_eq!(provisioner.calls(), 1);
    assert!(machines.iter().all(|m| m == &machines[0]));

    let records = pool.records().await.expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, RunnerState::Ready);
    assert_eq!(pool.stats().provisioned, 1);
    assert_eq!(pool.stats().reused, 7);
    assert_eq!(pool.stats().released, 8);
}

#[tokio::test(start_paused = true)]
async fn different_keys_provision_in_parallel() {
    let provisioner =
        Arc::new(FakeProvisioner::new().with_delay(Duration::from_millis(200)));
    let pool = pool_with(provisioner.clone());
    let small = RunnerSpec::default();
    let large = arm_large();
    assert_ne!(small.key(), large.key());

    let started = tokio::time::Instant::now();
    let (a, b) = tokio::join!(pool.acquire(&small), pool.acquire(&large));
    let elapsed = started.elapsed();

    let (a, b) = (a.expect("small"), b.expect("large"));
    assert_ne!(a.machine_id, b.machine_id);
    assert_eq!(provisioner.calls(), 2);
    assert!(
        elapsed < Duration::from_millis(400),
        "provisioning was serialized: {elapsed:?}"
    );
}

// ---------------------------------------------------------------------------
// Busy runners are exclusive
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn busy_runner_is_not_shared_until_released() {
    let provisioner = Arc::new(FakeProvisioner::new());
    let pool = pool_with(provisioner.clone());
    let spec = RunnerSpec::default();

    let first = pool.acquire(&spec).await.expect("first acquire");

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(&spec).await })
    };
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(!waiter.is_finished(), "busy runner was handed out twice");

    pool.release(&first).await.expect("release");
    let second = waiter.await.expect("join").expect("second acquire");

    assert_eq!(second.machine_id, first.machine_id);
    assert_eq!(provisioner.calls(), 1);
    let record = pool.get(&spec.key()).await.expect("get").expect("record");
    assert_eq!(record.state, RunnerState::Busy);
}

#[tokio::test(start_paused = true)]
async fn waiters_survive_provisioning_failure() {
    let provisioner =
        Arc::new(FakeProvisioner::new().with_delay(Duration::from_millis(100)));
    provisioner.fail_next("capacity");
    let pool = pool_with(provisioner.clone());
    let spec = RunnerSpec::default();

    let (first, second) = tokio::join!(pool.acquire(&spec), pool.acquire(&spec));

    // One acquire saw the failure; the other provisioned afterwards.
    assert!(first.is_err() != second.is_err());
    assert_eq!(provisioner.calls(), 2);
    assert_eq!(provisioner.provisioned(), 1);
    let record = pool.get(&spec.key()).await.expect("get").expect("record");
    assert_eq!(record.state, RunnerState::Busy);
}

// ---------------------------------------------------------------------------
// Reaping races acquire
// ---------------------------------------------------------------------------

/// A released runner whose last use is far enough back to be reaped at the
/// returned instant.
async fn idle_runner(pool: &RunnerPool, spec: &RunnerSpec) -> (MachineId, DateTime<Utc>) {
    let handle = pool.acquire(spec).await.expect("acquire");
    pool.release(&handle).await.expect("release");
    let record = pool.get(&spec.key()).await.expect("get").expect("record");
    let past_threshold =
        record.last_used_at + pool.idle_threshold() + chrono::Duration::seconds(1);
    (handle.machine_id, past_threshold)
}

#[tokio::test(start_paused = true)]
async fn reap_in_progress_blocks_acquire_until_torn_down() {
    let provisioner =
        Arc::new(FakeProvisioner::new().with_teardown_delay(Duration::from_secs(5)));
    let pool = pool_with(provisioner.clone());
    let spec = RunnerSpec::default();
    let (old, now) = idle_runner(&pool, &spec).await;

    let (reaped, acquired) = tokio::join!(pool.reap(now), pool.acquire(&spec));
    let reaped = reaped.expect("reap");
    let acquired = acquired.expect("acquire");

    assert_eq!(reaped.retired, vec![spec.key()]);
    assert_eq!(provisioner.torn_down(), vec![old.clone()]);
    assert_ne!(acquired.machine_id, old, "handed out a torn-down machine");
    assert_eq!(provisioner.provisioned(), 2);

    let records = pool.records().await.expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, RunnerState::Busy);
    assert_eq!(records[0].machine_id.as_ref(), Some(&acquired.machine_id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reap_and_acquire_never_double_teardown_or_lose_a_handle() {
    for round in 0..32 {
        let provisioner =
            Arc::new(FakeProvisioner::new().with_teardown_delay(Duration::from_millis(2)));
        let pool = pool_with(provisioner.clone());
        let spec = arm_large();
        let (old, now) = idle_runner(&pool, &spec).await;

        let reap = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.reap(now).await })
        };
        let acquire = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(&spec).await })
        };
        let reaped = reap.await.expect("join").expect("reap");
        let acquired = acquire.await.expect("join").expect("acquire");

        let torn_down = provisioner.torn_down();
        assert!(torn_down.len() <= 1, "round {round}: double teardown");
        if acquired.machine_id == old {
            assert!(torn_down.is_empty(), "round {round}: reused a torn-down machine");
            assert!(reaped.retired.is_empty());
        } else {
            assert_eq!(torn_down, vec![old.clone()], "round {round}");
            assert_eq!(reaped.retired, vec![spec.key()]);
        }

        let records = pool.records().await.expect("records");
        assert_eq!(records.len(), 1, "round {round}");
        assert_eq!(records[0].state, RunnerState::Busy);
        assert_eq!(records[0].machine_id.as_ref(), Some(&acquired.machine_id));
    }
}
