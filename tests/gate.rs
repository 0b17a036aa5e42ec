//! Gate serialization integration tests.
//!
//! Covers the core contract: mutual exclusion per lock token, FIFO
//! handover, release exactly once on every exit path, and the
//! latest-wins queue policy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;

use deploygate::{
    DeployGate, EventType, Journal, MemoryLockService, Pipeline, ProvisionBundle, ProvisionReport,
    Provisioner, RunState,
};

/// Provisioner stub that tracks how many runs are inside it at once
struct TrackingProvisioner {
    active: AtomicUsize,
    max_active: AtomicUsize,
    invocations: AtomicUsize,
    hold: Duration,
    fail: bool,
}

impl TrackingProvisioner {
    fn new(hold: Duration) -> Self {
        Self {
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            invocations: AtomicUsize::new(0),
            hold,
            fail: false,
        }
    }

    fn failing(hold: Duration) -> Self {
        Self {
            fail: true,
            ..Self::new(hold)
        }
    }

    fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provisioner for TrackingProvisioner {
    fn name(&self) -> &str {
        "tracking"
    }

    async fn provision(
        &self,
        _bundle: &ProvisionBundle,
        _timeout: Duration,
    ) -> Result<ProvisionReport> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        tokio::time::sleep(self.hold).await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("provisioning step failed on purpose");
        }
        Ok(ProvisionReport::new("ok\n".to_string()))
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

fn pipeline(name: &str, timeout_seconds: u64, queue: &str) -> Pipeline {
    Pipeline::from_yaml(&format!(
        r#"
name: {}
playbook: deploy/site.yml
inventory: deploy/inventory.ini
timeout_seconds: {}
queue: {}
"#,
        name, timeout_seconds, queue
    ))
    .unwrap()
}

fn bundle() -> ProvisionBundle {
    ProvisionBundle::new("deploy/site.yml", "deploy/inventory.ini")
}

#[tokio::test]
async fn test_overlapping_runs_never_provision_concurrently() {
    let temp = TempDir::new().unwrap();
    let provisioner = Arc::new(TrackingProvisioner::new(Duration::from_millis(100)));
    let gate = Arc::new(
        DeployGate::new(Arc::new(MemoryLockService::new()), provisioner.clone())
            .with_runs_dir(temp.path()),
    );

    let mut handles = Vec::new();
    for _ in 0..4 {
        let gate = gate.clone();
        let pipeline = pipeline("production", 10, "fifo");
        handles.push(tokio::spawn(async move {
            gate.run(&pipeline, bundle(), None).await.unwrap()
        }));
    }

    for handle in handles {
        let run = handle.await.unwrap();
        assert_eq!(run.state, RunState::Succeeded);
    }

    assert_eq!(provisioner.invocations(), 4);
    assert_eq!(provisioner.max_active(), 1, "two runs overlapped inside the provisioner");
}

#[tokio::test]
async fn test_distinct_tokens_run_in_parallel() {
    let temp = TempDir::new().unwrap();
    let provisioner = Arc::new(TrackingProvisioner::new(Duration::from_millis(150)));
    let gate = Arc::new(
        DeployGate::new(Arc::new(MemoryLockService::new()), provisioner.clone())
            .with_runs_dir(temp.path()),
    );

    let gate_a = gate.clone();
    let a = tokio::spawn(async move {
        gate_a
            .run(&pipeline("staging", 10, "fifo"), bundle(), None)
            .await
            .unwrap()
    });
    let gate_b = gate.clone();
    let b = tokio::spawn(async move {
        gate_b
            .run(&pipeline("production", 10, "fifo"), bundle(), None)
            .await
            .unwrap()
    });

    assert_eq!(a.await.unwrap().state, RunState::Succeeded);
    assert_eq!(b.await.unwrap().state, RunState::Succeeded);

    // Different tokens do not serialize against each other
    assert_eq!(provisioner.max_active(), 2);
}

#[tokio::test]
async fn test_waiting_run_starts_only_after_holder_releases() {
    let temp = TempDir::new().unwrap();
    let provisioner = Arc::new(TrackingProvisioner::new(Duration::from_millis(150)));
    let gate = Arc::new(
        DeployGate::new(Arc::new(MemoryLockService::new()), provisioner.clone())
            .with_runs_dir(temp.path()),
    );

    let gate1 = gate.clone();
    let r1 = tokio::spawn(async move {
        gate1
            .run(&pipeline("production", 10, "fifo"), bundle(), None)
            .await
            .unwrap()
    });

    // Let R1 take the lock before queueing R2
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(provisioner.invocations(), 1);

    let gate2 = gate.clone();
    let r2 = tokio::spawn(async move {
        gate2
            .run(&pipeline("production", 10, "fifo"), bundle(), None)
            .await
            .unwrap()
    });

    let r1 = r1.await.unwrap();
    let r2 = r2.await.unwrap();

    assert_eq!(r1.state, RunState::Succeeded);
    assert_eq!(r2.state, RunState::Succeeded);
    assert_eq!(provisioner.max_active(), 1);
    assert_eq!(provisioner.invocations(), 2);
}

#[tokio::test]
async fn test_provision_failure_still_releases_exactly_once() {
    let temp = TempDir::new().unwrap();
    let provisioner = Arc::new(TrackingProvisioner::failing(Duration::from_millis(20)));
    let locks = Arc::new(MemoryLockService::new());
    let gate = DeployGate::new(locks.clone(), provisioner.clone()).with_runs_dir(temp.path());

    let run = gate
        .run(&pipeline("production", 10, "fifo"), bundle(), None)
        .await
        .unwrap();

    assert!(matches!(run.state, RunState::Failed { .. }));
    assert!(run.lock_acquired);
    assert!(run.lock_released);
    assert!(!locks.is_held(&run.lock_token));

    // Exactly one release in the journal
    let journal = Journal::open_in(temp.path(), run.id).await.unwrap();
    let events = journal.replay().await.unwrap();
    let releases = events
        .iter()
        .filter(|e| e.event_type == EventType::LockReleased)
        .count();
    assert_eq!(releases, 1);

    // The failure is propagated verbatim from the provisioner
    let failure = events
        .iter()
        .find(|e| e.event_type == EventType::ProvisionFailed)
        .unwrap();
    assert!(failure
        .error
        .as_deref()
        .unwrap()
        .contains("provisioning step failed on purpose"));

    // And the lock is immediately grantable again
    let run2 = gate
        .run(&pipeline("production", 10, "fifo"), bundle(), None)
        .await
        .unwrap();
    assert!(run2.lock_acquired);
}

#[tokio::test]
async fn test_latest_wins_supersedes_waiting_run() {
    let temp = TempDir::new().unwrap();
    let provisioner = Arc::new(TrackingProvisioner::new(Duration::from_millis(300)));
    let gate = Arc::new(
        DeployGate::new(Arc::new(MemoryLockService::new()), provisioner.clone())
            .with_runs_dir(temp.path()),
    );

    // R1 takes the lock and provisions slowly
    let gate1 = gate.clone();
    let r1 = tokio::spawn(async move {
        gate1
            .run(&pipeline("staging", 10, "latest_wins"), bundle(), None)
            .await
            .unwrap()
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // R2 queues behind R1
    let gate2 = gate.clone();
    let r2 = tokio::spawn(async move {
        gate2
            .run(&pipeline("staging", 10, "latest_wins"), bundle(), None)
            .await
            .unwrap()
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // R3 arrives and displaces R2 from the queue
    let gate3 = gate.clone();
    let r3 = tokio::spawn(async move {
        gate3
            .run(&pipeline("staging", 10, "latest_wins"), bundle(), None)
            .await
            .unwrap()
    });

    let r1 = r1.await.unwrap();
    let r2 = r2.await.unwrap();
    let r3 = r3.await.unwrap();

    assert_eq!(r1.state, RunState::Succeeded);
    assert_eq!(r2.state, RunState::Superseded);
    assert_eq!(r3.state, RunState::Succeeded);

    // The superseded run never reached the provisioner
    assert_eq!(provisioner.invocations(), 2);
    assert!(!r2.lock_acquired);
}
