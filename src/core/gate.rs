//! The deploy gate: serialize, provision, release.
//!
//! One `run` is the whole contract from queue to journal: wait on the
//! pipeline's lock token, bound the entire acquire-through-release
//! window with a single wall-clock ceiling, invoke the provisioner
//! synchronously once the permit is granted, and guarantee the lock is
//! released on every exit path. Release-on-all-paths leans on the
//! `Permit` guard: if the ceiling expires mid-provision the inner future
//! is dropped and the guard releases as it unwinds.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Result;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::Provisioner;
use crate::domain::{Event, EventType, LockToken, ProvisionBundle, Run, RunState};
use crate::lock::{LockError, LockService, Permit};

use super::journal::Journal;
use super::pipeline::{Pipeline, QueuePolicy};

/// Errors terminating a gated run
#[derive(Debug, Error)]
pub enum GateError {
    #[error("timed out waiting for lock '{token}'")]
    AcquireTimeout { token: String },

    #[error("superseded by a newer run for lock '{token}'")]
    Superseded { token: String },

    #[error("provisioning step failed: {0}")]
    Provision(anyhow::Error),

    #[error(transparent)]
    Lock(LockError),

    #[error("journal failure: {0}")]
    Journal(anyhow::Error),
}

/// The deploy-serialization gate
pub struct DeployGate {
    locks: Arc<dyn LockService>,
    provisioner: Arc<dyn Provisioner>,

    /// Override for the runs directory (tests, embedded use); falls back
    /// to the resolved configuration when unset
    runs_dir: Option<PathBuf>,

    /// Latest queued run per token, for the `latest_wins` queue policy
    latest: Mutex<HashMap<LockToken, watch::Sender<Uuid>>>,
}

impl DeployGate {
    /// Create a gate over the given lock service and provisioner
    pub fn new(locks: Arc<dyn LockService>, provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            locks,
            provisioner,
            runs_dir: None,
            latest: Mutex::new(HashMap::new()),
        }
    }

    /// Journal runs under an explicit directory instead of the resolved
    /// configuration's runs directory
    pub fn with_runs_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runs_dir = Some(dir.into());
        self
    }

    async fn open_journal(&self, run_id: Uuid) -> Result<Journal> {
        match &self.runs_dir {
            Some(dir) => Journal::open_in(dir, run_id).await,
            None => Journal::open(run_id).await,
        }
    }

    /// Execute one gated deployment run.
    ///
    /// Always returns the run with its terminal state recorded; the
    /// `Err` path is reserved for journal/infrastructure failures where
    /// no truthful outcome can be persisted.
    #[instrument(skip(self, pipeline, bundle, git_ref), fields(pipeline = %pipeline.name))]
    pub async fn run(
        &self,
        pipeline: &Pipeline,
        bundle: ProvisionBundle,
        git_ref: Option<String>,
    ) -> Result<Run> {
        pipeline.validate()?;

        let run_id = Uuid::new_v4();
        let token = pipeline.lock_token();
        info!(%run_id, token = %token, "deployment run queued");

        let journal = self.open_journal(run_id).await?;
        let mut run = Run::new(run_id, pipeline.name.clone(), token.clone()).with_git_ref(git_ref);
        run.bundle_fingerprint = Some(bundle.fingerprint());
        journal.save_run(&run).await?;
        journal
            .append(&Event::new(
                run_id,
                EventType::RunQueued,
                format!("queued for lock '{}'", token),
            ))
            .await?;

        let ceiling = pipeline.ceiling();
        let started = Instant::now();

        let outcome = tokio::time::timeout(
            ceiling,
            self.execute(&journal, &mut run, pipeline, &bundle, started),
        )
        .await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(Ok(())) => {
                run.state = RunState::Succeeded;
                journal
                    .append(
                        &Event::new(run_id, EventType::RunSucceeded, "deployment succeeded")
                            .with_duration(elapsed_ms),
                    )
                    .await?;
                info!(%run_id, elapsed_ms, "deployment succeeded");
            }
            Ok(Err(GateError::AcquireTimeout { ref token })) => {
                run.state = RunState::TimedOut;
                journal
                    .append(
                        &Event::new(run_id, EventType::RunTimedOut, "timed out waiting for lock")
                            .with_duration(elapsed_ms)
                            .with_error(format!("lock '{}' not granted within ceiling", token)),
                    )
                    .await?;
                warn!(%run_id, token = %token, "run timed out before acquiring the lock");
            }
            Ok(Err(GateError::Superseded { ref token })) => {
                run.state = RunState::Superseded;
                journal
                    .append(&Event::new(
                        run_id,
                        EventType::RunSuperseded,
                        format!("newer run queued for lock '{}'", token),
                    ))
                    .await?;
                info!(%run_id, token = %token, "run superseded while waiting");
            }
            Ok(Err(e)) => {
                let message = e.to_string();
                run.state = RunState::Failed {
                    error: message.clone(),
                };
                journal
                    .append(
                        &Event::new(run_id, EventType::RunFailed, "deployment failed")
                            .with_duration(elapsed_ms)
                            .with_error(message.clone()),
                    )
                    .await?;
                error!(%run_id, error = %message, "deployment failed");
            }
            Err(_elapsed) => {
                // The inner future was dropped at the ceiling. If it held
                // the permit, the guard released it during unwind.
                if run.lock_acquired && !run.lock_released {
                    run.lock_released = true;
                    journal
                        .append(&Event::new(
                            run_id,
                            EventType::LockReleased,
                            format!("lock '{}' released at ceiling", token),
                        ))
                        .await?;
                }
                run.state = RunState::TimedOut;
                journal
                    .append(
                        &Event::new(run_id, EventType::RunTimedOut, "wall-clock ceiling expired")
                            .with_duration(elapsed_ms)
                            .with_error(format!("ceiling of {}s exceeded", ceiling_secs(pipeline))),
                    )
                    .await?;
                warn!(%run_id, ceiling_seconds = ceiling_secs(pipeline), "run forcibly terminated at ceiling");
            }
        }

        run.completed_at = Some(chrono::Utc::now());
        journal.save_run(&run).await?;
        Ok(run)
    }

    /// Acquire, provision, release. Bounded by the caller's ceiling.
    async fn execute(
        &self,
        journal: &Journal,
        run: &mut Run,
        pipeline: &Pipeline,
        bundle: &ProvisionBundle,
        started: Instant,
    ) -> Result<(), GateError> {
        let token = run.lock_token.clone();
        let ceiling = pipeline.ceiling();

        let permit = self
            .acquire_permit(pipeline, &token, run.id, ceiling)
            .await?;

        run.lock_acquired = true;
        let waited_ms = started.elapsed().as_millis() as u64;
        journal
            .append(
                &Event::new(run.id, EventType::LockAcquired, format!("lock '{}' granted", token))
                    .with_duration(waited_ms),
            )
            .await
            .map_err(GateError::Journal)?;
        info!(run_id = %run.id, token = %token, waited_ms, "lock acquired");

        run.state = RunState::Provisioning;
        journal
            .append(&Event::new(
                run.id,
                EventType::ProvisionStarted,
                format!("invoking '{}' provisioner", self.provisioner.name()),
            ))
            .await
            .map_err(GateError::Journal)?;

        // The provisioner gets whatever is left of the ceiling after the
        // wait; the outer timeout is the backstop either way.
        let budget = ceiling.saturating_sub(started.elapsed());
        let provision_started = Instant::now();
        let result = self.provisioner.provision(bundle, budget).await;
        let duration_ms = provision_started.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok(report) => {
                journal
                    .save_transcript(&report.transcript)
                    .await
                    .map_err(GateError::Journal)?;
                journal
                    .append(
                        &Event::new(
                            run.id,
                            EventType::ProvisionCompleted,
                            "provisioning step succeeded",
                        )
                        .with_duration(duration_ms),
                    )
                    .await
                    .map_err(GateError::Journal)?;
                Ok(())
            }
            Err(e) => {
                journal
                    .append(
                        &Event::new(run.id, EventType::ProvisionFailed, "provisioning step failed")
                            .with_duration(duration_ms)
                            .with_error(e.to_string()),
                    )
                    .await
                    .map_err(GateError::Journal)?;
                Err(GateError::Provision(e))
            }
        };

        permit.release();
        run.lock_released = true;
        journal
            .append(&Event::new(
                run.id,
                EventType::LockReleased,
                format!("lock '{}' released", token),
            ))
            .await
            .map_err(GateError::Journal)?;

        outcome
    }

    async fn acquire_permit(
        &self,
        pipeline: &Pipeline,
        token: &LockToken,
        run_id: Uuid,
        wait: std::time::Duration,
    ) -> Result<Permit, GateError> {
        match pipeline.queue {
            QueuePolicy::Fifo => {
                Permit::acquire(self.locks.clone(), token.clone(), run_id, wait)
                    .await
                    .map_err(|e| map_lock_error(token, e))
            }
            QueuePolicy::LatestWins => {
                let mut rx = self.register_latest(token, run_id);
                tokio::select! {
                    permit = Permit::acquire(self.locks.clone(), token.clone(), run_id, wait) => {
                        permit.map_err(|e| map_lock_error(token, e))
                    }
                    _ = displaced(&mut rx, run_id) => {
                        // The handover may have raced the displacement: a
                        // release could have installed us as holder just as
                        // the acquire future was dropped. Backends treat a
                        // release from a non-holder as a no-op, so this is
                        // safe either way.
                        self.locks.release(token, run_id);
                        Err(GateError::Superseded {
                            token: token.to_string(),
                        })
                    }
                }
            }
        }
    }

    /// Publish this run as the latest queued run for the token and get a
    /// receiver to observe newer arrivals
    fn register_latest(&self, token: &LockToken, run_id: Uuid) -> watch::Receiver<Uuid> {
        let mut latest = self.latest.lock().unwrap();
        let tx = latest
            .entry(token.clone())
            .or_insert_with(|| watch::channel(run_id).0);
        let rx = tx.subscribe();
        let _ = tx.send(run_id);
        rx
    }
}

/// Resolves when a run other than `run_id` becomes the latest queued run
async fn displaced(rx: &mut watch::Receiver<Uuid>, run_id: Uuid) {
    loop {
        if rx.changed().await.is_err() {
            // Sender gone: nobody can displace us anymore
            std::future::pending::<()>().await;
        }
        if *rx.borrow() != run_id {
            return;
        }
    }
}

fn map_lock_error(token: &LockToken, e: LockError) -> GateError {
    match e {
        LockError::WaitTimeout { .. } => GateError::AcquireTimeout {
            token: token.to_string(),
        },
        other => GateError::Lock(other),
    }
}

fn ceiling_secs(pipeline: &Pipeline) -> u64 {
    pipeline.timeout_seconds
}
