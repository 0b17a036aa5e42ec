//! Run state, lock tokens, and reconstruction from journal events.
//!
//! A Run is one invocation of the deploy gate: queue, acquire, provision,
//! release, terminal outcome.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::{Event, EventType};

/// Key identifying a serialization domain, e.g. one per deployment
/// pipeline. Not an owned resource: it is never created or destroyed,
/// only used to coordinate independent runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockToken(String);

impl LockToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LockToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One end-to-end execution of the deploy gate plus provisioning step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Unique identifier for this run
    pub id: Uuid,

    /// Name of the pipeline being deployed
    pub pipeline_name: String,

    /// Lock token serializing this run against its siblings
    pub lock_token: LockToken,

    /// Git ref that triggered the run, if known
    pub git_ref: Option<String>,

    /// Current state of the run
    pub state: RunState,

    /// When the run was queued
    pub started_at: DateTime<Utc>,

    /// When the run reached a terminal state (if it has)
    pub completed_at: Option<DateTime<Utc>>,

    /// Whether this run ever held the lock
    pub lock_acquired: bool,

    /// Whether this run released the lock
    pub lock_released: bool,

    /// Fingerprint of the provision bundle (paths + secret names, no values)
    pub bundle_fingerprint: Option<String>,
}

impl Run {
    /// Create a new run, queued and waiting on the lock
    pub fn new(id: Uuid, pipeline_name: String, lock_token: LockToken) -> Self {
        Self {
            id,
            pipeline_name,
            lock_token,
            git_ref: None,
            state: RunState::Waiting,
            started_at: Utc::now(),
            completed_at: None,
            lock_acquired: false,
            lock_released: false,
            bundle_fingerprint: None,
        }
    }

    pub fn with_git_ref(mut self, git_ref: Option<String>) -> Self {
        self.git_ref = git_ref;
        self
    }

    /// Reconstruct run state from a sequence of journal events
    pub fn from_events(pipeline_name: &str, token: LockToken, events: &[Event]) -> Option<Self> {
        let first = events.first()?;

        let mut run = Self {
            id: first.run_id,
            pipeline_name: pipeline_name.to_string(),
            lock_token: token,
            git_ref: None,
            state: RunState::Waiting,
            started_at: first.timestamp,
            completed_at: None,
            lock_acquired: false,
            lock_released: false,
            bundle_fingerprint: None,
        };

        for event in events {
            run.apply_event(event);
        }

        Some(run)
    }

    /// Apply a single journal event to update run state
    pub fn apply_event(&mut self, event: &Event) {
        match event.event_type {
            EventType::RunQueued => {
                self.state = RunState::Waiting;
                self.started_at = event.timestamp;
            }
            EventType::LockAcquired => {
                self.lock_acquired = true;
            }
            EventType::ProvisionStarted => {
                self.state = RunState::Provisioning;
            }
            EventType::ProvisionCompleted | EventType::ProvisionFailed => {}
            EventType::LockReleased => {
                self.lock_released = true;
            }
            EventType::RunSucceeded => {
                self.state = RunState::Succeeded;
                self.completed_at = Some(event.timestamp);
            }
            EventType::RunFailed => {
                self.state = RunState::Failed {
                    error: event.error.clone().unwrap_or_default(),
                };
                self.completed_at = Some(event.timestamp);
            }
            EventType::RunTimedOut => {
                self.state = RunState::TimedOut;
                self.completed_at = Some(event.timestamp);
            }
            EventType::RunSuperseded => {
                self.state = RunState::Superseded;
                self.completed_at = Some(event.timestamp);
            }
        }
    }

    /// Check if the run has reached a terminal state
    pub fn is_finished(&self) -> bool {
        !matches!(self.state, RunState::Waiting | RunState::Provisioning)
    }

    /// Check if the run succeeded
    pub fn succeeded(&self) -> bool {
        self.state == RunState::Succeeded
    }
}

/// State of a deployment run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunState {
    /// Queued, waiting for the pipeline lock
    Waiting,

    /// Holding the lock, provisioning step in flight
    Provisioning,

    /// Provisioning step reported success
    Succeeded,

    /// Provisioning step failed or the lock backend errored
    Failed { error: String },

    /// The wall-clock ceiling expired before completion
    TimedOut,

    /// A newer run for the same token displaced this one while it waited
    Superseded,
}

impl Default for RunState {
    fn default() -> Self {
        Self::Waiting
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_creation() {
        let run_id = Uuid::new_v4();
        let run = Run::new(run_id, "production".to_string(), LockToken::from("production"));

        assert_eq!(run.id, run_id);
        assert_eq!(run.state, RunState::Waiting);
        assert!(!run.is_finished());
        assert!(!run.lock_acquired);
    }

    #[test]
    fn test_run_from_events_success_path() {
        let run_id = Uuid::new_v4();
        let events = vec![
            Event::new(run_id, EventType::RunQueued, "queued"),
            Event::new(run_id, EventType::LockAcquired, "lock granted"),
            Event::new(run_id, EventType::ProvisionStarted, "provisioning"),
            Event::new(run_id, EventType::ProvisionCompleted, "provisioned"),
            Event::new(run_id, EventType::LockReleased, "lock released"),
            Event::new(run_id, EventType::RunSucceeded, "done"),
        ];

        let run = Run::from_events("production", LockToken::from("production"), &events).unwrap();

        assert_eq!(run.id, run_id);
        assert_eq!(run.state, RunState::Succeeded);
        assert!(run.lock_acquired);
        assert!(run.lock_released);
        assert!(run.is_finished());
    }

    #[test]
    fn test_run_from_events_timeout_before_acquire() {
        let run_id = Uuid::new_v4();
        let events = vec![
            Event::new(run_id, EventType::RunQueued, "queued"),
            Event::new(run_id, EventType::RunTimedOut, "ceiling expired"),
        ];

        let run = Run::from_events("staging", LockToken::from("staging"), &events).unwrap();

        assert_eq!(run.state, RunState::TimedOut);
        assert!(!run.lock_acquired);
        assert!(run.completed_at.is_some());
    }

    #[test]
    fn test_run_from_events_failure_carries_error() {
        let run_id = Uuid::new_v4();
        let events = vec![
            Event::new(run_id, EventType::RunQueued, "queued"),
            Event::new(run_id, EventType::LockAcquired, "lock granted"),
            Event::new(run_id, EventType::RunFailed, "failed").with_error("exit code 2"),
        ];

        let run = Run::from_events("production", LockToken::from("production"), &events).unwrap();

        assert_eq!(
            run.state,
            RunState::Failed {
                error: "exit code 2".to_string()
            }
        );
    }
}
