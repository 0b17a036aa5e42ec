//! Event types for the run journal.
//!
//! Every state change of a run is recorded as an immutable event in an
//! append-only log, so `status` and `runs` can reconstruct a run long
//! after the process that executed it has exited.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single event in the append-only run journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: Uuid,

    /// Type of event
    pub event_type: EventType,

    /// Human-readable summary (NO secret values, ever)
    pub summary: String,

    /// Time taken in milliseconds (for completed phases)
    pub duration_ms: Option<u64>,

    /// Error message if failed
    pub error: Option<String>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(run_id: Uuid, event_type: EventType, summary: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            event_type,
            summary: summary.into(),
            duration_ms: None,
            error: None,
        }
    }

    /// Attach duration information
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Attach error information
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Types of events that can occur during a gated deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Run created and waiting on the pipeline lock
    RunQueued,

    /// The pipeline lock was granted to this run
    LockAcquired,

    /// The external provisioning step was invoked
    ProvisionStarted,

    /// The external provisioning step reported success
    ProvisionCompleted,

    /// The external provisioning step reported failure
    ProvisionFailed,

    /// The pipeline lock was released by this run
    LockReleased,

    /// Terminal: run succeeded
    RunSucceeded,

    /// Terminal: run failed
    RunFailed,

    /// Terminal: run exceeded the wall-clock ceiling
    RunTimedOut,

    /// Terminal: a newer run for the same token displaced this one
    RunSuperseded,
}
