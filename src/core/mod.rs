//! Orchestration logic: the gate, pipeline definitions, and the run
//! journal.

pub mod gate;
pub mod journal;
pub mod pipeline;

pub use gate::{DeployGate, GateError};
pub use journal::Journal;
pub use pipeline::{Pipeline, QueuePolicy};
