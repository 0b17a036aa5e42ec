//! Data structures for the deploy gate.
//!
//! - `events`: append-only journal records for a run
//! - `run`: run state, lock tokens, reconstruction from events
//! - `bundle`: the opaque configuration bundle handed to the provisioner

pub mod bundle;
pub mod events;
pub mod run;

pub use bundle::ProvisionBundle;
pub use events::{Event, EventType};
pub use run::{LockToken, Run, RunState};
