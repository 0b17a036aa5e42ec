//! deploygate - serialize deployments behind a named lock
//!
//! A small orchestrator that ensures at most one deployment run proceeds
//! at a time per pipeline, then hands off to an external provisioning
//! step with a fixed configuration bundle.
//!
//! # Architecture
//!
//! The gate is the only coordination point:
//! - A run acquires a per-pipeline lock before anything touches the host
//! - The whole acquire-through-release window is bounded by one ceiling
//! - The lock is released exactly once on every exit path
//! - Every state change is journaled for later inspection
//!
//! # Modules
//!
//! - `adapters`: provisioning backends (playbook runner, local filesystem)
//! - `core`: the gate, pipeline definitions, run journal
//! - `domain`: data structures (Run, Event, LockToken, ProvisionBundle)
//! - `lock`: lock service abstraction and backends
//! - `cli`: command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run a gated deployment
//! deploygate deploy production --ref refs/heads/main
//!
//! # Check a run
//! deploygate status <run-id>
//!
//! # Clear a lock left by a dead runner
//! deploygate unlock production --force
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod lock;

// Re-export main types at crate root for convenience
pub use crate::core::{DeployGate, GateError, Journal, Pipeline, QueuePolicy};
pub use adapters::{LocalProvisioner, PlaybookProvisioner, ProvisionReport, Provisioner};
pub use domain::{Event, EventType, LockToken, ProvisionBundle, Run, RunState};
pub use lock::{FileLockService, LockError, LockService, MemoryLockService, Permit};
