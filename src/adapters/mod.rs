//! Provisioner interfaces for the external deployment step.
//!
//! The gate treats provisioning as an opaque collaborator: it passes a
//! fixed bundle through, enforces a timeout, and reports the outcome
//! verbatim. Two implementations: `PlaybookProvisioner` shells out to an
//! Ansible-style playbook runner; `LocalProvisioner` applies the
//! deployment's filesystem effects directly for tests and single-host use.

pub mod local;
pub mod playbook;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::domain::ProvisionBundle;

pub use local::LocalProvisioner;
pub use playbook::PlaybookProvisioner;

/// Outcome of a successful provisioning step
#[derive(Debug, Clone)]
pub struct ProvisionReport {
    /// Combined output of the provisioning step (stdout + stderr, or
    /// task-by-task lines for the local provisioner)
    pub transcript: String,
}

impl ProvisionReport {
    pub fn new(transcript: String) -> Self {
        Self { transcript }
    }
}

/// Trait for external provisioning backends
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Human-readable provisioner name
    fn name(&self) -> &str;

    /// Execute the provisioning step with the given bundle.
    ///
    /// Implementations must respect `timeout` and terminate any external
    /// work they started when it expires. Failures are propagated
    /// verbatim; the gate never retries.
    async fn provision(&self, bundle: &ProvisionBundle, timeout: Duration)
        -> Result<ProvisionReport>;

    /// Verify the backend is usable before a deploy is attempted
    async fn health_check(&self) -> Result<()>;
}
