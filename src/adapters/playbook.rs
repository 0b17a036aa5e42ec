//! Playbook provisioner: shells out to `ansible-playbook`.
//!
//! Spawns `ansible-playbook -i <inventory> <playbook>` with the bundle's
//! secrets exported as environment variables, collects the output, and
//! surfaces a non-zero exit verbatim. The child is killed if the timeout
//! expires or the calling future is dropped.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::domain::ProvisionBundle;

use super::{ProvisionReport, Provisioner};

const DEFAULT_BINARY: &str = "ansible-playbook";

/// Provisioner backed by an Ansible-style playbook runner
pub struct PlaybookProvisioner {
    /// Path to the playbook runner binary
    binary_path: String,
}

impl Default for PlaybookProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybookProvisioner {
    /// Create a provisioner using the default binary name, resolved via PATH
    pub fn new() -> Self {
        Self {
            binary_path: DEFAULT_BINARY.to_string(),
        }
    }

    /// Create a provisioner with a custom runner binary
    pub fn with_binary_path(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }

    pub fn binary_path(&self) -> &str {
        &self.binary_path
    }

    async fn run_playbook(&self, bundle: &ProvisionBundle, ceiling: Duration) -> Result<String> {
        debug!(
            playbook = %bundle.playbook.display(),
            inventory = %bundle.inventory.display(),
            secrets = bundle.secrets.len(),
            "invoking playbook runner"
        );

        let child = Command::new(&self.binary_path)
            .arg("-i")
            .arg(&bundle.inventory)
            .arg(&bundle.playbook)
            .envs(&bundle.secrets)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| {
                format!(
                    "failed to spawn '{}' for playbook {}",
                    self.binary_path,
                    bundle.playbook.display()
                )
            })?;

        let output = timeout(ceiling, child.wait_with_output())
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "playbook {} timed out after {:?}",
                    bundle.playbook.display(),
                    ceiling
                )
            })?
            .with_context(|| format!("failed to wait for '{}'", self.binary_path))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            let exit_code = output.status.code().unwrap_or(-1);
            anyhow::bail!(
                "playbook {} failed with exit code {}: {}",
                bundle.playbook.display(),
                exit_code,
                stderr.trim()
            );
        }

        let mut transcript = stdout.into_owned();
        if !stderr.trim().is_empty() {
            transcript.push_str("\n--- stderr ---\n");
            transcript.push_str(&stderr);
        }
        Ok(transcript)
    }
}

#[async_trait]
impl Provisioner for PlaybookProvisioner {
    fn name(&self) -> &str {
        "playbook"
    }

    async fn provision(
        &self,
        bundle: &ProvisionBundle,
        timeout: Duration,
    ) -> Result<ProvisionReport> {
        let transcript = self.run_playbook(bundle, timeout).await?;
        Ok(ProvisionReport::new(transcript))
    }

    async fn health_check(&self) -> Result<()> {
        let output = Command::new(&self.binary_path)
            .arg("--version")
            .output()
            .await
            .with_context(|| format!("failed to run '{} --version'", self.binary_path))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("playbook runner health check failed: {}", stderr.trim());
        }

        Ok(())
    }
}
