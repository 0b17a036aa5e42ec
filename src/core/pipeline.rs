//! Deployment pipeline definitions and loading.
//!
//! A pipeline is defined in YAML: which branch triggers it, which lock
//! token serializes it, the playbook/inventory handed to the
//! provisioner, the wall-clock ceiling, and the secret names passed
//! through from the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::domain::LockToken;

/// A deployment pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline name (used in CLI and as the default lock token)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Designated trigger branch; a deploy for another ref is skipped
    pub branch: Option<String>,

    /// Lock token serializing runs (defaults to the pipeline name)
    pub lock_token: Option<String>,

    /// Path to the playbook handed to the provisioner
    pub playbook: PathBuf,

    /// Path to the inventory file selecting target hosts
    pub inventory: PathBuf,

    /// Wall-clock ceiling over the whole acquire-through-release window
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// What happens to runs queued behind the holder
    #[serde(default)]
    pub queue: QueuePolicy,

    /// Names of environment variables passed through to the provisioner
    #[serde(default)]
    pub secrets: Vec<String>,
}

fn default_timeout_seconds() -> u64 {
    1800
}

impl Pipeline {
    /// Load a pipeline from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read pipeline file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a pipeline from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("failed to parse pipeline YAML")
    }

    /// Validate the pipeline definition
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("pipeline name cannot be empty");
        }

        if self.playbook.as_os_str().is_empty() {
            anyhow::bail!("pipeline '{}' has no playbook", self.name);
        }

        if self.inventory.as_os_str().is_empty() {
            anyhow::bail!("pipeline '{}' has no inventory", self.name);
        }

        if self.timeout_seconds == 0 {
            anyhow::bail!("pipeline '{}' has a zero timeout ceiling", self.name);
        }

        let mut seen = std::collections::HashSet::new();
        for secret in &self.secrets {
            if !seen.insert(secret.as_str()) {
                anyhow::bail!("pipeline '{}' declares secret '{}' twice", self.name, secret);
            }
        }

        Ok(())
    }

    /// The lock token serializing this pipeline's runs
    pub fn lock_token(&self) -> LockToken {
        LockToken::new(self.lock_token.clone().unwrap_or_else(|| self.name.clone()))
    }

    /// The wall-clock ceiling for a whole run
    pub fn ceiling(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Whether a git ref matches the designated trigger branch.
    /// Accepts both short (`main`) and full (`refs/heads/main`) forms;
    /// a pipeline without a branch accepts any ref.
    pub fn matches_ref(&self, git_ref: &str) -> bool {
        match &self.branch {
            None => true,
            Some(branch) => {
                git_ref == branch || git_ref.strip_prefix("refs/heads/") == Some(branch.as_str())
            }
        }
    }
}

/// Policy for runs queued behind the current lock holder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePolicy {
    /// First-requested, first-granted
    Fifo,

    /// A newer queued run supersedes any run still waiting
    LatestWins,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self::Fifo
    }
}
