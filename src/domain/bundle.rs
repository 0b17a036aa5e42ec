//! The configuration bundle handed to the provisioning step.
//!
//! Secret values are opaque pass-through: the gate resolves the names a
//! pipeline declares against the process environment, hands the values to
//! the provisioner, and never parses, transforms, or logs them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

/// Fixed set of parameters passed to the external provisioning step
#[derive(Debug, Clone)]
pub struct ProvisionBundle {
    /// Path to the playbook to execute
    pub playbook: PathBuf,

    /// Path to the inventory file selecting target hosts
    pub inventory: PathBuf,

    /// Named secret/credential values, exported to the provisioner's
    /// environment. Opaque strings; never inspected.
    pub secrets: HashMap<String, String>,
}

impl ProvisionBundle {
    pub fn new(playbook: impl Into<PathBuf>, inventory: impl Into<PathBuf>) -> Self {
        Self {
            playbook: playbook.into(),
            inventory: inventory.into(),
            secrets: HashMap::new(),
        }
    }

    /// Resolve the declared secret names against the process environment.
    /// Every declared name must be set; a missing variable is a
    /// configuration error, not a deploy failure.
    pub fn with_secrets_from_env(mut self, names: &[String]) -> Result<Self> {
        for name in names {
            let value = std::env::var(name)
                .with_context(|| format!("secret '{}' is not set in the environment", name))?;
            self.secrets.insert(name.clone(), value);
        }
        Ok(self)
    }

    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(name.into(), value.into());
        self
    }

    /// Fingerprint of the bundle for the journal: playbook path,
    /// inventory path, and the sorted secret NAMES. Values are excluded
    /// so the fingerprint is safe to persist.
    pub fn fingerprint(&self) -> String {
        let mut names: Vec<&str> = self.secrets.keys().map(String::as_str).collect();
        names.sort_unstable();

        let mut hasher = Sha256::new();
        hasher.update(path_bytes(&self.playbook));
        hasher.update(b"\n");
        hasher.update(path_bytes(&self.inventory));
        for name in names {
            hasher.update(b"\n");
            hasher.update(name.as_bytes());
        }

        hex::encode(&hasher.finalize()[..8])
    }
}

fn path_bytes(path: &Path) -> Vec<u8> {
    path.to_string_lossy().into_owned().into_bytes()
}
