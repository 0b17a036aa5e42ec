//! Local provisioner: applies the deployment's filesystem effects
//! directly on this host.
//!
//! Covers the same ground a minimal site playbook would: ensure the
//! per-domain web root and its `media`/`data` subdirectories exist with
//! fixed modes, and render the environment file from the bundle's
//! secrets. Every task is idempotent; a second run with identical inputs
//! reports `ok` for each task and changes nothing on disk.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use crate::domain::ProvisionBundle;

use super::{ProvisionReport, Provisioner};

const DIR_MODE: u32 = 0o755;
const ENV_FILE_MODE: u32 = 0o600;

/// Provisioner that deploys onto the local filesystem
pub struct LocalProvisioner {
    /// Per-domain web root (media/ and data/ are created beneath it)
    web_root: PathBuf,

    /// Destination of the rendered environment file
    env_file: PathBuf,
}

/// Result of one idempotent task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskResult {
    Ok,
    Changed,
}

impl TaskResult {
    fn label(self) -> &'static str {
        match self {
            TaskResult::Ok => "ok",
            TaskResult::Changed => "changed",
        }
    }
}

impl LocalProvisioner {
    pub fn new(web_root: impl Into<PathBuf>, env_file: impl Into<PathBuf>) -> Self {
        Self {
            web_root: web_root.into(),
            env_file: env_file.into(),
        }
    }

    /// Ensure a directory exists with the fixed mode
    async fn ensure_dir(&self, path: &Path) -> Result<TaskResult> {
        let existed = path.is_dir();

        fs::create_dir_all(path)
            .await
            .with_context(|| format!("failed to create directory {}", path.display()))?;
        set_mode(path, DIR_MODE).await?;

        Ok(if existed {
            TaskResult::Ok
        } else {
            TaskResult::Changed
        })
    }

    /// Render the environment file (KEY=value per line, sorted by name)
    /// and install it only when the content differs
    async fn render_env_file(&self, bundle: &ProvisionBundle) -> Result<TaskResult> {
        let mut names: Vec<&String> = bundle.secrets.keys().collect();
        names.sort_unstable();

        let mut rendered = String::new();
        for name in names {
            rendered.push_str(&format!("{}={}\n", name, bundle.secrets[name]));
        }

        let current = match fs::read_to_string(&self.env_file).await {
            Ok(content) => Some(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to read existing env file {}", self.env_file.display())
                })
            }
        };

        if current.as_deref() == Some(rendered.as_str()) {
            set_mode(&self.env_file, ENV_FILE_MODE).await?;
            return Ok(TaskResult::Ok);
        }

        if let Some(parent) = self.env_file.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&self.env_file, rendered)
            .await
            .with_context(|| format!("failed to write env file {}", self.env_file.display()))?;
        set_mode(&self.env_file, ENV_FILE_MODE).await?;

        Ok(TaskResult::Changed)
    }
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .with_context(|| format!("failed to set mode on {}", path.display()))
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[async_trait]
impl Provisioner for LocalProvisioner {
    fn name(&self) -> &str {
        "local"
    }

    async fn provision(
        &self,
        bundle: &ProvisionBundle,
        _timeout: Duration,
    ) -> Result<ProvisionReport> {
        // Local tasks are bounded by the gate's outer ceiling; no child
        // process to kill here.
        let mut transcript = String::new();

        let tasks: [(&str, PathBuf); 3] = [
            ("web root", self.web_root.clone()),
            ("media", self.web_root.join("media")),
            ("data", self.web_root.join("data")),
        ];

        for (label, path) in &tasks {
            let result = self.ensure_dir(path).await?;
            debug!(task = label, path = %path.display(), result = result.label(), "directory task");
            transcript.push_str(&format!("{} : {}\n", label, result.label()));
        }

        let result = self.render_env_file(bundle).await?;
        debug!(task = "env file", path = %self.env_file.display(), result = result.label(), "render task");
        transcript.push_str(&format!("env file : {}\n", result.label()));

        Ok(ProvisionReport::new(transcript))
    }

    async fn health_check(&self) -> Result<()> {
        // Nothing external to probe; verify the web root's parent is
        // reachable so a deploy will not fail on the first task.
        if let Some(parent) = self.web_root.parent() {
            if !parent.exists() {
                anyhow::bail!("web root parent {} does not exist", parent.display());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_first_run_creates_everything() {
        let dir = TempDir::new().unwrap();
        let web_root = dir.path().join("var/www/example.org");
        let env_file = dir.path().join("var/www/example.org/.env");
        let provisioner = LocalProvisioner::new(&web_root, &env_file);

        let bundle = ProvisionBundle::new("unused", "unused")
            .with_secret("DATABASE_URL", "postgres://db/example");

        let report = provisioner
            .provision(&bundle, Duration::from_secs(5))
            .await
            .unwrap();

        assert!(web_root.join("media").is_dir());
        assert!(web_root.join("data").is_dir());
        assert_eq!(
            fs::read_to_string(&env_file).await.unwrap(),
            "DATABASE_URL=postgres://db/example\n"
        );
        assert!(report.transcript.contains("web root : changed"));
        assert!(report.transcript.contains("env file : changed"));
    }

    #[tokio::test]
    async fn test_second_run_is_all_ok() {
        let dir = TempDir::new().unwrap();
        let web_root = dir.path().join("www");
        let env_file = dir.path().join("www/.env");
        let provisioner = LocalProvisioner::new(&web_root, &env_file);

        let bundle = ProvisionBundle::new("unused", "unused").with_secret("API_KEY", "k1");

        provisioner
            .provision(&bundle, Duration::from_secs(5))
            .await
            .unwrap();
        let report = provisioner
            .provision(&bundle, Duration::from_secs(5))
            .await
            .unwrap();

        for line in report.transcript.lines() {
            assert!(line.ends_with(": ok"), "expected idempotent task: {}", line);
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_env_file_mode_is_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let provisioner =
            LocalProvisioner::new(dir.path().join("www"), dir.path().join("www/.env"));
        let bundle = ProvisionBundle::new("unused", "unused").with_secret("S", "v");

        provisioner
            .provision(&bundle, Duration::from_secs(5))
            .await
            .unwrap();

        let mode = std::fs::metadata(dir.path().join("www/.env"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_changed_secrets_rerender() {
        let dir = TempDir::new().unwrap();
        let provisioner =
            LocalProvisioner::new(dir.path().join("www"), dir.path().join("www/.env"));

        let v1 = ProvisionBundle::new("unused", "unused").with_secret("API_KEY", "old");
        let v2 = ProvisionBundle::new("unused", "unused").with_secret("API_KEY", "new");

        provisioner.provision(&v1, Duration::from_secs(5)).await.unwrap();
        let report = provisioner.provision(&v2, Duration::from_secs(5)).await.unwrap();

        assert!(report.transcript.contains("env file : changed"));
        assert_eq!(
            fs::read_to_string(dir.path().join("www/.env")).await.unwrap(),
            "API_KEY=new\n"
        );
    }
}
