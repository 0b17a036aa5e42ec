//! Cross-process lock backend over advisory file locks.
//!
//! One lock file per token under the state directory. Acquisition polls
//! `try_lock_exclusive` so a bounded wait stays cancellable; the poll
//! interval trades latency for syscalls. Ordering between waiting
//! processes is whatever the OS gives us; mutual exclusion is the
//! guarantee. A crashed holder is recovered automatically because the OS
//! drops its advisory locks with the process.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fs2::FileExt;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::LockToken;

use super::{LockError, LockService};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// File-based lock service, one `<token>.lock` file per token
pub struct FileLockService {
    dir: PathBuf,
    poll_interval: Duration,
    held: Mutex<HashMap<LockToken, (Uuid, File)>>,
}

impl FileLockService {
    /// Create a lock service rooted at `dir` (created if missing)
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            poll_interval: DEFAULT_POLL_INTERVAL,
            held: Mutex::new(HashMap::new()),
        })
    }

    /// Override the contention poll interval (mainly for tests)
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn lock_path(&self, token: &LockToken) -> PathBuf {
        self.dir.join(format!("{}.lock", token))
    }

    fn try_claim(&self, token: &LockToken, holder: Uuid) -> Result<bool, LockError> {
        // Re-entry from the same process would deadlock the poll loop on
        // some platforms; treat it as contention like any other holder.
        {
            let held = self.held.lock().unwrap();
            if held.contains_key(token) {
                return Ok(false);
            }
        }

        let path = self.lock_path(token);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| backend_error(token, &e))?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                // Best-effort breadcrumb for operators inspecting a stuck
                // lock; never load-bearing.
                let _ = file.set_len(0);
                let _ = writeln!(file, "holder={} acquired_at={}", holder, Utc::now().to_rfc3339());

                self.held.lock().unwrap().insert(token.clone(), (holder, file));
                Ok(true)
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(false),
            Err(e) => Err(backend_error(token, &e)),
        }
    }

    /// Remove a token's lock file regardless of holder. Operator escape
    /// hatch for a runner that died while a remote lock service would
    /// still consider it live; breaks mutual exclusion if the holder is
    /// in fact alive.
    pub fn force_unlock(&self, token: &LockToken) -> std::io::Result<()> {
        if let Some((_, file)) = self.held.lock().unwrap().remove(token) {
            let _ = FileExt::unlock(&file);
        }

        let path = self.lock_path(token);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                warn!(token = %token, path = %path.display(), "lock file forcibly removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Path to the directory holding the lock files
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn backend_error(token: &LockToken, e: &std::io::Error) -> LockError {
    LockError::Backend {
        token: token.to_string(),
        message: e.to_string(),
    }
}

#[async_trait]
impl LockService for FileLockService {
    async fn acquire(
        &self,
        token: &LockToken,
        holder: Uuid,
        wait: Duration,
    ) -> Result<(), LockError> {
        let deadline = Instant::now() + wait;

        loop {
            if self.try_claim(token, holder)? {
                debug!(token = %token, holder = %holder, "file lock acquired");
                return Ok(());
            }

            if Instant::now() + self.poll_interval > deadline {
                return Err(LockError::WaitTimeout {
                    token: token.to_string(),
                    waited_ms: wait.as_millis() as u64,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn release(&self, token: &LockToken, holder: Uuid) {
        let mut held = self.held.lock().unwrap();
        match held.get(token) {
            Some((owner, _)) if *owner == holder => {}
            _ => return, // not our lock
        }
        if let Some((_, file)) = held.remove(token) {
            if let Err(e) = FileExt::unlock(&file) {
                warn!(token = %token, error = %e, "failed to unlock lock file");
            }
            debug!(token = %token, "file lock released");
        }
    }
}
