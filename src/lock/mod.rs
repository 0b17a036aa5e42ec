//! Lock service abstraction for serializing deployment runs.
//!
//! The gate only needs mutual exclusion over a named key. The backend is
//! swappable: `MemoryLockService` for tests and single-binary use,
//! `FileLockService` for cross-process serialization on a shared host.
//! FIFO handover is best effort; mutual exclusion is the hard guarantee.

pub mod file;
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::LockToken;

pub use file::FileLockService;
pub use memory::MemoryLockService;

/// Errors from a lock backend
#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {waited_ms}ms waiting for lock '{token}'")]
    WaitTimeout { token: String, waited_ms: u64 },

    #[error("lock backend failure for '{token}': {message}")]
    Backend { token: String, message: String },
}

/// Mutual exclusion over named keys.
///
/// `acquire` blocks the calling run (bounded by `wait`) until no other
/// holder exists for the token. `release` is synchronous so a `Permit`
/// can release from `Drop` on any exit path, including a future being
/// dropped by a timeout.
#[async_trait]
pub trait LockService: Send + Sync {
    async fn acquire(&self, token: &LockToken, holder: Uuid, wait: Duration)
        -> Result<(), LockError>;

    fn release(&self, token: &LockToken, holder: Uuid);
}

/// RAII guard for an acquired lock.
///
/// Releases exactly once: either explicitly via [`Permit::release`] or on
/// drop, whichever comes first.
pub struct Permit {
    service: Arc<dyn LockService>,
    token: LockToken,
    holder: Uuid,
    released: bool,
}

impl Permit {
    /// Acquire the lock for `token`, waiting at most `wait`.
    pub async fn acquire(
        service: Arc<dyn LockService>,
        token: LockToken,
        holder: Uuid,
        wait: Duration,
    ) -> Result<Self, LockError> {
        service.acquire(&token, holder, wait).await?;
        Ok(Self {
            service,
            token,
            holder,
            released: false,
        })
    }

    pub fn token(&self) -> &LockToken {
        &self.token
    }

    pub fn holder(&self) -> Uuid {
        self.holder
    }

    /// Release the lock now instead of at drop
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.service.release(&self.token, self.holder);
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.release_once();
    }
}
