//! Process-local lock backend with FIFO handover and an optional lease.
//!
//! Waiters queue on oneshot channels; release installs the next live
//! waiter as the holder before waking it, so the lock is never observed
//! free while a queue exists. A holder past its lease deadline may be
//! expired by any waiter, which covers a leaked permit without a release
//! (see the lease discussion in DESIGN.md).

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::LockToken;

use super::{LockError, LockService};

struct Holder {
    id: Uuid,
    lease_until: Option<Instant>,
}

struct Waiter {
    id: Uuid,
    tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct Entry {
    holder: Option<Holder>,
    waiters: VecDeque<Waiter>,
}

/// In-memory lock service keyed by token
pub struct MemoryLockService {
    lease: Option<Duration>,
    entries: Mutex<HashMap<LockToken, Entry>>,
}

impl Default for MemoryLockService {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLockService {
    /// Create a lock service without lease expiry
    pub fn new() -> Self {
        Self {
            lease: None,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Create a lock service whose holders expire after `lease`
    pub fn with_lease(lease: Duration) -> Self {
        Self {
            lease: Some(lease),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Whether any holder currently owns `token`
    pub fn is_held(&self, token: &LockToken) -> bool {
        let entries = self.entries.lock().unwrap();
        entries
            .get(token)
            .map(|e| e.holder.is_some())
            .unwrap_or(false)
    }

    fn lease_deadline(&self) -> Option<Instant> {
        self.lease.map(|l| Instant::now() + l)
    }

    /// Try to claim the token. Returns the current holder's lease
    /// deadline when the token is busy and we were queued instead.
    fn claim_or_enqueue(
        &self,
        token: &LockToken,
        holder: Uuid,
    ) -> Result<(), (oneshot::Receiver<()>, Option<Instant>)> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.entry(token.clone()).or_default();

        match &entry.holder {
            None => {
                entry.holder = Some(Holder {
                    id: holder,
                    lease_until: self.lease_deadline(),
                });
                Ok(())
            }
            Some(current) if lease_expired(current) => {
                warn!(
                    token = %token,
                    expired_holder = %current.id,
                    "lock holder exceeded its lease, expiring it"
                );
                entry.holder = Some(Holder {
                    id: holder,
                    lease_until: self.lease_deadline(),
                });
                Ok(())
            }
            Some(current) => {
                let (tx, rx) = oneshot::channel();
                entry.waiters.push_back(Waiter { id: holder, tx });
                Err((rx, current.lease_until))
            }
        }
    }

    /// Drop our queue entry. Returns true if we turned out to already be
    /// the holder (handover raced with our wakeup deadline).
    fn abandon_wait(&self, token: &LockToken, holder: Uuid) -> bool {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(token) {
            if entry.holder.as_ref().map(|h| h.id) == Some(holder) {
                return true;
            }
            entry.waiters.retain(|w| w.id != holder);
        }
        false
    }
}

fn lease_expired(holder: &Holder) -> bool {
    holder
        .lease_until
        .map(|t| Instant::now() >= t)
        .unwrap_or(false)
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn acquire(
        &self,
        token: &LockToken,
        holder: Uuid,
        wait: Duration,
    ) -> Result<(), LockError> {
        let deadline = Instant::now() + wait;

        loop {
            let (rx, holder_lease) = match self.claim_or_enqueue(token, holder) {
                Ok(()) => {
                    debug!(token = %token, holder = %holder, "lock acquired");
                    return Ok(());
                }
                Err(queued) => queued,
            };

            // Wake at the earliest of: handover, our deadline, or the
            // current holder's lease expiry (so we can expire it).
            let mut wake_at = deadline;
            if let Some(lease_until) = holder_lease {
                wake_at = wake_at.min(lease_until);
            }

            match tokio::time::timeout_at(wake_at, rx).await {
                // Handover: release installed us as holder before waking us
                Ok(Ok(())) => {
                    debug!(token = %token, holder = %holder, "lock handed over");
                    return Ok(());
                }
                // Sender dropped without handover; re-check from scratch
                Ok(Err(_)) => continue,
                Err(_) => {
                    if self.abandon_wait(token, holder) {
                        // We were granted the lock at the wakeup boundary
                        return Ok(());
                    }
                    if Instant::now() >= deadline {
                        return Err(LockError::WaitTimeout {
                            token: token.to_string(),
                            waited_ms: wait.as_millis() as u64,
                        });
                    }
                    // Woke for the holder's lease expiry; loop to expire it
                }
            }
        }
    }

    fn release(&self, token: &LockToken, holder: Uuid) {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(token) else {
            return;
        };

        if entry.holder.as_ref().map(|h| h.id) != Some(holder) {
            // Not the holder (already expired by a waiter): nothing to do
            return;
        }

        // Hand over to the first waiter that is still listening
        loop {
            match entry.waiters.pop_front() {
                Some(waiter) => {
                    entry.holder = Some(Holder {
                        id: waiter.id,
                        lease_until: self.lease_deadline(),
                    });
                    if waiter.tx.send(()).is_ok() {
                        debug!(token = %token, new_holder = %waiter.id, "lock handed over");
                        return;
                    }
                    // Waiter cancelled; try the next one
                }
                None => {
                    entry.holder = None;
                    debug!(token = %token, "lock released, queue empty");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn token() -> LockToken {
        LockToken::from("production")
    }

    #[tokio::test]
    async fn test_acquire_free_token() {
        let locks = MemoryLockService::new();
        locks
            .acquire(&token(), Uuid::new_v4(), Duration::from_millis(50))
            .await
            .unwrap();
        assert!(locks.is_held(&token()));
    }

    #[tokio::test]
    async fn test_second_acquire_waits_until_release() {
        let locks = Arc::new(MemoryLockService::new());
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        locks
            .acquire(&token(), first, Duration::from_millis(50))
            .await
            .unwrap();

        // Second holder times out while the first still holds
        let err = locks
            .acquire(&token(), second, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::WaitTimeout { .. }));

        locks.release(&token(), first);
        locks
            .acquire(&token(), second, Duration::from_millis(50))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_fifo_handover() {
        let locks = Arc::new(MemoryLockService::new());
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let third = Uuid::new_v4();

        locks
            .acquire(&token(), first, Duration::from_secs(1))
            .await
            .unwrap();

        let locks2 = locks.clone();
        let waiter2 = tokio::spawn(async move {
            locks2
                .acquire(&token(), second, Duration::from_secs(2))
                .await
                .unwrap();
            second
        });

        // Ensure the second waiter is queued before the third
        tokio::time::sleep(Duration::from_millis(20)).await;

        let locks3 = locks.clone();
        let waiter3 = tokio::spawn(async move {
            locks3
                .acquire(&token(), third, Duration::from_secs(2))
                .await
                .unwrap();
            third
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        locks.release(&token(), first);

        // First-queued wins
        let granted = waiter2.await.unwrap();
        assert_eq!(granted, second);
        assert!(!waiter3.is_finished());

        locks.release(&token(), second);
        waiter3.await.unwrap();
        locks.release(&token(), third);
    }

    #[tokio::test]
    async fn test_expired_lease_is_stolen() {
        let locks = MemoryLockService::with_lease(Duration::from_millis(30));
        let stale = Uuid::new_v4();
        let fresh = Uuid::new_v4();

        locks
            .acquire(&token(), stale, Duration::from_millis(50))
            .await
            .unwrap();

        // The stale holder never releases; the waiter expires its lease
        locks
            .acquire(&token(), fresh, Duration::from_millis(500))
            .await
            .unwrap();
        assert!(locks.is_held(&token()));

        // A release from the expired holder is a no-op now
        locks.release(&token(), stale);
        assert!(locks.is_held(&token()));
    }

    #[tokio::test]
    async fn test_cancelled_waiter_is_skipped() {
        let locks = Arc::new(MemoryLockService::new());
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let third = Uuid::new_v4();

        locks
            .acquire(&token(), first, Duration::from_secs(1))
            .await
            .unwrap();

        // Second waiter gives up quickly
        let err = locks
            .acquire(&token(), second, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::WaitTimeout { .. }));

        let locks3 = locks.clone();
        let waiter3 = tokio::spawn(async move {
            locks3.acquire(&token(), third, Duration::from_secs(2)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        locks.release(&token(), first);
        waiter3.await.unwrap().unwrap();
    }
}
