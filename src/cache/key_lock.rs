//! Advisory per-key lock in the backing store.
//!
//! The lock key expires on its own, so a crashed holder blocks other callers
//! for at most the lock TTL.

use std::time::Duration;

use tracing::debug;
use uuid::Uuid;

use super::backend::{BackendError, SharedBackend};
use super::keys::lock_key;

/// Proof of holding a lock; required to release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGuard {
    key: String,
    token: String,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[derive(Clone)]
pub struct KeyLock {
    backend: SharedBackend,
    ttl: Duration,
}

impl KeyLock {
    pub fn new(backend: SharedBackend, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    /// Try once to take the lock guarding `key`.
    pub async fn try_acquire(&self, key: &str) -> Result<Option<LockGuard>, BackendError> {
        let lock = lock_key(key);
        let token = Uuid::new_v4().to_string();
        if self.backend.set_nx(&lock, &token, self.ttl).await? {
            debug!(lock = %lock, "Acquired cache key lock");
            Ok(Some(LockGuard { key: lock, token }))
        } else {
            Ok(None)
        }
    }

    /// Release a held lock. Returns `false` when the lock had already expired
    /// and possibly been taken by someone else, in which case it is left alone.
    pub async fn release(&self, guard: LockGuard) -> Result<bool, BackendError> {
        let released = self.backend.delete_if_eq(&guard.key, &guard.token).await?;
        if !released {
            debug!(lock = %guard.key, "Cache key lock expired before release");
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cache::backend::MemoryBackend;

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let lock = KeyLock::new(Arc::new(MemoryBackend::new()), Duration::from_secs(10));
        let guard = lock.try_acquire("k").await.expect("acquire").expect("free");
        assert_eq!(guard.key(), "lock:k");
        assert!(lock.try_acquire("k").await.expect("acquire").is_none());
        assert!(lock.release(guard).await.expect("release"));
        assert!(lock.try_acquire("k").await.expect("acquire").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_holder_cannot_release_new_owner() {
        let lock = KeyLock::new(Arc::new(MemoryBackend::new()), Duration::from_millis(100));
        let stale = lock.try_acquire("k").await.expect("acquire").expect("free");
        tokio::time::sleep(Duration::from_millis(200)).await;

        let fresh = lock.try_acquire("k").await.expect("acquire").expect("expired");
        assert!(!lock.release(stale).await.expect("release"));
        assert!(lock.try_acquire("k").await.expect("acquire").is_none());
        assert!(lock.release(fresh).await.expect("release"));
    }
}
