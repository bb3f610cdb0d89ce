//! Token-owned, time-bounded locks over the shared state store.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use uuid::Uuid;

use crate::runtime::options::LockOptions;
use crate::store::StateStore;
use crate::store::keys::lock_key;
use sandplane_shared::errors::{SandplaneError, SandplaneResult};

/// Hands out [`DistributedLock`]s backed by a [`StateStore`].
#[derive(Clone)]
pub struct LockService {
    store: Arc<dyn StateStore>,
    options: LockOptions,
}

impl LockService {
    pub fn new(store: Arc<dyn StateStore>, options: LockOptions) -> Self {
        Self { store, options }
    }

    /// Obtain the lock for `resource`, retrying until the acquire timeout.
    ///
    /// # Errors
    ///
    /// Returns `LockAcquisitionFailed` when another holder keeps the lock past
    /// the acquire timeout. The caller may retry.
    pub async fn obtain(&self, resource: &str) -> SandplaneResult<DistributedLock> {
        let key = lock_key(resource);
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + self.options.acquire_timeout;

        loop {
            if self
                .store
                .try_acquire_lock(&key, &token, self.options.ttl)
                .await?
            {
                tracing::trace!(lock = %key, "Lock obtained");
                return Ok(DistributedLock {
                    store: Arc::clone(&self.store),
                    key,
                    token,
                    released: false,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(lock = %key, "Gave up waiting for lock");
                return Err(SandplaneError::LockAcquisitionFailed(key));
            }

            let pause = self.retry_delay().min(deadline - now);
            tokio::time::sleep(pause).await;
        }
    }

    /// Retry interval plus up to half of it again, so contending callers
    /// don't poll in lockstep.
    fn retry_delay(&self) -> Duration {
        let base = self.options.retry_interval;
        let max_jitter = (base.as_millis() as u64 / 2).max(1);
        let jitter = rand::rng().random_range(0..=max_jitter);
        base + Duration::from_millis(jitter)
    }
}

impl std::fmt::Debug for LockService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockService")
            .field("options", &self.options)
            .finish()
    }
}

/// A held lock. Release it explicitly with [`DistributedLock::release`].
///
/// Dropping an unreleased lock releases it from a background task; the lock
/// TTL bounds how long a leaked lock can block others.
pub struct DistributedLock {
    store: Arc<dyn StateStore>,
    key: String,
    token: String,
    released: bool,
}

impl DistributedLock {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lock. Losing the lock to expiry is logged, not an error.
    pub async fn release(mut self) -> SandplaneResult<()> {
        self.released = true;
        let released = self.store.release_lock(&self.key, &self.token).await?;
        if !released {
            tracing::warn!(lock = %self.key, "Lock expired before it was released");
        }
        Ok(())
    }
}

impl Drop for DistributedLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(lock = %self.key, "Lock dropped outside runtime; left to expire");
            return;
        };

        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            if let Err(e) = store.release_lock(&key, &token).await {
                tracing::warn!(lock = %key, error = %e, "Failed to release dropped lock");
            }
        });
    }
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("key", &self.key)
            .finish()
    }
}
