//! In-process state store.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{StateStore, TransitionCommit};
use crate::runtime::types::SandboxKey;
use crate::sandbox::Sandbox;
use sandplane_shared::errors::{SandplaneError, SandplaneResult};

#[derive(Debug, Clone)]
struct Expiring {
    value: String,
    expires_at: Instant,
}

impl Expiring {
    fn new(value: &str, ttl: Duration) -> Self {
        Self {
            value: value.to_string(),
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Default)]
struct MemoryInner {
    sandboxes: HashMap<SandboxKey, Sandbox>,
    markers: HashMap<String, Expiring>,
    locks: HashMap<String, Expiring>,
}

impl MemoryInner {
    /// Drop expired markers and locks. Result markers of finished
    /// transitions are never read again, so reads alone can't reclaim them.
    fn sweep(&mut self, now: Instant) {
        self.markers.retain(|_, entry| entry.is_live(now));
        self.locks.retain(|_, entry| entry.is_live(now));
    }
}

/// State store backed by process-local maps.
///
/// A single mutex guards all maps, so `commit_transition` is trivially
/// indivisible. TTLs follow `tokio::time`, which lets tests drive expiry
/// with a paused clock.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sandbox records currently stored.
    pub fn len(&self) -> usize {
        self.inner.lock().sandboxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for MemoryStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStateStore").finish()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get_sandbox(&self, key: &SandboxKey) -> SandplaneResult<Option<Sandbox>> {
        Ok(self.inner.lock().sandboxes.get(key).cloned())
    }

    async fn insert_sandbox(&self, sandbox: &Sandbox) -> SandplaneResult<()> {
        let mut inner = self.inner.lock();
        let key = sandbox.key();
        if inner.sandboxes.contains_key(&key) {
            return Err(SandplaneError::AlreadyExists(sandbox.sandbox_id.clone()));
        }
        inner.sandboxes.insert(key, sandbox.clone());
        Ok(())
    }

    async fn put_sandbox(&self, sandbox: &Sandbox) -> SandplaneResult<()> {
        self.inner
            .lock()
            .sandboxes
            .insert(sandbox.key(), sandbox.clone());
        Ok(())
    }

    async fn remove_sandbox(&self, key: &SandboxKey) -> SandplaneResult<bool> {
        Ok(self.inner.lock().sandboxes.remove(key).is_some())
    }

    async fn get_marker(&self, key: &str) -> SandplaneResult<Option<String>> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        match inner.markers.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                inner.markers.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_marker(&self, key: &str, value: &str, ttl: Duration) -> SandplaneResult<()> {
        self.inner
            .lock()
            .markers
            .insert(key.to_string(), Expiring::new(value, ttl));
        Ok(())
    }

    async fn delete_marker(&self, key: &str) -> SandplaneResult<()> {
        self.inner.lock().markers.remove(key);
        Ok(())
    }

    async fn commit_transition(&self, commit: &TransitionCommit<'_>) -> SandplaneResult<()> {
        let mut inner = self.inner.lock();
        inner.sweep(Instant::now());
        inner
            .sandboxes
            .insert(commit.sandbox.key(), commit.sandbox.clone());
        inner.markers.insert(
            commit.transition_key.to_string(),
            Expiring::new(commit.descriptor, commit.transition_ttl),
        );
        inner.markers.insert(
            commit.result_key.to_string(),
            Expiring::new("", commit.result_ttl),
        );
        Ok(())
    }

    async fn try_acquire_lock(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> SandplaneResult<bool> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        if let Some(held) = inner.locks.get(key) {
            if held.is_live(now) {
                return Ok(false);
            }
        }
        inner
            .locks
            .insert(key.to_string(), Expiring::new(token, ttl));
        Ok(true)
    }

    async fn release_lock(&self, key: &str, token: &str) -> SandplaneResult<bool> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        match inner.locks.get(key) {
            Some(held) if held.value == token && held.is_live(now) => {
                inner.locks.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
