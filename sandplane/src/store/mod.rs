//! Shared state store contract.
//!
//! The coordinator keeps three kinds of data in the store:
//! - Sandbox records, one per `(team, sandbox)`
//! - Markers: short-lived string values with a TTL (transition descriptors
//!   and transition results)
//! - Locks: token-owned keys with a TTL
//!
//! Backends:
//! - [`MemoryStateStore`]: process-local, for a single API process and tests
//! - [`crate::db::SqliteStateStore`]: a SQLite file shared across processes

pub mod keys;
mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::runtime::types::SandboxKey;
use crate::sandbox::Sandbox;
use sandplane_shared::errors::SandplaneResult;
use sandplane_shared::states::SandboxState;

pub use memory::MemoryStateStore;

/// Advertises an in-flight transition on a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionDescriptor {
    /// Unique per begun transition; also names the result marker.
    pub id: String,
    pub target: SandboxState,
}

impl TransitionDescriptor {
    pub(crate) fn encode(&self) -> SandplaneResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub(crate) fn decode(raw: &str) -> SandplaneResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Everything written by the indivisible "begin transition" step.
#[derive(Debug)]
pub struct TransitionCommit<'a> {
    /// Record with the new state already applied.
    pub sandbox: &'a Sandbox,
    pub transition_key: &'a str,
    /// Encoded [`TransitionDescriptor`].
    pub descriptor: &'a str,
    pub transition_ttl: Duration,
    /// Result marker, created empty.
    pub result_key: &'a str,
    pub result_ttl: Duration,
}

/// Keyed store shared by every coordinator instance.
///
/// Implementations must make [`StateStore::commit_transition`] all-or-nothing:
/// a reader must never observe the new record state without the descriptor,
/// or the descriptor without the new state.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_sandbox(&self, key: &SandboxKey) -> SandplaneResult<Option<Sandbox>>;

    /// Insert a new record.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if a record with the same key is present.
    async fn insert_sandbox(&self, sandbox: &Sandbox) -> SandplaneResult<()>;

    /// Overwrite (or create) a record.
    async fn put_sandbox(&self, sandbox: &Sandbox) -> SandplaneResult<()>;

    /// Delete a record. Returns whether it existed.
    async fn remove_sandbox(&self, key: &SandboxKey) -> SandplaneResult<bool>;

    /// Read a marker. Expired markers read as `None`.
    async fn get_marker(&self, key: &str) -> SandplaneResult<Option<String>>;

    async fn set_marker(&self, key: &str, value: &str, ttl: Duration) -> SandplaneResult<()>;

    async fn delete_marker(&self, key: &str) -> SandplaneResult<()>;

    /// Write the updated record, the descriptor and the empty result slot as
    /// one indivisible operation.
    async fn commit_transition(&self, commit: &TransitionCommit<'_>) -> SandplaneResult<()>;

    /// Take `key` for `token` unless another live token holds it.
    async fn try_acquire_lock(&self, key: &str, token: &str, ttl: Duration)
    -> SandplaneResult<bool>;

    /// Release `key` if `token` still owns it. Returns whether it did.
    async fn release_lock(&self, key: &str, token: &str) -> SandplaneResult<bool>;
}
