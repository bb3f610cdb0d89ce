//! Sandbox catalog: where each live sandbox is currently served from.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use sandplane_shared::errors::SandplaneResult;

/// Routing information for one sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxInfo {
    /// Address of the node serving the sandbox. Empty means the sandbox is
    /// known but must not be proxied to.
    pub node_ip: String,
    pub execution_id: String,
    pub started_at: DateTime<Utc>,
}

#[async_trait]
pub trait SandboxCatalog: Send + Sync {
    async fn get_sandbox(&self, sandbox_id: &str) -> SandplaneResult<Option<SandboxInfo>>;

    async fn store_sandbox(
        &self,
        sandbox_id: &str,
        info: &SandboxInfo,
        ttl: Duration,
    ) -> SandplaneResult<()>;

    /// Drop the entry, but only if it still describes `execution_id`. A
    /// sandbox resumed elsewhere in the meantime keeps its new entry.
    async fn delete_sandbox(&self, sandbox_id: &str, execution_id: &str) -> SandplaneResult<()>;
}

struct CatalogEntry {
    info: SandboxInfo,
    expires_at: Instant,
}

/// Process-local catalog with per-entry TTL.
#[derive(Default)]
pub struct MemorySandboxCatalog {
    entries: Mutex<HashMap<String, CatalogEntry>>,
}

impl MemorySandboxCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for MemorySandboxCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySandboxCatalog")
            .field("entries", &self.entries.lock().len())
            .finish()
    }
}

#[async_trait]
impl SandboxCatalog for MemorySandboxCatalog {
    async fn get_sandbox(&self, sandbox_id: &str) -> SandplaneResult<Option<SandboxInfo>> {
        let mut entries = self.entries.lock();
        match entries.get(sandbox_id) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.info.clone())),
            Some(_) => {
                entries.remove(sandbox_id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn store_sandbox(
        &self,
        sandbox_id: &str,
        info: &SandboxInfo,
        ttl: Duration,
    ) -> SandplaneResult<()> {
        self.entries.lock().insert(
            sandbox_id.to_string(),
            CatalogEntry {
                info: info.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete_sandbox(&self, sandbox_id: &str, execution_id: &str) -> SandplaneResult<()> {
        let mut entries = self.entries.lock();
        if entries
            .get(sandbox_id)
            .is_some_and(|entry| entry.info.execution_id == execution_id)
        {
            entries.remove(sandbox_id);
        }
        Ok(())
    }
}
