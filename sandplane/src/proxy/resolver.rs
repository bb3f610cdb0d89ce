//! Request-time routing: find where a sandbox lives, resuming it if allowed.

use std::sync::Arc;

use async_trait::async_trait;

use super::catalog::SandboxCatalog;
use super::flags::FeatureFlags;
use sandplane_shared::constants::flags::SANDBOX_AUTO_RESUME;
use sandplane_shared::errors::{SandplaneError, SandplaneResult};

/// Brings a paused sandbox back up and reports the node now serving it.
#[async_trait]
pub trait Resumer: Send + Sync {
    async fn resume(&self, sandbox_id: &str) -> SandplaneResult<String>;
}

/// Resolves a sandbox ID to a node IP without touching the transition
/// coordinator.
#[derive(Clone)]
pub struct CatalogResolver {
    catalog: Arc<dyn SandboxCatalog>,
    resumer: Option<Arc<dyn Resumer>>,
    flags: Arc<dyn FeatureFlags>,
}

impl CatalogResolver {
    pub fn new(
        catalog: Arc<dyn SandboxCatalog>,
        resumer: Option<Arc<dyn Resumer>>,
        flags: Arc<dyn FeatureFlags>,
    ) -> Self {
        Self {
            catalog,
            resumer,
            flags,
        }
    }

    /// Node IP for `sandbox_id`.
    ///
    /// An empty string is a valid answer: the sandbox is known but not
    /// proxyable.
    ///
    /// # Errors
    ///
    /// `NodeNotFound` when the catalog misses and the sandbox cannot (or may
    /// not) be resumed. Other resume failures are returned as they are.
    pub async fn resolve(&self, sandbox_id: &str) -> SandplaneResult<String> {
        if let Some(info) = self.catalog.get_sandbox(sandbox_id).await? {
            return Ok(info.node_ip);
        }

        let Some(resumer) = &self.resumer else {
            return Err(SandplaneError::NodeNotFound(sandbox_id.to_string()));
        };

        if !self.flags.is_enabled(SANDBOX_AUTO_RESUME) {
            tracing::debug!(sandbox_id = %sandbox_id, "Auto-resume disabled, not resuming");
            return Err(SandplaneError::NodeNotFound(sandbox_id.to_string()));
        }

        tracing::info!(sandbox_id = %sandbox_id, "Resuming sandbox for incoming traffic");
        match resumer.resume(sandbox_id).await {
            Ok(node_ip) => Ok(node_ip),
            Err(e) if e.is_not_found() => {
                tracing::debug!(sandbox_id = %sandbox_id, error = %e, "Sandbox not resumable");
                Err(SandplaneError::NodeNotFound(sandbox_id.to_string()))
            }
            Err(e) => {
                tracing::warn!(sandbox_id = %sandbox_id, error = %e, "Failed to resume sandbox");
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for CatalogResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogResolver")
            .field("resumer", &self.resumer.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::proxy::catalog::{MemorySandboxCatalog, SandboxInfo};
    use crate::proxy::flags::StaticFeatureFlags;

    struct StubResumer(Result<&'static str, tonic::Code>);

    #[async_trait]
    impl Resumer for StubResumer {
        async fn resume(&self, _sandbox_id: &str) -> SandplaneResult<String> {
            match self.0 {
                Ok(ip) => Ok(ip.to_string()),
                Err(code) => Err(tonic::Status::new(code, "stub").into()),
            }
        }
    }

    fn flags(auto_resume: bool) -> Arc<dyn FeatureFlags> {
        Arc::new(StaticFeatureFlags::new().with(SANDBOX_AUTO_RESUME, auto_resume))
    }

    fn resolver(resumer: Option<StubResumer>, auto_resume: bool) -> CatalogResolver {
        CatalogResolver::new(
            Arc::new(MemorySandboxCatalog::new()),
            resumer.map(|r| Arc::new(r) as Arc<dyn Resumer>),
            flags(auto_resume),
        )
    }

    async fn with_entry(ip: &str) -> CatalogResolver {
        let catalog = Arc::new(MemorySandboxCatalog::new());
        catalog
            .store_sandbox(
                "sbx",
                &SandboxInfo {
                    node_ip: ip.into(),
                    execution_id: "exec".into(),
                    started_at: Utc::now(),
                },
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        CatalogResolver::new(catalog, Some(Arc::new(StubResumer(Ok("10.9.9.9")))), flags(true))
    }

    #[tokio::test]
    async fn test_catalog_hit() {
        let resolver = with_entry("10.0.0.1").await;
        assert_eq!(resolver.resolve("sbx").await.unwrap(), "10.0.0.1");
    }

    #[tokio::test]
    async fn test_catalog_hit_empty_ip() {
        let resolver = with_entry("").await;
        assert_eq!(resolver.resolve("sbx").await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_miss_without_resumer() {
        let err = resolver(None, true).resolve("sbx").await.unwrap_err();
        assert!(matches!(err, SandplaneError::NodeNotFound(_)));
    }

    #[tokio::test]
    async fn test_miss_with_flag_disabled() {
        let err = resolver(Some(StubResumer(Ok("10.0.0.1"))), false)
            .resolve("sbx")
            .await
            .unwrap_err();
        assert!(matches!(err, SandplaneError::NodeNotFound(_)));
    }

    #[tokio::test]
    async fn test_resume_not_found_maps_to_node_not_found() {
        let err = resolver(Some(StubResumer(Err(tonic::Code::NotFound))), true)
            .resolve("sbx")
            .await
            .unwrap_err();
        assert!(matches!(err, SandplaneError::NodeNotFound(_)));
    }

    #[tokio::test]
    async fn test_resume_other_error_propagates() {
        let err = resolver(Some(StubResumer(Err(tonic::Code::Unavailable))), true)
            .resolve("sbx")
            .await
            .unwrap_err();
        assert!(matches!(err, SandplaneError::Rpc(ref s) if s.code() == tonic::Code::Unavailable));
    }

    #[tokio::test]
    async fn test_resume_succeeds() {
        let ip = resolver(Some(StubResumer(Ok("10.0.0.1"))), true)
            .resolve("sbx")
            .await
            .unwrap();
        assert_eq!(ip, "10.0.0.1");
    }

    #[tokio::test]
    async fn test_resume_succeeds_with_empty_ip() {
        let ip = resolver(Some(StubResumer(Ok(""))), true)
            .resolve("sbx")
            .await
            .unwrap();
        assert_eq!(ip, "");
    }
}
