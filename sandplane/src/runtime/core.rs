//! Control plane entry point.

use std::sync::Arc;

use crate::db::{Database, SqliteStateStore, SqliteTemplateStore};
use crate::logging::init_logging_for;
use crate::metrics::{ControlPlaneMetrics, ControlPlaneMetricsStorage, ProxyMetrics};
use crate::orchestrator::{NodeRegistry, Orchestrator};
use crate::proxy::{
    CatalogResolver, ConnectionLimiter, FixedLimit, MemorySandboxCatalog, ProxyRouter, Resumer,
    SandboxCatalog, SandboxInfo, StaticFeatureFlags,
};
use crate::runtime::options::{SandplaneOptions, StoreBackend};
use crate::sandbox::Sandbox;
use crate::store::{MemoryStateStore, StateStore};
use crate::transition::TransitionCoordinator;
use sandplane_shared::constants::flags::SANDBOX_AUTO_RESUME;
use sandplane_shared::errors::{SandplaneError, SandplaneResult};

/// Wires the stores, coordinator, orchestrator and proxy pieces together.
///
/// **Cloning**: cheap via `Arc`; all clones share the same state.
///
/// **Catalog**: [`ControlPlane::open`] keeps routing entries in process
/// memory even with a shared SQLite store, so a pause in one process does not
/// unroute the sandbox from another process's routers. Processes that share a
/// store should also share a catalog via [`ControlPlane::open_with_catalog`].
#[derive(Clone)]
pub struct ControlPlane {
    inner: Arc<ControlPlaneInner>,
}

struct ControlPlaneInner {
    options: SandplaneOptions,
    orchestrator: Orchestrator,
    catalog: Arc<dyn SandboxCatalog>,
    flags: Arc<StaticFeatureFlags>,
    limiter: Arc<ConnectionLimiter>,
    /// Lifecycle counters (AtomicU64 based, lock-free)
    metrics: Arc<ControlPlaneMetricsStorage>,
    proxy_metrics: Arc<ProxyMetrics>,
}

impl ControlPlane {
    /// Open a control plane with the given options.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The options are invalid
    /// - The home directory or logs cannot be set up
    /// - A database cannot be opened
    pub fn open(options: SandplaneOptions) -> SandplaneResult<Self> {
        Self::open_with_catalog(options, Arc::new(MemorySandboxCatalog::new()))
    }

    /// Like [`ControlPlane::open`], routing through `catalog`.
    pub fn open_with_catalog(
        options: SandplaneOptions,
        catalog: Arc<dyn SandboxCatalog>,
    ) -> SandplaneResult<Self> {
        options.validate()?;

        std::fs::create_dir_all(&options.home_dir).map_err(|e| {
            SandplaneError::Storage(format!(
                "Failed to initialize home directory at {}: {}",
                options.home_dir.display(),
                e
            ))
        })?;

        if options.logging.enabled {
            init_logging_for(&options.logs_dir())?;
        }

        let templates_path = options.db_dir().join("sandplane.db");
        let templates_db = Database::open(&templates_path).map_err(|e| {
            SandplaneError::Storage(format!(
                "Failed to initialize database at {}: {}",
                templates_path.display(),
                e
            ))
        })?;

        let store: Arc<dyn StateStore> = match &options.store {
            StoreBackend::Memory => Arc::new(MemoryStateStore::new()),
            StoreBackend::Sqlite { path } => {
                let path = path
                    .clone()
                    .unwrap_or_else(|| options.db_dir().join("state.db"));
                let db = Database::open(&path).map_err(|e| {
                    SandplaneError::Storage(format!(
                        "Failed to initialize state database at {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Arc::new(SqliteStateStore::new(db))
            }
        };

        let metrics = Arc::new(ControlPlaneMetricsStorage::new());
        let coordinator =
            TransitionCoordinator::new(store, options.lock, options.transition, metrics.clone());

        let orchestrator = Orchestrator::new(
            coordinator,
            Arc::new(NodeRegistry::new()),
            Arc::new(SqliteTemplateStore::new(templates_db)),
            metrics.clone(),
        )
        .with_catalog(catalog.clone());

        let flags = Arc::new(
            StaticFeatureFlags::new().with(SANDBOX_AUTO_RESUME, options.proxy.auto_resume),
        );

        tracing::debug!(
            home_dir = %options.home_dir.display(),
            store = ?options.store,
            "Initialized control plane"
        );

        Ok(Self {
            inner: Arc::new(ControlPlaneInner {
                options,
                orchestrator,
                catalog,
                flags,
                limiter: Arc::new(ConnectionLimiter::new()),
                metrics,
                proxy_metrics: Arc::new(ProxyMetrics::default()),
            }),
        })
    }

    pub fn options(&self) -> &SandplaneOptions {
        &self.inner.options
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.inner.orchestrator
    }

    pub fn coordinator(&self) -> &TransitionCoordinator {
        self.inner.orchestrator.coordinator()
    }

    pub fn nodes(&self) -> &Arc<NodeRegistry> {
        self.inner.orchestrator.nodes()
    }

    pub fn catalog(&self) -> &Arc<dyn SandboxCatalog> {
        &self.inner.catalog
    }

    pub fn flags(&self) -> &Arc<StaticFeatureFlags> {
        &self.inner.flags
    }

    pub fn metrics(&self) -> ControlPlaneMetrics {
        ControlPlaneMetrics::new(Arc::clone(&self.inner.metrics))
    }

    pub fn proxy_metrics(&self) -> &Arc<ProxyMetrics> {
        &self.inner.proxy_metrics
    }

    /// Record a sandbox that just started on a node and make it routable.
    pub async fn register_sandbox(&self, sandbox: &Sandbox, node_ip: &str) -> SandplaneResult<()> {
        self.coordinator().add_sandbox(sandbox).await?;
        self.inner
            .catalog
            .store_sandbox(
                &sandbox.sandbox_id,
                &SandboxInfo {
                    node_ip: node_ip.to_string(),
                    execution_id: sandbox.execution_id.clone(),
                    started_at: sandbox.start_time,
                },
                self.inner.options.proxy.catalog_ttl,
            )
            .await
    }

    /// Build the proxy admission path. All routers share one limiter.
    pub fn proxy_router(&self, resumer: Option<Arc<dyn Resumer>>) -> ProxyRouter {
        let resolver = CatalogResolver::new(
            self.inner.catalog.clone(),
            resumer,
            self.inner.flags.clone(),
        );
        ProxyRouter::new(
            resolver,
            Arc::clone(&self.inner.limiter),
            Arc::new(FixedLimit(self.inner.options.proxy.max_connections_per_sandbox)),
        )
        .with_observer(self.inner.proxy_metrics.clone())
    }
}

impl std::fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlane")
            .field("home_dir", &self.inner.options.home_dir)
            .field("store", &self.inner.options.store)
            .finish()
    }
}
