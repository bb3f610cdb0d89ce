//! Workflows that drive nodes through sandbox transitions.
//!
//! - Snapshot: transient `Snapshotting` transition around a node checkpoint
//! - Removal: terminal pause/kill transition, then record cleanup

pub mod node;
mod removal;
mod snapshot;
pub mod templates;

use std::sync::Arc;

use crate::metrics::ControlPlaneMetricsStorage;
use crate::proxy::SandboxCatalog;
use crate::sandbox::Sandbox;
use crate::transition::TransitionCoordinator;
use sandplane_shared::errors::{SandplaneError, SandplaneResult};

pub use node::{CheckpointRequest, NodeClient, NodeRegistry, PauseRequest};
pub use snapshot::{SnapshotOptions, SnapshotResult};
pub use templates::{SnapshotName, TemplateStore};

/// Entry point for lifecycle operations on running sandboxes.
///
/// Cheap to clone; clones share the coordinator, registry and stores.
#[derive(Clone)]
pub struct Orchestrator {
    coordinator: TransitionCoordinator,
    nodes: Arc<NodeRegistry>,
    templates: Arc<dyn TemplateStore>,
    catalog: Option<Arc<dyn SandboxCatalog>>,
    metrics: Arc<ControlPlaneMetricsStorage>,
}

impl Orchestrator {
    pub fn new(
        coordinator: TransitionCoordinator,
        nodes: Arc<NodeRegistry>,
        templates: Arc<dyn TemplateStore>,
        metrics: Arc<ControlPlaneMetricsStorage>,
    ) -> Self {
        Self {
            coordinator,
            nodes,
            templates,
            catalog: None,
            metrics,
        }
    }

    /// Also drop catalog entries of removed sandboxes.
    pub fn with_catalog(mut self, catalog: Arc<dyn SandboxCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn coordinator(&self) -> &TransitionCoordinator {
        &self.coordinator
    }

    pub fn nodes(&self) -> &Arc<NodeRegistry> {
        &self.nodes
    }

    pub fn templates(&self) -> &Arc<dyn TemplateStore> {
        &self.templates
    }

    fn node_for(&self, sandbox: &Sandbox) -> SandplaneResult<Arc<dyn NodeClient>> {
        self.nodes
            .get(&sandbox.cluster_id, &sandbox.node_id)
            .ok_or_else(|| SandplaneError::NodeNotFound(sandbox.node_id.clone()))
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("nodes", &self.nodes)
            .field("catalog", &self.catalog.is_some())
            .finish()
    }
}
