//! RPC surface of the nodes that host sandboxes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

/// Pause, persist and resume a sandbox with the same execution identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRequest {
    pub sandbox_id: String,
    /// Build the checkpoint artifact is uploaded as.
    pub build_id: Uuid,
}

/// Stop a sandbox, keeping enough state to resume it later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PauseRequest {
    pub sandbox_id: String,
    pub execution_id: String,
    pub template_id: String,
    pub build_id: Uuid,
}

/// Client for one node.
///
/// Failures are gRPC statuses. On failure the node leaves the VM stopped.
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn checkpoint(&self, request: CheckpointRequest) -> Result<(), tonic::Status>;

    async fn pause(&self, request: PauseRequest) -> Result<(), tonic::Status>;

    /// Stop the VM and discard its state.
    async fn kill(&self, sandbox_id: &str) -> Result<(), tonic::Status>;
}

/// Node clients keyed by `(cluster, node)`.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<(String, String), Arc<dyn NodeClient>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        cluster_id: impl Into<String>,
        node_id: impl Into<String>,
        client: Arc<dyn NodeClient>,
    ) {
        let cluster_id = cluster_id.into();
        let node_id = node_id.into();
        tracing::debug!(cluster_id = %cluster_id, node_id = %node_id, "Registered node");
        self.nodes.write().insert((cluster_id, node_id), client);
    }

    pub fn deregister(&self, cluster_id: &str, node_id: &str) -> bool {
        self.nodes
            .write()
            .remove(&(cluster_id.to_string(), node_id.to_string()))
            .is_some()
    }

    pub fn get(&self, cluster_id: &str, node_id: &str) -> Option<Arc<dyn NodeClient>> {
        self.nodes
            .read()
            .get(&(cluster_id.to_string(), node_id.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("nodes", &self.len())
            .finish()
    }
}
