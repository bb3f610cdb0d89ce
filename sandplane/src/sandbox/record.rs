//! Sandbox record: the unit of state owned by the transition coordinator.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::runtime::types::{SandboxID, SandboxKey, TeamID};
use sandplane_shared::states::SandboxState;

/// State record for one running sandbox.
///
/// At most one record exists per `(team_id, sandbox_id)`. Records are only
/// mutated through the transition coordinator; everything besides `state`
/// and `end_time` is opaque metadata carried for the orchestrators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sandbox {
    pub team_id: TeamID,
    pub sandbox_id: SandboxID,
    pub state: SandboxState,
    pub start_time: DateTime<Utc>,
    /// When the sandbox stops being valid. Stamped to "now" by terminal
    /// transitions that begin before the natural timeout.
    pub end_time: DateTime<Utc>,

    pub cluster_id: String,
    pub node_id: String,
    /// Identity of the VM process on the node; unchanged by checkpoints.
    pub execution_id: String,
    pub template_id: String,
    pub build_id: Uuid,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Sandbox {
    /// Create a `Running` record that expires `timeout` from now.
    pub fn new(
        team_id: TeamID,
        sandbox_id: impl Into<SandboxID>,
        node_id: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            team_id,
            sandbox_id: sandbox_id.into(),
            state: SandboxState::Running,
            start_time: now,
            end_time: now + timeout,
            cluster_id: String::new(),
            node_id: node_id.into(),
            execution_id: Uuid::new_v4().to_string(),
            template_id: String::new(),
            build_id: Uuid::nil(),
            metadata: HashMap::new(),
        }
    }

    pub fn key(&self) -> SandboxKey {
        SandboxKey::new(self.team_id, self.sandbox_id.clone())
    }

    pub fn is_expired(&self) -> bool {
        self.end_time <= Utc::now()
    }

    /// Stamp the end time for a terminal transition, keeping an earlier
    /// natural expiry intact.
    pub(crate) fn mark_expiring(&mut self) {
        if !self.is_expired() {
            self.end_time = Utc::now();
        }
    }
}
