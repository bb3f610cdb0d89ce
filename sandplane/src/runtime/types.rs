//! Identifier types.

use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;
use uuid::Uuid;

/// Team that owns a sandbox.
pub type TeamID = Uuid;

/// Sandbox identifier (lowercase ULID for generated IDs, opaque otherwise).
pub type SandboxID = String;

/// Generate a new sandbox ID.
///
/// ULIDs are sortable by creation time; lowercased so they are valid DNS
/// labels for proxy routing.
pub fn generate_sandbox_id() -> SandboxID {
    Ulid::new().to_string().to_lowercase()
}

/// Generate a new template ID.
pub fn generate_template_id() -> String {
    Ulid::new().to_string().to_lowercase()
}

/// Identity of a sandbox record: `(team, sandbox)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SandboxKey {
    pub team_id: TeamID,
    pub sandbox_id: SandboxID,
}

impl SandboxKey {
    pub fn new(team_id: TeamID, sandbox_id: impl Into<SandboxID>) -> Self {
        Self {
            team_id,
            sandbox_id: sandbox_id.into(),
        }
    }
}

impl fmt::Display for SandboxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.team_id, self.sandbox_id)
    }
}
