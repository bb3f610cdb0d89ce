//! Sandbox state table.
//!
//! The finite set of states a sandbox record can be in, the actions that move
//! a record between them, and the matrix of permitted transitions.
//!
//! ```text
//!            ┌──────────────► Pausing ──────┐
//!            │                  ▲           ▼
//!   Running ─┼──────────────────┼──────► Killing
//!      ▲     │                  │           ▲
//!      │     └──► Snapshotting ─┴───────────┘
//!      └──────────────┘ (restore)
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::SandplaneError;

/// Lifecycle state of a sandbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    Running,
    Pausing,
    Killing,
    Snapshotting,
}

impl SandboxState {
    pub const ALL: [SandboxState; 4] = [
        SandboxState::Running,
        SandboxState::Pausing,
        SandboxState::Killing,
        SandboxState::Snapshotting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxState::Running => "running",
            SandboxState::Pausing => "pausing",
            SandboxState::Killing => "killing",
            SandboxState::Snapshotting => "snapshotting",
        }
    }

    /// States reachable from this one.
    ///
    /// `Running` is only ever re-entered as the restore target of a
    /// transient `Snapshotting` transition.
    pub fn allowed_targets(&self) -> &'static [SandboxState] {
        match self {
            SandboxState::Running => &[
                SandboxState::Pausing,
                SandboxState::Killing,
                SandboxState::Snapshotting,
            ],
            SandboxState::Pausing => &[SandboxState::Killing],
            SandboxState::Snapshotting => &[
                SandboxState::Running,
                SandboxState::Killing,
                SandboxState::Pausing,
            ],
            SandboxState::Killing => &[],
        }
    }

    /// Check if the matrix permits moving from `self` to `target`.
    pub fn can_transition_to(&self, target: SandboxState) -> bool {
        self.allowed_targets().contains(&target)
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SandboxState {
    type Err = SandplaneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(SandboxState::Running),
            "pausing" => Ok(SandboxState::Pausing),
            "killing" => Ok(SandboxState::Killing),
            "snapshotting" => Ok(SandboxState::Snapshotting),
            other => Err(SandplaneError::InvalidArgument(format!(
                "unknown sandbox state '{}'",
                other
            ))),
        }
    }
}

/// What happens to the sandbox once an action's transition completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionEffect {
    /// Terminal: the record's end time is stamped and the sandbox goes away.
    Expires,
    /// Temporary: the record is restored to `Running` after a successful run.
    Transient,
}

/// A requested state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateAction {
    /// Human-readable identifier (e.g. "pause", "kill").
    pub name: &'static str,
    pub target: SandboxState,
    pub effect: TransitionEffect,
}

impl StateAction {
    pub const PAUSE: StateAction = StateAction {
        name: "pause",
        target: SandboxState::Pausing,
        effect: TransitionEffect::Expires,
    };

    pub const KILL: StateAction = StateAction {
        name: "kill",
        target: SandboxState::Killing,
        effect: TransitionEffect::Expires,
    };

    pub const SNAPSHOT: StateAction = StateAction {
        name: "snapshot",
        target: SandboxState::Snapshotting,
        effect: TransitionEffect::Transient,
    };

    pub fn is_transient(&self) -> bool {
        self.effect == TransitionEffect::Transient
    }
}

impl fmt::Display for StateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}
