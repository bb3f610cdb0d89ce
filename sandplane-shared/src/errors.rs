//! Error taxonomy for the control plane.
//!
//! Every fallible operation returns [`SandplaneResult`]. Variants are typed so
//! that an API layer can map them to status codes without string matching.

use thiserror::Error;
use tonic::Code;

use crate::states::SandboxState;

/// Result type for Sandplane operations.
pub type SandplaneResult<T> = Result<T, SandplaneError>;

#[derive(Debug, Error)]
pub enum SandplaneError {
    /// The sandbox record does not exist.
    #[error("sandbox {0} not found")]
    NotFound(String),

    #[error("sandbox {0} already exists")]
    AlreadyExists(String),

    /// The requested transition is not in the allowed-transition matrix.
    #[error("invalid state transition from {current} to {target}")]
    InvalidStateTransition {
        current: SandboxState,
        target: SandboxState,
    },

    /// The distributed lock could not be obtained in time. Retryable.
    #[error("failed to obtain lock {0}")]
    LockAcquisitionFailed(String),

    /// A waited-for transition completed with an error.
    #[error("transition failed: {0}")]
    TransitionFailed(String),

    /// No node could be found to serve the sandbox.
    #[error("node {0} not found")]
    NodeNotFound(String),

    #[error("checkpoint failed: {0}")]
    CheckpointFailed(String),

    #[error("sandbox {sandbox_id} has too many concurrent incoming connections (limit: {limit})")]
    TooManyConnections { sandbox_id: String, limit: usize },

    /// Error returned by a node RPC.
    #[error("rpc error: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SandplaneError {
    /// Whether the error means "the thing you asked about does not exist".
    ///
    /// Covers missing records and nodes as well as RPC errors carrying the
    /// `NotFound` code.
    pub fn is_not_found(&self) -> bool {
        match self {
            SandplaneError::NotFound(_) | SandplaneError::NodeNotFound(_) => true,
            SandplaneError::Rpc(status) => status.code() == Code::NotFound,
            _ => false,
        }
    }

    /// Whether the error reports a conflict with the sandbox's current state.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            SandplaneError::InvalidStateTransition { .. }
                | SandplaneError::AlreadyExists(_)
                | SandplaneError::TooManyConnections { .. }
        )
    }

    /// Whether retrying the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SandplaneError::LockAcquisitionFailed(_) | SandplaneError::Timeout(_) => true,
            SandplaneError::Rpc(status) => status.code() == Code::Unavailable,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_transition_message() {
        let err = SandplaneError::InvalidStateTransition {
            current: SandboxState::Pausing,
            target: SandboxState::Snapshotting,
        };
        assert_eq!(
            err.to_string(),
            "invalid state transition from pausing to snapshotting"
        );
        assert!(err.is_conflict());
    }

    #[test]
    fn test_rpc_not_found_classification() {
        let err = SandplaneError::from(tonic::Status::not_found("gone"));
        assert!(err.is_not_found());
        assert!(!err.is_retryable());

        let err = SandplaneError::from(tonic::Status::unavailable("boom"));
        assert!(!err.is_not_found());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_lock_failure_is_retryable() {
        let err = SandplaneError::LockAcquisitionFailed("lock:sandbox:a:b".into());
        assert!(err.is_retryable());
        assert!(!err.is_not_found());
    }
}
