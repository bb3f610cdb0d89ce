//! Completion of a begun transition.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::coordinator::TransitionCoordinator;
use crate::runtime::types::SandboxKey;
use crate::sandbox::{SandboxState, StateAction};
use crate::store::TransitionDescriptor;
use crate::store::keys::{transition_key, transition_result_key};
use sandplane_shared::errors::SandplaneError;

/// Completes one transition, at most once.
///
/// Call [`TransitionFinalizer::finish`] with the outcome of the work the
/// transition guarded. Further calls are no-ops. If the finalizer is dropped
/// without being finished, it completes with success from a background task so
/// the descriptor never outlives its owner.
pub struct TransitionFinalizer {
    coordinator: TransitionCoordinator,
    key: SandboxKey,
    transition_id: String,
    action: StateAction,
    done: Arc<AtomicBool>,
}

impl TransitionFinalizer {
    pub(super) fn new(
        coordinator: TransitionCoordinator,
        key: SandboxKey,
        transition_id: String,
        action: StateAction,
    ) -> Self {
        Self {
            coordinator,
            key,
            transition_id,
            action,
            done: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn transition_id(&self) -> &str {
        &self.transition_id
    }

    pub fn action(&self) -> StateAction {
        self.action
    }

    pub fn is_finished(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Publish the outcome and clear the in-flight descriptor.
    ///
    /// Completion runs in its own task: once the first poll has claimed the
    /// finalizer, dropping this future no longer stops it.
    pub async fn finish(&self, error: Option<&SandplaneError>) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        let completion = tokio::spawn(complete(
            self.coordinator.clone(),
            self.key.clone(),
            self.transition_id.clone(),
            self.action,
            error.map(ToString::to_string),
        ));
        if let Err(e) = completion.await {
            tracing::error!(
                sandbox_id = %self.key.sandbox_id,
                transition_id = %self.transition_id,
                error = %e,
                "Transition completion task failed"
            );
        }
    }
}

impl Drop for TransitionFinalizer {
    fn drop(&mut self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                sandbox_id = %self.key.sandbox_id,
                transition_id = %self.transition_id,
                "Transition dropped outside runtime; descriptor left to expire"
            );
            return;
        };

        tracing::debug!(
            sandbox_id = %self.key.sandbox_id,
            transition_id = %self.transition_id,
            "Transition dropped unfinished, completing in background"
        );
        handle.spawn(complete(
            self.coordinator.clone(),
            self.key.clone(),
            std::mem::take(&mut self.transition_id),
            self.action,
            None,
        ));
    }
}

impl std::fmt::Debug for TransitionFinalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitionFinalizer")
            .field("sandbox_id", &self.key.sandbox_id)
            .field("transition_id", &self.transition_id)
            .field("action", &self.action.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}

async fn complete(
    coordinator: TransitionCoordinator,
    key: SandboxKey,
    transition_id: String,
    action: StateAction,
    error: Option<String>,
) {
    tracing::debug!(
        sandbox_id = %key.sandbox_id,
        transition_id = %transition_id,
        state = %action.target,
        error = ?error,
        "Transition complete"
    );
    match error {
        None => coordinator.metrics.record_transition_completed(),
        Some(_) => coordinator.metrics.record_transition_failed(),
    }

    let mut restore_error = None;
    if action.is_transient() && error.is_none() {
        let target = action.target;
        let restored = coordinator
            .update_sandbox(&key, move |sbx| {
                // Someone may have moved it on (e.g. a kill); leave that alone.
                if sbx.state == target {
                    sbx.state = SandboxState::Running;
                }
                Ok(())
            })
            .await;
        if let Err(e) = restored {
            tracing::error!(
                sandbox_id = %key.sandbox_id,
                transition_id = %transition_id,
                error = %e,
                "Failed to restore sandbox to running"
            );
            restore_error = Some(e);
        }
    }

    let result = match (restore_error, error) {
        (Some(e), _) => format!("failed to restore sandbox to running: {}", e),
        (None, _) if action.is_transient() => String::new(),
        (None, Some(message)) => message,
        (None, None) => String::new(),
    };

    let transition_key = transition_key(&key);
    let lock = match coordinator.locks.obtain(&transition_key).await {
        Ok(lock) => Some(lock),
        Err(e) => {
            tracing::warn!(
                sandbox_id = %key.sandbox_id,
                transition_id = %transition_id,
                error = %e,
                "Failed to obtain transition lock, publishing result anyway"
            );
            None
        }
    };

    let store = &coordinator.store;
    let result_key = transition_result_key(&key, &transition_id);
    // The result must be readable before the descriptor disappears.
    if let Err(e) = store
        .set_marker(&result_key, &result, coordinator.options.result_ttl)
        .await
    {
        tracing::warn!(
            sandbox_id = %key.sandbox_id,
            transition_id = %transition_id,
            error = %e,
            "Failed to set transition result"
        );
    }

    match owns_descriptor(&coordinator, &transition_key, &transition_id).await {
        Ok(true) => {
            if let Err(e) = store.delete_marker(&transition_key).await {
                tracing::warn!(
                    sandbox_id = %key.sandbox_id,
                    transition_id = %transition_id,
                    error = %e,
                    "Failed to delete transition descriptor"
                );
            }
        }
        Ok(false) => {
            tracing::warn!(
                sandbox_id = %key.sandbox_id,
                transition_id = %transition_id,
                "Transition descriptor expired before completion"
            );
        }
        Err(e) => {
            tracing::warn!(
                sandbox_id = %key.sandbox_id,
                transition_id = %transition_id,
                error = %e,
                "Failed to read transition descriptor"
            );
        }
    }

    if let Some(lock) = lock {
        coordinator.release(lock).await;
    }
}

/// Whether the descriptor under `transition_key` still belongs to
/// `transition_id`. A descriptor that expired and was replaced by a newer
/// transition must not be deleted.
async fn owns_descriptor(
    coordinator: &TransitionCoordinator,
    transition_key: &str,
    transition_id: &str,
) -> Result<bool, SandplaneError> {
    let Some(raw) = coordinator.store.get_marker(transition_key).await? else {
        return Ok(false);
    };
    Ok(TransitionDescriptor::decode(&raw)?.id == transition_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ControlPlaneMetricsStorage;
    use crate::runtime::options::{LockOptions, TransitionOptions};
    use crate::sandbox::Sandbox;
    use crate::store::MemoryStateStore;
    use crate::transition::TransitionStart;
    use futures::FutureExt;
    use uuid::Uuid;

    async fn started(
        action: StateAction,
    ) -> (TransitionCoordinator, SandboxKey, TransitionFinalizer) {
        let coord = TransitionCoordinator::new(
            Arc::new(MemoryStateStore::new()),
            LockOptions::default(),
            TransitionOptions::default(),
            Arc::new(ControlPlaneMetricsStorage::default()),
        );
        let sbx = Sandbox::new(Uuid::new_v4(), "sbx", "node-1", chrono::Duration::hours(1));
        coord.add_sandbox(&sbx).await.unwrap();
        let key = sbx.key();

        let TransitionStart::Started(finalizer) =
            coord.begin_transition(&key, action).await.unwrap()
        else {
            panic!("expected a started transition");
        };
        (coord, key, finalizer)
    }

    async fn result_of(coord: &TransitionCoordinator, key: &SandboxKey, id: &str) -> Option<String> {
        coord
            .store
            .get_marker(&transition_result_key(key, id))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_transient_success_restores_running() {
        let (coord, key, finalizer) = started(StateAction::SNAPSHOT).await;
        finalizer.finish(None).await;

        assert_eq!(coord.get_sandbox(&key).await.unwrap().state, SandboxState::Running);
        assert_eq!(
            result_of(&coord, &key, finalizer.transition_id()).await.as_deref(),
            Some("")
        );
    }

    #[tokio::test]
    async fn test_transient_failure_publishes_success_and_keeps_state() {
        let (coord, key, finalizer) = started(StateAction::SNAPSHOT).await;
        let err = SandplaneError::CheckpointFailed("boom".into());
        finalizer.finish(Some(&err)).await;

        assert_eq!(
            coord.get_sandbox(&key).await.unwrap().state,
            SandboxState::Snapshotting
        );
        assert_eq!(
            result_of(&coord, &key, finalizer.transition_id()).await.as_deref(),
            Some("")
        );
    }

    #[tokio::test]
    async fn test_terminal_failure_publishes_message() {
        let (coord, key, finalizer) = started(StateAction::KILL).await;
        let err = SandplaneError::Internal("node unreachable".into());
        finalizer.finish(Some(&err)).await;

        let result = result_of(&coord, &key, finalizer.transition_id()).await.unwrap();
        assert!(result.contains("node unreachable"));
    }

    #[tokio::test]
    async fn test_finish_twice_is_one_completion() {
        let (coord, key, finalizer) = started(StateAction::SNAPSHOT).await;
        finalizer.finish(None).await;

        // Move the record on; a second completion would try to restore it.
        coord
            .update_sandbox(&key, |sbx| {
                sbx.state = SandboxState::Snapshotting;
                Ok(())
            })
            .await
            .unwrap();
        finalizer
            .finish(Some(&SandplaneError::Internal("late".into())))
            .await;

        assert!(finalizer.is_finished());
        assert_eq!(
            coord.get_sandbox(&key).await.unwrap().state,
            SandboxState::Snapshotting
        );
        assert_eq!(
            result_of(&coord, &key, finalizer.transition_id()).await.as_deref(),
            Some("")
        );
        assert_eq!(coord.metrics.transitions_completed(), 1);
        assert_eq!(coord.metrics.transitions_failed(), 0);
    }

    #[tokio::test]
    async fn test_restore_skips_record_moved_elsewhere() {
        let (coord, key, finalizer) = started(StateAction::SNAPSHOT).await;
        coord
            .update_sandbox(&key, |sbx| {
                sbx.state = SandboxState::Killing;
                Ok(())
            })
            .await
            .unwrap();

        finalizer.finish(None).await;
        assert_eq!(coord.get_sandbox(&key).await.unwrap().state, SandboxState::Killing);
    }

    #[tokio::test]
    async fn test_restore_failure_is_published() {
        let (coord, key, finalizer) = started(StateAction::SNAPSHOT).await;
        coord.remove_record(&key).await.unwrap();

        finalizer.finish(None).await;
        let result = result_of(&coord, &key, finalizer.transition_id()).await.unwrap();
        assert!(result.starts_with("failed to restore sandbox to running"));
    }

    #[tokio::test]
    async fn test_finish_dropped_after_first_poll_still_completes() {
        let (coord, key, finalizer) = started(StateAction::KILL).await;
        let err = SandplaneError::Internal("node unreachable".into());

        // Poll once, then drop the future mid-completion.
        let _ = finalizer.finish(Some(&err)).now_or_never();
        assert!(finalizer.is_finished());

        let waited = coord.wait_for_state_change(&key).await.unwrap_err();
        assert!(matches!(waited, SandplaneError::TransitionFailed(_)));
        assert_eq!(coord.metrics.transitions_failed(), 1);
    }

    #[tokio::test]
    async fn test_dropped_finalizer_completes_in_background() {
        let (coord, key, finalizer) = started(StateAction::SNAPSHOT).await;
        drop(finalizer);

        coord.wait_for_state_change(&key).await.unwrap();
        assert_eq!(coord.get_sandbox(&key).await.unwrap().state, SandboxState::Running);
    }
}
