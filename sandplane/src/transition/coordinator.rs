//! Begin-transition protocol.

use std::sync::Arc;

use uuid::Uuid;

use super::finalizer::TransitionFinalizer;
use super::lock::{DistributedLock, LockService};
use crate::metrics::ControlPlaneMetricsStorage;
use crate::runtime::options::{LockOptions, TransitionOptions};
use crate::runtime::types::SandboxKey;
use crate::sandbox::{Sandbox, StateAction, TransitionEffect};
use crate::store::keys::{sandbox_key, transition_key, transition_result_key};
use crate::store::{StateStore, TransitionCommit, TransitionDescriptor};
use sandplane_shared::errors::{SandplaneError, SandplaneResult};

/// Outcome of [`TransitionCoordinator::begin_transition`].
#[derive(Debug)]
pub enum TransitionStart {
    /// The record already is (or has just been moved) in the requested state
    /// by someone else. Nothing to finalize.
    AlreadyInTargetState,
    /// This caller owns the transition and must finish it.
    Started(TransitionFinalizer),
}

impl TransitionStart {
    pub fn is_already_in_target_state(&self) -> bool {
        matches!(self, TransitionStart::AlreadyInTargetState)
    }
}

/// What the locked section decided.
enum Attempt {
    Done(TransitionStart),
    /// Another transition is in flight; wait for it, then either report
    /// "already done" (same target) or start over.
    Wait {
        transition_id: String,
        same_target: bool,
    },
}

/// Coordinates exclusive state changes on sandbox records.
///
/// Every mutation of a record happens under the sandbox lock. The lock is
/// never held while waiting for another caller's transition; waiters poll the
/// descriptor instead.
#[derive(Clone)]
pub struct TransitionCoordinator {
    pub(super) store: Arc<dyn StateStore>,
    pub(super) locks: LockService,
    pub(super) options: TransitionOptions,
    pub(super) metrics: Arc<ControlPlaneMetricsStorage>,
}

impl TransitionCoordinator {
    pub fn new(
        store: Arc<dyn StateStore>,
        lock_options: LockOptions,
        options: TransitionOptions,
        metrics: Arc<ControlPlaneMetricsStorage>,
    ) -> Self {
        Self {
            locks: LockService::new(Arc::clone(&store), lock_options),
            store,
            options,
            metrics,
        }
    }

    /// Register a freshly started sandbox.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if a record with the same key is present.
    pub async fn add_sandbox(&self, sandbox: &Sandbox) -> SandplaneResult<()> {
        self.store.insert_sandbox(sandbox).await?;
        tracing::debug!(
            sandbox_id = %sandbox.sandbox_id,
            node_id = %sandbox.node_id,
            "Added sandbox record"
        );
        Ok(())
    }

    pub async fn get_sandbox(&self, key: &SandboxKey) -> SandplaneResult<Sandbox> {
        self.store
            .get_sandbox(key)
            .await?
            .ok_or_else(|| SandplaneError::NotFound(key.sandbox_id.clone()))
    }

    /// Read-modify-write a record under the sandbox lock.
    ///
    /// Returns the record as written. `update` may bail out with an error, in
    /// which case nothing is written.
    pub async fn update_sandbox<F>(&self, key: &SandboxKey, update: F) -> SandplaneResult<Sandbox>
    where
        F: FnOnce(&mut Sandbox) -> SandplaneResult<()> + Send,
    {
        let lock = self.locks.obtain(&sandbox_key(key)).await?;

        let result = async {
            let mut sandbox = self.get_sandbox(key).await?;
            update(&mut sandbox)?;
            self.store.put_sandbox(&sandbox).await?;
            Ok::<_, SandplaneError>(sandbox)
        }
        .await;

        self.release(lock).await;
        result
    }

    /// Delete a record. Returns whether it existed.
    pub async fn remove_record(&self, key: &SandboxKey) -> SandplaneResult<bool> {
        let lock = self.locks.obtain(&sandbox_key(key)).await?;
        let result = self.store.remove_sandbox(key).await;
        self.release(lock).await;
        result
    }

    /// Begin moving a sandbox to `action.target`.
    ///
    /// If another transition is in flight, waits for it without holding the
    /// lock. A transition to the same target counts as done once it settles;
    /// one to a different target is waited out and the request re-evaluated
    /// against the resulting record.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the record does not exist
    /// - `InvalidStateTransition` if the matrix forbids the move
    /// - `LockAcquisitionFailed` if the sandbox lock stays contended
    /// - `TransitionFailed` if the awaited transition published a failure
    pub async fn begin_transition(
        &self,
        key: &SandboxKey,
        action: StateAction,
    ) -> SandplaneResult<TransitionStart> {
        loop {
            let lock = self.locks.obtain(&sandbox_key(key)).await?;
            let attempt = self.try_begin(key, action).await;
            self.release(lock).await;

            match attempt? {
                Attempt::Done(start) => return Ok(start),
                Attempt::Wait {
                    transition_id,
                    same_target,
                } => {
                    tracing::debug!(
                        sandbox_id = %key.sandbox_id,
                        transition_id = %transition_id,
                        state = %action.target,
                        same_target,
                        "Transition in progress, waiting"
                    );
                    self.wait_for_transition(key, &transition_id).await?;
                    if same_target {
                        return Ok(TransitionStart::AlreadyInTargetState);
                    }
                }
            }
        }
    }

    /// The part of `begin_transition` that runs under the sandbox lock.
    async fn try_begin(&self, key: &SandboxKey, action: StateAction) -> SandplaneResult<Attempt> {
        let sandbox = self.get_sandbox(key).await?;
        let transition_key = transition_key(key);

        if let Some(raw) = self.store.get_marker(&transition_key).await? {
            let in_flight = TransitionDescriptor::decode(&raw)?;
            let same_target = in_flight.target == action.target;
            if !same_target && !sandbox.state.can_transition_to(action.target) {
                return Err(SandplaneError::InvalidStateTransition {
                    current: sandbox.state,
                    target: action.target,
                });
            }
            return Ok(Attempt::Wait {
                transition_id: in_flight.id,
                same_target,
            });
        }

        if sandbox.state == action.target {
            tracing::debug!(
                sandbox_id = %key.sandbox_id,
                state = %action.target,
                "Already in the requested state"
            );
            return Ok(Attempt::Done(TransitionStart::AlreadyInTargetState));
        }

        if !sandbox.state.can_transition_to(action.target) {
            return Err(SandplaneError::InvalidStateTransition {
                current: sandbox.state,
                target: action.target,
            });
        }

        let mut updated = sandbox;
        updated.state = action.target;
        if action.effect == TransitionEffect::Expires {
            updated.mark_expiring();
        }

        let descriptor = TransitionDescriptor {
            id: Uuid::new_v4().to_string(),
            target: action.target,
        };
        let encoded = descriptor.encode()?;
        let result_key = transition_result_key(key, &descriptor.id);

        self.store
            .commit_transition(&TransitionCommit {
                sandbox: &updated,
                transition_key: &transition_key,
                descriptor: &encoded,
                transition_ttl: self.options.ttl,
                result_key: &result_key,
                result_ttl: self.options.result_ttl,
            })
            .await?;

        self.metrics.record_transition_started();
        tracing::debug!(
            sandbox_id = %key.sandbox_id,
            transition_id = %descriptor.id,
            state = %action.target,
            "Started state transition"
        );

        Ok(Attempt::Done(TransitionStart::Started(
            TransitionFinalizer::new(self.clone(), key.clone(), descriptor.id, action),
        )))
    }

    pub(super) async fn release(&self, lock: DistributedLock) {
        let key = lock.key().to_string();
        if let Err(e) = lock.release().await {
            tracing::error!(lock = %key, error = %e, "Failed to release lock");
        }
    }
}

impl std::fmt::Debug for TransitionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitionCoordinator")
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxState;
    use crate::store::MemoryStateStore;
    use std::time::Duration;

    fn coordinator() -> TransitionCoordinator {
        TransitionCoordinator::new(
            Arc::new(MemoryStateStore::new()),
            LockOptions::default(),
            TransitionOptions {
                poll_interval: Duration::from_millis(10),
                ..TransitionOptions::default()
            },
            Arc::new(ControlPlaneMetricsStorage::default()),
        )
    }

    async fn add_in_state(coord: &TransitionCoordinator, state: SandboxState) -> SandboxKey {
        let mut sbx = Sandbox::new(Uuid::new_v4(), "sbx", "node-1", chrono::Duration::hours(1));
        sbx.state = state;
        coord.add_sandbox(&sbx).await.unwrap();
        sbx.key()
    }

    #[tokio::test]
    async fn test_missing_record_is_not_found() {
        let coord = coordinator();
        let key = SandboxKey::new(Uuid::new_v4(), "missing");

        let err = coord
            .begin_transition(&key, StateAction::KILL)
            .await
            .unwrap_err();
        assert!(matches!(err, SandplaneError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_begin_writes_state_and_descriptor() {
        let coord = coordinator();
        let key = add_in_state(&coord, SandboxState::Running).await;

        let start = coord.begin_transition(&key, StateAction::PAUSE).await.unwrap();
        let TransitionStart::Started(finalizer) = start else {
            panic!("expected a started transition");
        };

        let sbx = coord.get_sandbox(&key).await.unwrap();
        assert_eq!(sbx.state, SandboxState::Pausing);
        assert!(sbx.is_expired());

        let raw = coord.store.get_marker(&transition_key(&key)).await.unwrap().unwrap();
        let descriptor = TransitionDescriptor::decode(&raw).unwrap();
        assert_eq!(descriptor.id, finalizer.transition_id());
        assert_eq!(descriptor.target, SandboxState::Pausing);

        finalizer.finish(None).await;
        assert!(coord.store.get_marker(&transition_key(&key)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_every_forbidden_pair_is_rejected() {
        for from in SandboxState::ALL {
            for action in [StateAction::PAUSE, StateAction::KILL, StateAction::SNAPSHOT] {
                if from == action.target || from.can_transition_to(action.target) {
                    continue;
                }
                let coord = coordinator();
                let key = add_in_state(&coord, from).await;
                let before = coord.get_sandbox(&key).await.unwrap();

                let err = coord.begin_transition(&key, action).await.unwrap_err();
                assert!(
                    matches!(
                        err,
                        SandplaneError::InvalidStateTransition { current, target }
                            if current == from && target == action.target
                    ),
                    "{} -> {}",
                    from,
                    action.target
                );
                assert_eq!(coord.get_sandbox(&key).await.unwrap(), before);
            }
        }
    }

    #[tokio::test]
    async fn test_same_state_short_circuits() {
        let coord = coordinator();
        let key = add_in_state(&coord, SandboxState::Killing).await;

        let start = coord.begin_transition(&key, StateAction::KILL).await.unwrap();
        assert!(start.is_already_in_target_state());
    }

    #[tokio::test]
    async fn test_update_sandbox_error_writes_nothing() {
        let coord = coordinator();
        let key = add_in_state(&coord, SandboxState::Running).await;

        let err = coord
            .update_sandbox(&key, |sbx| {
                sbx.state = SandboxState::Killing;
                Err(SandplaneError::Internal("nope".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SandplaneError::Internal(_)));
        assert_eq!(
            coord.get_sandbox(&key).await.unwrap().state,
            SandboxState::Running
        );
    }

    #[tokio::test]
    async fn test_forbidden_target_fails_fast_while_other_transition_runs() {
        let coord = coordinator();
        let key = add_in_state(&coord, SandboxState::Running).await;

        let TransitionStart::Started(pause) =
            coord.begin_transition(&key, StateAction::PAUSE).await.unwrap()
        else {
            panic!("expected a started transition");
        };

        // Pausing -> Snapshotting can never become valid; don't wait for it.
        let err = coord
            .begin_transition(&key, StateAction::SNAPSHOT)
            .await
            .unwrap_err();
        assert!(matches!(err, SandplaneError::InvalidStateTransition { .. }));

        pause.finish(None).await;
    }
}
