//! Waiting for another caller's transition to settle.

use super::coordinator::TransitionCoordinator;
use crate::runtime::types::SandboxKey;
use crate::store::TransitionDescriptor;
use crate::store::keys::{transition_key, transition_result_key};
use sandplane_shared::errors::{SandplaneError, SandplaneResult};

impl TransitionCoordinator {
    /// Wait for whatever transition is in flight on `key`, if any.
    ///
    /// Returns immediately when nothing is in flight. Dropping the returned
    /// future stops waiting without affecting the transition itself.
    ///
    /// # Errors
    ///
    /// - `TransitionFailed` if the transition published a failure
    /// - `Timeout` if it does not settle within the configured wait timeout
    pub async fn wait_for_state_change(&self, key: &SandboxKey) -> SandplaneResult<()> {
        match self.current_descriptor(key).await? {
            Some(descriptor) => self.wait_for_transition(key, &descriptor.id).await,
            None => {
                tracing::trace!(sandbox_id = %key.sandbox_id, "No ongoing transition");
                Ok(())
            }
        }
    }

    /// Wait until transition `transition_id` is no longer the one in flight,
    /// then report its published result.
    pub(super) async fn wait_for_transition(
        &self,
        key: &SandboxKey,
        transition_id: &str,
    ) -> SandplaneResult<()> {
        let poll = async {
            loop {
                match self.current_descriptor(key).await? {
                    Some(descriptor) if descriptor.id == transition_id => {
                        tokio::time::sleep(self.options.poll_interval).await;
                    }
                    // Gone, or a newer transition replaced it.
                    _ => return self.check_result(key, transition_id).await,
                }
            }
        };

        tokio::time::timeout(self.options.wait_timeout, poll)
            .await
            .map_err(|_| {
                SandplaneError::Timeout(format!(
                    "transition {} on sandbox {} did not finish within {:?}",
                    transition_id, key.sandbox_id, self.options.wait_timeout
                ))
            })?
    }

    async fn current_descriptor(
        &self,
        key: &SandboxKey,
    ) -> SandplaneResult<Option<TransitionDescriptor>> {
        self.store
            .get_marker(&transition_key(key))
            .await?
            .map(|raw| TransitionDescriptor::decode(&raw))
            .transpose()
    }

    /// An expired (absent) result counts as success.
    async fn check_result(&self, key: &SandboxKey, transition_id: &str) -> SandplaneResult<()> {
        let result = self
            .store
            .get_marker(&transition_result_key(key, transition_id))
            .await?;

        match result {
            Some(message) if !message.is_empty() => Err(SandplaneError::TransitionFailed(message)),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use uuid::Uuid;

    use crate::metrics::ControlPlaneMetricsStorage;
    use crate::runtime::options::{LockOptions, TransitionOptions};
    use crate::sandbox::{Sandbox, StateAction};
    use crate::store::MemoryStateStore;
    use crate::transition::{TransitionCoordinator, TransitionStart};
    use sandplane_shared::errors::SandplaneError;

    fn coordinator(options: TransitionOptions) -> TransitionCoordinator {
        TransitionCoordinator::new(
            Arc::new(MemoryStateStore::new()),
            LockOptions::default(),
            options,
            Arc::new(ControlPlaneMetricsStorage::default()),
        )
    }

    fn fast_options() -> TransitionOptions {
        TransitionOptions {
            poll_interval: Duration::from_millis(10),
            ..TransitionOptions::default()
        }
    }

    async fn add(coord: &TransitionCoordinator) -> crate::runtime::types::SandboxKey {
        let sbx = Sandbox::new(Uuid::new_v4(), "sbx", "node-1", chrono::Duration::hours(1));
        coord.add_sandbox(&sbx).await.unwrap();
        sbx.key()
    }

    #[tokio::test]
    async fn test_no_transition_returns_immediately() {
        let coord = coordinator(fast_options());
        let key = add(&coord).await;
        coord.wait_for_state_change(&key).await.unwrap();
    }

    #[tokio::test]
    async fn test_waiter_sees_failure_message() {
        let coord = coordinator(fast_options());
        let key = add(&coord).await;
        let TransitionStart::Started(kill) =
            coord.begin_transition(&key, StateAction::KILL).await.unwrap()
        else {
            panic!("expected a started transition");
        };

        let waiter = {
            let coord = coord.clone();
            let key = key.clone();
            tokio::spawn(async move { coord.wait_for_state_change(&key).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        kill.finish(Some(&SandplaneError::Internal("node gone".into())))
            .await;

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, SandplaneError::TransitionFailed(ref m) if m.contains("node gone")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_is_bounded() {
        let coord = coordinator(TransitionOptions {
            wait_timeout: Duration::from_secs(1),
            ..fast_options()
        });
        let key = add(&coord).await;
        let TransitionStart::Started(kill) =
            coord.begin_transition(&key, StateAction::KILL).await.unwrap()
        else {
            panic!("expected a started transition");
        };

        let err = coord.wait_for_state_change(&key).await.unwrap_err();
        assert!(matches!(err, SandplaneError::Timeout(_)));
        assert!(!kill.is_finished());
        kill.finish(None).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_result_counts_as_success() {
        let coord = coordinator(TransitionOptions {
            result_ttl: Duration::from_millis(50),
            ..fast_options()
        });
        let key = add(&coord).await;
        let TransitionStart::Started(kill) =
            coord.begin_transition(&key, StateAction::KILL).await.unwrap()
        else {
            panic!("expected a started transition");
        };
        let id = kill.transition_id().to_string();
        kill.finish(Some(&SandplaneError::Internal("ignored once expired".into())))
            .await;

        tokio::time::advance(Duration::from_millis(100)).await;
        coord.wait_for_transition(&key, &id).await.unwrap();
    }
}
