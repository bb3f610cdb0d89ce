//! Pause and kill.

use super::Orchestrator;
use super::node::PauseRequest;
use crate::sandbox::{Sandbox, StateAction, TransitionEffect};
use crate::transition::TransitionStart;
use sandplane_shared::errors::{SandplaneError, SandplaneResult};

impl Orchestrator {
    /// Pause the sandbox: stop it on its node, keeping it resumable.
    pub async fn pause_sandbox(&self, sandbox: &Sandbox) -> SandplaneResult<()> {
        self.remove_sandbox(sandbox, StateAction::PAUSE).await
    }

    /// Kill the sandbox: stop it on its node and discard it.
    pub async fn kill_sandbox(&self, sandbox: &Sandbox) -> SandplaneResult<()> {
        self.remove_sandbox(sandbox, StateAction::KILL).await
    }

    /// Take a sandbox out of service with a terminal `action`.
    ///
    /// Repeating a removal that already happened (or is happening) succeeds
    /// once the first one settles. A removal requested mid-snapshot waits for
    /// the snapshot before it starts.
    ///
    /// The record and catalog entry are removed once the node has been asked
    /// to stop the VM, whatever it answered: a failed stop leaves the VM
    /// stopped on the node side.
    pub async fn remove_sandbox(
        &self,
        sandbox: &Sandbox,
        action: StateAction,
    ) -> SandplaneResult<()> {
        if action.effect != TransitionEffect::Expires {
            return Err(SandplaneError::InvalidArgument(format!(
                "{} is not a removal action",
                action
            )));
        }

        let key = sandbox.key();
        let finalizer = match self.coordinator.begin_transition(&key, action).await? {
            TransitionStart::Started(finalizer) => finalizer,
            TransitionStart::AlreadyInTargetState => {
                tracing::debug!(
                    sandbox_id = %sandbox.sandbox_id,
                    action = action.name,
                    "Sandbox already being removed"
                );
                return Ok(());
            }
        };

        let outcome = self.stop_on_node(sandbox, action).await;
        if let Err(e) = &outcome {
            tracing::warn!(
                sandbox_id = %sandbox.sandbox_id,
                action = action.name,
                error = %e,
                "Node failed to stop sandbox"
            );
        }

        match self.coordinator.remove_record(&key).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(sandbox_id = %sandbox.sandbox_id, "Sandbox record already gone");
            }
            Err(e) => {
                tracing::error!(
                    sandbox_id = %sandbox.sandbox_id,
                    error = %e,
                    "Failed to remove sandbox record"
                );
            }
        }

        if let Some(catalog) = &self.catalog {
            if let Err(e) = catalog
                .delete_sandbox(&sandbox.sandbox_id, &sandbox.execution_id)
                .await
            {
                tracing::warn!(
                    sandbox_id = %sandbox.sandbox_id,
                    error = %e,
                    "Failed to remove sandbox from catalog"
                );
            }
        }

        finalizer.finish(outcome.as_ref().err()).await;

        if outcome.is_ok() {
            tracing::info!(
                sandbox_id = %sandbox.sandbox_id,
                action = action.name,
                "Removed sandbox"
            );
        }
        outcome
    }

    async fn stop_on_node(&self, sandbox: &Sandbox, action: StateAction) -> SandplaneResult<()> {
        let node = self.node_for(sandbox)?;
        if action == StateAction::PAUSE {
            node.pause(PauseRequest {
                sandbox_id: sandbox.sandbox_id.clone(),
                execution_id: sandbox.execution_id.clone(),
                template_id: sandbox.template_id.clone(),
                build_id: sandbox.build_id,
            })
            .await?;
        } else {
            node.kill(&sandbox.sandbox_id).await?;
        }
        Ok(())
    }
}
