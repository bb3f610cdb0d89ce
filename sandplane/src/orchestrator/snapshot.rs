//! Snapshot templates from running sandboxes.

use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use uuid::Uuid;

use super::node::CheckpointRequest;
use super::Orchestrator;
use super::templates::{BuildStatusUpdate, NewSnapshotBuild, NewSnapshotTemplate, SnapshotName};
use crate::runtime::types::SandboxKey;
use crate::sandbox::{Sandbox, SandboxState, StateAction};
use crate::transition::{TransitionFinalizer, TransitionStart};
use sandplane_shared::constants::DEFAULT_TAG;
use sandplane_shared::errors::{SandplaneError, SandplaneResult};

/// Where a snapshot build should land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotOptions {
    /// Set when the name resolved to a template the team already owns.
    pub existing_template_id: Option<String>,
    /// Alias to create for a new template. Needs `namespace`.
    pub alias: Option<String>,
    pub namespace: Option<String>,
    pub tag: String,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self {
            existing_template_id: None,
            alias: None,
            namespace: None,
            tag: DEFAULT_TAG.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotResult {
    pub template_id: String,
    pub build_id: Uuid,
}

impl Orchestrator {
    /// Turn an optional `alias[:tag]` name into [`SnapshotOptions`].
    ///
    /// A name that already aliases a template in `namespace` targets that
    /// template, so repeated snapshots under one name accumulate builds.
    pub async fn snapshot_options(
        &self,
        namespace: &str,
        name: Option<&str>,
    ) -> SandplaneResult<SnapshotOptions> {
        let Some(name) = name else {
            return Ok(SnapshotOptions::default());
        };

        let parsed = SnapshotName::parse(name)?;
        let existing_template_id = self
            .templates
            .find_template_by_alias(namespace, &parsed.alias)
            .await?;

        Ok(SnapshotOptions {
            existing_template_id,
            alias: Some(parsed.alias),
            namespace: Some(namespace.to_string()),
            tag: parsed.tag,
        })
    }

    /// Checkpoint a running sandbox into a template build.
    ///
    /// The sandbox is `Snapshotting` for the duration and back to `Running`
    /// afterwards. If the checkpoint fails, the sandbox is killed: its VM is in
    /// an unknown state and must not serve traffic again. Dropping the returned
    /// future while the checkpoint is in flight counts as such a failure.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the sandbox has no record
    /// - `InvalidStateTransition` if it cannot be snapshotted now, including
    ///   when another snapshot of it is in progress
    /// - `NodeNotFound` if its node is not registered
    /// - `CheckpointFailed` if the node could not checkpoint it
    pub async fn create_snapshot(
        &self,
        key: &SandboxKey,
        options: &SnapshotOptions,
    ) -> SandplaneResult<SnapshotResult> {
        let sandbox = self.coordinator.get_sandbox(key).await?;

        let finalizer = match self
            .coordinator
            .begin_transition(key, StateAction::SNAPSHOT)
            .await?
        {
            TransitionStart::Started(finalizer) => finalizer,
            TransitionStart::AlreadyInTargetState => {
                return Err(SandplaneError::InvalidStateTransition {
                    current: SandboxState::Snapshotting,
                    target: SandboxState::Snapshotting,
                });
            }
        };

        // The work runs detached so that a dropped caller cannot leave the
        // sandbox half-checkpointed. Dropping `_caller` closes `cancelled`,
        // which the task treats as a failed checkpoint.
        let (_caller, mut cancelled) = oneshot::channel::<()>();
        let orchestrator = self.clone();
        let options = options.clone();
        let task = tokio::spawn(async move {
            let result = orchestrator
                .run_snapshot(&sandbox, &options, &finalizer, &mut cancelled)
                .await;
            // No-op if the checkpoint path already finished it with an error.
            finalizer.finish(None).await;
            result
        });

        let result = task
            .await
            .map_err(|e| SandplaneError::Internal(format!("Snapshot task failed: {}", e)))?;

        if result.is_ok() {
            tracing::info!(sandbox_id = %key.sandbox_id, "Snapshot template completed");
        }
        result
    }

    async fn run_snapshot(
        &self,
        sandbox: &Sandbox,
        options: &SnapshotOptions,
        finalizer: &TransitionFinalizer,
        cancelled: &mut oneshot::Receiver<()>,
    ) -> SandplaneResult<SnapshotResult> {
        let node = self.node_for(sandbox)?;

        let build_id = self
            .templates
            .create_snapshot_build(&NewSnapshotBuild {
                team_id: sandbox.team_id,
                sandbox_id: sandbox.sandbox_id.clone(),
                base_template_id: sandbox.template_id.clone(),
                node_id: sandbox.node_id.clone(),
            })
            .await?;

        let template_id = match self.resolve_or_create_template(sandbox, build_id, options).await {
            Ok(template_id) => template_id,
            Err(e) => {
                self.fail_build(build_id, &e).await;
                return Err(e);
            }
        };

        // Nothing has touched the VM yet, so it can go back to Running.
        if matches!(cancelled.try_recv(), Err(TryRecvError::Closed)) {
            let err = SandplaneError::Internal("snapshot request cancelled".into());
            self.fail_build(build_id, &err).await;
            return Err(err);
        }

        let request = CheckpointRequest {
            sandbox_id: sandbox.sandbox_id.clone(),
            build_id,
        };
        let checkpoint = tokio::select! {
            outcome = node.checkpoint(request) => outcome,
            _ = &mut *cancelled => {
                tracing::warn!(
                    sandbox_id = %sandbox.sandbox_id,
                    build_id = %build_id,
                    "Snapshot cancelled during checkpoint"
                );
                Err(tonic::Status::cancelled("snapshot request cancelled"))
            }
        };

        if let Err(status) = checkpoint {
            let message = status.message().to_string();
            let err = SandplaneError::Rpc(status);
            self.metrics.record_snapshot_failed();
            self.fail_build(build_id, &err).await;

            // Leaves the record in Snapshotting but releases waiters, so the
            // kill below can move it on.
            finalizer.finish(Some(&err)).await;
            self.kill_after_failed_checkpoint(sandbox).await;

            return Err(SandplaneError::CheckpointFailed(message));
        }

        self.templates
            .update_build_status(&BuildStatusUpdate::uploaded(build_id))
            .await?;
        self.metrics.record_snapshot_created();

        Ok(SnapshotResult {
            template_id,
            build_id,
        })
    }

    async fn resolve_or_create_template(
        &self,
        sandbox: &Sandbox,
        build_id: Uuid,
        options: &SnapshotOptions,
    ) -> SandplaneResult<String> {
        if let Some(template_id) = &options.existing_template_id {
            self.templates
                .assign_build(template_id, build_id, &options.tag)
                .await?;
            return Ok(template_id.clone());
        }

        let template_id = self
            .templates
            .create_snapshot_template(&NewSnapshotTemplate {
                team_id: sandbox.team_id,
                sandbox_id: sandbox.sandbox_id.clone(),
                build_id,
                tag: options.tag.clone(),
            })
            .await?;

        if let (Some(alias), Some(namespace)) = (&options.alias, &options.namespace) {
            self.templates
                .create_alias(namespace, alias, &template_id)
                .await?;
        }

        Ok(template_id)
    }

    async fn fail_build(&self, build_id: Uuid, cause: &SandplaneError) {
        let update = BuildStatusUpdate::failed(build_id, cause.to_string());
        if let Err(e) = self.templates.update_build_status(&update).await {
            tracing::error!(build_id = %build_id, error = %e, "Failed to mark build as failed");
        }
    }

    /// Runs in its own task so a dropped caller cannot abort it.
    async fn kill_after_failed_checkpoint(&self, sandbox: &Sandbox) {
        self.metrics.record_compensating_kill();

        let orchestrator = self.clone();
        let target = sandbox.clone();
        let kill = tokio::spawn(async move {
            orchestrator
                .remove_sandbox(&target, StateAction::KILL)
                .await
        });

        match kill.await {
            Ok(Ok(())) => {
                tracing::info!(sandbox_id = %sandbox.sandbox_id, "Killed sandbox after failed checkpoint");
            }
            Ok(Err(e)) => {
                tracing::error!(
                    sandbox_id = %sandbox.sandbox_id,
                    error = %e,
                    "Error killing sandbox after failed checkpoint"
                );
            }
            Err(e) => {
                tracing::error!(
                    sandbox_id = %sandbox.sandbox_id,
                    error = %e,
                    "Kill task after failed checkpoint did not complete"
                );
            }
        }
    }
}
