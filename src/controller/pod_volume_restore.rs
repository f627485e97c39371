//! PodVolumeRestore controller (node agent)
//!
//! Completes the restore handshake: once the restored pod is scheduled on
//! this agent's node and its wait init container is running, restic
//! restores the recorded snapshot into the pod's staging directory and
//! the completion helper moves the data into the volume's on-host
//! directory and signals the init container to exit.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info};

use crate::api::{PodVolumePhase, PodVolumeRestore, PodVolumeRestoreStatus};
use crate::controller::pod_volume_backup::resolve_volume_directory;
use crate::controller::AgentClient;
use crate::restic::{self, CommandRunner, INIT_CONTAINER};
use crate::Error;

/// Collaborators for the agent-side restore controller
pub struct Context {
    /// API access
    pub kube: Arc<dyn AgentClient>,
    /// The node this agent runs on
    pub node_name: String,
    /// Namespace holding Caravel resources
    pub namespace: String,
    /// Restic executor
    pub runner: Arc<dyn CommandRunner>,
}

/// Whether the pod is parked in the wait init container, ready for its
/// volumes to be repopulated
pub fn pod_is_waiting(pod: &Pod) -> bool {
    let first_is_wait = pod
        .spec
        .as_ref()
        .and_then(|s| s.init_containers.as_ref())
        .and_then(|c| c.first())
        .map(|c| c.name == INIT_CONTAINER)
        .unwrap_or(false);
    if !first_is_wait {
        return false;
    }
    pod.status
        .as_ref()
        .and_then(|s| s.init_container_statuses.as_ref())
        .and_then(|s| s.first())
        .and_then(|s| s.state.as_ref())
        .map(|s| s.running.is_some())
        .unwrap_or(false)
}

/// UID of the Restore controlling this work item, from its owner
/// references. The completion helper uses it to signal the right wait
/// init container.
pub fn restore_uid(pvr: &PodVolumeRestore) -> Option<String> {
    pvr.metadata
        .owner_references
        .as_ref()?
        .iter()
        .find(|owner| owner.controller == Some(true))
        .map(|owner| owner.uid.clone())
}

/// Reconcile one PodVolumeRestore
pub async fn reconcile(pvr: Arc<PodVolumeRestore>, ctx: Arc<Context>) -> Result<Action, Error> {
    let phase = pvr
        .status
        .as_ref()
        .map(|s| s.phase)
        .unwrap_or(PodVolumePhase::New);
    if phase != PodVolumePhase::New {
        return Ok(Action::await_change());
    }

    let name = pvr.name_any();
    let namespace = pvr.namespace().unwrap_or_else(|| ctx.namespace.clone());
    let pod_ref = &pvr.spec.pod;

    let Some(pod) = ctx.kube.get_pod(&pod_ref.namespace, &pod_ref.name).await? else {
        // The pod may not have been created yet; check back.
        return Ok(Action::requeue(Duration::from_secs(10)));
    };

    let node = pod
        .spec
        .as_ref()
        .and_then(|s| s.node_name.clone())
        .unwrap_or_default();
    if node != ctx.node_name {
        // Not scheduled here (or not scheduled yet); this agent either
        // never owns it or should look again once the scheduler decides.
        if node.is_empty() {
            return Ok(Action::requeue(Duration::from_secs(10)));
        }
        return Ok(Action::await_change());
    }

    if !pod_is_waiting(&pod) {
        debug!(item = %name, "pod not yet parked in wait init container");
        return Ok(Action::requeue(Duration::from_secs(10)));
    }

    info!(item = %name, volume = %pvr.spec.volume, "processing pod volume restore");

    ctx.kube
        .patch_pod_volume_restore_status(
            &namespace,
            &name,
            &PodVolumeRestoreStatus {
                phase: PodVolumePhase::InProgress,
                ..Default::default()
            },
        )
        .await?;

    match run_restore(&pvr, &pod, &ctx).await {
        Ok(()) => {
            ctx.kube
                .patch_pod_volume_restore_status(
                    &namespace,
                    &name,
                    &PodVolumeRestoreStatus {
                        phase: PodVolumePhase::Completed,
                        message: None,
                    },
                )
                .await?;
        }
        Err(e) => {
            error!(item = %name, error = %e, "pod volume restore failed");
            ctx.kube
                .patch_pod_volume_restore_status(
                    &namespace,
                    &name,
                    &PodVolumeRestoreStatus {
                        phase: PodVolumePhase::Failed,
                        message: Some(e.to_string()),
                    },
                )
                .await?;
        }
    }

    Ok(Action::await_change())
}

async fn run_restore(pvr: &PodVolumeRestore, pod: &Pod, ctx: &Context) -> Result<(), Error> {
    let pod_ref = &pvr.spec.pod;
    let pod_uid = pod
        .metadata
        .uid
        .clone()
        .ok_or_else(|| Error::restic("restored pod has no uid"))?;
    let owning_restore_uid = restore_uid(pvr)
        .ok_or_else(|| Error::restic("work item has no controlling Restore owner reference"))?;

    // The helper moves data into the volume's on-host directory, so it
    // needs the resolved directory name, not the volume's display name.
    let volume_dir =
        resolve_volume_directory(ctx.kube.as_ref(), pod, &pod_ref.namespace, &pvr.spec.volume)
            .await?;

    let key = ctx.kube.repository_key(&pod_ref.namespace).await?;
    let credentials = restic::password_tempfile(&key)?;

    let cmd = restic::command::restore_command(
        &pvr.spec.repo_prefix,
        &pod_ref.namespace,
        credentials.path(),
        &pod_uid,
        &pvr.spec.snapshot_id,
    );
    let output = ctx.runner.run(&cmd).await?;
    if !output.success {
        return Err(Error::restic(format!(
            "restic restore failed: {}",
            output.stderr
        )));
    }

    // Hand off to the completion helper: it moves the staged data into
    // the volume and drops the marker the wait init container watches.
    let args = vec![pod_uid, volume_dir, owning_restore_uid];
    let output = ctx.runner.run_raw("/complete-restore.sh", &args).await?;
    if !output.success {
        return Err(Error::restic(format!(
            "completion helper failed: {}",
            output.stderr
        )));
    }
    Ok(())
}

/// Requeue failed reconciles with a short delay
pub fn error_policy(pvr: Arc<PodVolumeRestore>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(item = %pvr.name_any(), error = %error, "pod volume restore reconciliation failed");
    Action::requeue(Duration::from_secs(15))
}
