//! DeleteBackupRequest controller
//!
//! Tears a backup down completely: volume snapshots, restic snapshots and
//! their work items, the object storage directory, restores referencing
//! the backup, and finally the Backup object itself. Failures along the
//! way are recorded on the request, which still finishes Processed so the
//! operator sees exactly what remains.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use kube::api::{Api, DeleteParams, ListParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{error, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::api::{
    Backup, BackupPhase, DeleteBackupRequest, DeleteBackupRequestPhase,
    DeleteBackupRequestStatus, PodVolumeBackup, Restore, BACKUP_NAME_LABEL,
};
use crate::cloud::{BackupService, BlockStore};
use crate::controller::{patch_status, BackupTracker};
use crate::restic::RepositoryManager;
use crate::Error;

fn processed_request_max_age() -> chrono::Duration {
    chrono::Duration::hours(24)
}

/// Kubernetes access the deletion controller needs.
///
/// A trait so reconcile logic runs against a mock in tests while the
/// server wires in the real client. Deletes tolerate objects that are
/// already gone.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Patch a DeleteBackupRequest's status subresource
    async fn patch_request_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DeleteBackupRequestStatus,
    ) -> Result<(), Error>;

    /// Delete a DeleteBackupRequest
    async fn delete_request(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// A Backup by name; `None` when it does not exist
    async fn get_backup(&self, namespace: &str, name: &str) -> Result<Option<Backup>, Error>;

    /// Move a Backup into the given phase
    async fn set_backup_phase(
        &self,
        namespace: &str,
        name: &str,
        phase: BackupPhase,
    ) -> Result<(), Error>;

    /// Delete a Backup object
    async fn delete_backup(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// PodVolumeBackups matching a label selector
    async fn list_pod_volume_backups(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<PodVolumeBackup>, Error>;

    /// Delete a PodVolumeBackup
    async fn delete_pod_volume_backup(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Every Restore in the namespace
    async fn list_restores(&self, namespace: &str) -> Result<Vec<Restore>, Error>;

    /// Delete a Restore
    async fn delete_restore(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// [`KubeClient`] backed by the API server
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn ignore_not_found(result: Result<(), kube::Error>) -> Result<(), Error> {
    match result {
        Ok(()) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn patch_request_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DeleteBackupRequestStatus,
    ) -> Result<(), Error> {
        patch_status::<DeleteBackupRequest, _>(&self.client, namespace, name, status).await?;
        Ok(())
    }

    async fn delete_request(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<DeleteBackupRequest> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await.map(|_| ()))
    }

    async fn get_backup(&self, namespace: &str, name: &str) -> Result<Option<Backup>, Error> {
        let api: Api<Backup> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(backup) => Ok(Some(backup)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_backup_phase(
        &self,
        namespace: &str,
        name: &str,
        phase: BackupPhase,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({"phase": phase});
        patch_status::<Backup, _>(&self.client, namespace, name, &patch).await?;
        Ok(())
    }

    async fn delete_backup(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Backup> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await.map(|_| ()))
    }

    async fn list_pod_volume_backups(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<PodVolumeBackup>, Error> {
        let api: Api<PodVolumeBackup> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .list(&ListParams::default().labels(label_selector))
            .await?
            .items)
    }

    async fn delete_pod_volume_backup(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<PodVolumeBackup> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await.map(|_| ()))
    }

    async fn list_restores(&self, namespace: &str) -> Result<Vec<Restore>, Error> {
        let api: Api<Restore> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn delete_restore(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Restore> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await.map(|_| ()))
    }
}

/// Collaborators for the deletion controller
pub struct Context {
    /// API access
    pub kube: Arc<dyn KubeClient>,
    /// Artifact storage
    pub backup_service: Arc<BackupService>,
    /// Bucket holding artifacts
    pub bucket: String,
    /// Namespace holding Caravel resources
    pub namespace: String,
    /// Volume snapshot driver, when configured
    pub block_store: Option<Arc<dyn BlockStore>>,
    /// Restic repositories, when configured
    pub repo_manager: Option<Arc<RepositoryManager>>,
    /// In-progress guard shared with the backup controller
    pub tracker: Arc<BackupTracker>,
}

/// Reconcile one DeleteBackupRequest
pub async fn reconcile(
    request: Arc<DeleteBackupRequest>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let name = request.name_any();
    let namespace = request.namespace().unwrap_or_else(|| ctx.namespace.clone());
    let backup_name = request.spec.backup_name.clone();

    match request
        .status
        .as_ref()
        .map(|s| s.phase)
        .unwrap_or(DeleteBackupRequestPhase::New)
    {
        DeleteBackupRequestPhase::Processed => {
            // Processed requests hang around briefly for the operator,
            // then remove themselves.
            let age = request
                .metadata
                .creation_timestamp
                .as_ref()
                .map(|t| Utc::now() - t.0)
                .unwrap_or_else(chrono::Duration::zero);
            if age >= processed_request_max_age() {
                ctx.kube.delete_request(&namespace, &name).await?;
                return Ok(Action::await_change());
            }
            return Ok(Action::requeue(Duration::from_secs(60 * 60)));
        }
        DeleteBackupRequestPhase::InProgress => return Ok(Action::await_change()),
        DeleteBackupRequestPhase::New => {}
    }

    info!(request = %name, backup = %backup_name, "processing backup deletion");

    if ctx.tracker.contains(&namespace, &backup_name) {
        let status = DeleteBackupRequestStatus {
            phase: DeleteBackupRequestPhase::Processed,
            errors: vec![format!("backup {backup_name} is still in progress")],
        };
        ctx.kube
            .patch_request_status(&namespace, &name, &status)
            .await?;
        return Ok(Action::await_change());
    }

    ctx.kube
        .patch_request_status(
            &namespace,
            &name,
            &DeleteBackupRequestStatus {
                phase: DeleteBackupRequestPhase::InProgress,
                errors: Vec::new(),
            },
        )
        .await?;

    let errors = delete_backup(&ctx, &namespace, &backup_name).await;
    let status = DeleteBackupRequestStatus {
        phase: DeleteBackupRequestPhase::Processed,
        errors,
    };
    ctx.kube
        .patch_request_status(&namespace, &name, &status)
        .await?;

    Ok(Action::requeue(Duration::from_secs(60 * 60)))
}

async fn delete_backup(ctx: &Context, namespace: &str, backup_name: &str) -> Vec<String> {
    let mut errors = Vec::new();

    let backup = match ctx.kube.get_backup(namespace, backup_name).await {
        Ok(b) => b,
        Err(e) => {
            errors.push(format!("getting backup {backup_name}: {e}"));
            return errors;
        }
    };

    if let Some(backup) = &backup {
        if let Err(e) = ctx
            .kube
            .set_backup_phase(namespace, backup_name, BackupPhase::Deleting)
            .await
        {
            warn!(backup = %backup_name, error = %e, "failed to mark backup Deleting");
        }

        // Volume snapshots recorded in status.
        let volume_backups = backup
            .status
            .as_ref()
            .map(|s| s.volume_backups.clone())
            .unwrap_or_default();
        if !volume_backups.is_empty() {
            match &ctx.block_store {
                Some(store) => {
                    for (pv, info) in volume_backups {
                        if let Err(e) = store.delete_snapshot(&info.snapshot_id).await {
                            errors.push(format!(
                                "deleting snapshot {} for pv {pv}: {e}",
                                info.snapshot_id
                            ));
                        }
                    }
                }
                None => errors.push(
                    "backup has volume snapshots but no persistent volume provider is configured"
                        .to_string(),
                ),
            }
        }
    }

    // Restic snapshots, through the work items that produced them.
    if let Err(e) = delete_restic_snapshots(ctx, namespace, backup_name, &mut errors).await {
        errors.push(format!("deleting restic snapshots: {e}"));
    }

    // Everything under backups/<name>/ in the bucket.
    if let Err(e) = ctx
        .backup_service
        .delete_backup_dir(&ctx.bucket, backup_name)
        .await
    {
        errors.push(format!("deleting storage artifacts: {e}"));
    }

    // Restores of a deleted backup are meaningless; remove them.
    if let Err(e) = delete_associated_restores(ctx, namespace, backup_name).await {
        errors.push(format!("deleting restores: {e}"));
    }

    if backup.is_some() {
        if let Err(e) = ctx.kube.delete_backup(namespace, backup_name).await {
            errors.push(format!("deleting backup object: {e}"));
        }
    }

    errors
}

async fn delete_restic_snapshots(
    ctx: &Context,
    namespace: &str,
    backup_name: &str,
    errors: &mut Vec<String>,
) -> Result<(), Error> {
    let Some(repo_manager) = &ctx.repo_manager else {
        return Ok(());
    };

    let selector = format!("{BACKUP_NAME_LABEL}={backup_name}");
    let items = ctx.kube.list_pod_volume_backups(namespace, &selector).await?;

    for pvb in items {
        if let Some(snapshot_id) = pvb.status.as_ref().and_then(|s| s.snapshot_id.clone()) {
            let repo = pvb.spec.pod.namespace.clone();
            if let Err(e) = repo_manager.forget(&repo, &snapshot_id).await {
                errors.push(format!("forgetting restic snapshot {snapshot_id}: {e}"));
            }
        }
        if let Err(e) = ctx
            .kube
            .delete_pod_volume_backup(namespace, &pvb.name_any())
            .await
        {
            errors.push(format!("deleting pod volume backup: {e}"));
        }
    }
    Ok(())
}

async fn delete_associated_restores(
    ctx: &Context,
    namespace: &str,
    backup_name: &str,
) -> Result<(), Error> {
    for restore in ctx.kube.list_restores(namespace).await? {
        if restore.spec.backup_name != backup_name {
            continue;
        }
        ctx.kube
            .delete_restore(namespace, &restore.name_any())
            .await?;
        info!(restore = %restore.name_any(), "deleted restore of deleted backup");
    }
    Ok(())
}

/// Requeue failed reconciles with a short delay
pub fn error_policy(
    request: Arc<DeleteBackupRequest>,
    error: &Error,
    _ctx: Arc<Context>,
) -> Action {
    error!(request = %request.name_any(), error = %error, "deletion reconciliation failed");
    Action::requeue(Duration::from_secs(30))
}
