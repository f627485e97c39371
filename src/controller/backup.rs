//! Backup controller
//!
//! Drives a `Backup` through New → InProgress → Completed/Failed/
//! FailedValidation. Validation failures are terminal and never retried;
//! per-item pipeline failures still complete the backup, with the detail
//! in the uploaded log blob.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{error, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::api::{Backup, BackupPhase, BackupStatus};
use crate::backup::Backupper;
use crate::cloud::BackupService;
use crate::controller::{patch_status, BackupTracker};
use crate::plugin::PluginManager;
use crate::Error;

/// Kubernetes writes the backup controller makes.
///
/// A trait so reconcile logic runs against a mock in tests while the
/// server wires in the real client.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Patch a Backup's status subresource
    async fn patch_backup_status(
        &self,
        namespace: &str,
        name: &str,
        status: &BackupStatus,
    ) -> Result<(), Error>;
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

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn patch_backup_status(
        &self,
        namespace: &str,
        name: &str,
        status: &BackupStatus,
    ) -> Result<(), Error> {
        patch_status::<Backup, _>(&self.client, namespace, name, status).await?;
        Ok(())
    }
}

/// Collaborators for the backup controller
pub struct Context {
    /// Status writes
    pub kube: Arc<dyn KubeClient>,
    /// The backup pipeline
    pub backupper: Arc<Backupper>,
    /// Artifact storage
    pub backup_service: Arc<BackupService>,
    /// Bucket holding artifacts
    pub bucket: String,
    /// Whether a block store is configured
    pub snapshots_enabled: bool,
    /// Custom action source
    pub plugin_manager: Arc<PluginManager>,
    /// In-progress guard shared with the deletion controller
    pub tracker: Arc<BackupTracker>,
}

/// Reconcile one Backup
pub async fn reconcile(backup: Arc<Backup>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = backup.name_any();
    let namespace = backup.namespace().unwrap_or_default();

    let phase = backup
        .status
        .as_ref()
        .map(|s| s.phase)
        .unwrap_or(BackupPhase::New);
    if phase != BackupPhase::New {
        // Terminal phases are never re-reconciled; InProgress backups
        // belong to the worker already running them.
        return Ok(Action::await_change());
    }

    info!(backup = %name, "processing new backup");

    // Validation failures are user errors: mark and stop.
    let mut validation_errors = backup.spec.validate();
    if backup.spec.snapshot_volumes == Some(true) && !ctx.snapshots_enabled {
        validation_errors.push(
            "snapshotVolumes is true but no persistent volume provider is configured".to_string(),
        );
    }
    if !validation_errors.is_empty() {
        warn!(backup = %name, errors = ?validation_errors, "backup failed validation");
        let status = BackupStatus {
            phase: BackupPhase::FailedValidation,
            validation_errors,
            ..Default::default()
        };
        ctx.kube
            .patch_backup_status(&namespace, &name, &status)
            .await?;
        return Ok(Action::await_change());
    }

    let expiration = Utc::now() + backup.spec.ttl_duration();
    let status = BackupStatus {
        phase: BackupPhase::InProgress,
        expiration: Some(expiration),
        ..Default::default()
    };
    ctx.kube
        .patch_backup_status(&namespace, &name, &status)
        .await?;

    ctx.tracker.add(&namespace, &name);
    let outcome = run_backup(&backup, &namespace, &name, expiration, &ctx).await;
    ctx.tracker.remove(&namespace, &name);

    let final_status = match outcome {
        Ok(status) => status,
        Err(e) => {
            error!(backup = %name, error = %e, "backup failed");
            BackupStatus {
                phase: BackupPhase::Failed,
                expiration: Some(expiration),
                ..Default::default()
            }
        }
    };
    ctx.kube
        .patch_backup_status(&namespace, &name, &final_status)
        .await?;

    Ok(Action::await_change())
}

async fn run_backup(
    backup: &Backup,
    namespace: &str,
    name: &str,
    expiration: chrono::DateTime<chrono::Utc>,
    ctx: &Context,
) -> Result<BackupStatus, Error> {
    // Deep copy: the pipeline mutates status (volume snapshots, version)
    // and the informer cache must never see that.
    let mut working = backup.clone();
    working.status = Some(BackupStatus {
        phase: BackupPhase::InProgress,
        expiration: Some(expiration),
        ..Default::default()
    });

    let actions = ctx.plugin_manager.backup_item_actions();
    let mut archive = Vec::new();
    let mut log = Vec::new();

    let summary = ctx
        .backupper
        .backup(&mut working, &mut archive, &mut log, &actions)
        .await?;

    let mut status = working.status.take().unwrap_or_default();
    status.phase = BackupPhase::Completed;
    status.expiration = Some(expiration);
    if summary.errors > 0 {
        info!(
            backup = %name,
            errors = summary.errors,
            "backup completed with item errors; see the uploaded log"
        );
    }

    // The sidecar records the finalized object so a bucket listing alone
    // can reconstruct the cluster's backups.
    let mut finalized = working;
    finalized.status = Some(status.clone());
    finalized.metadata.namespace = Some(namespace.to_string());
    let metadata = serde_json::to_vec(&finalized)?;

    ctx.backup_service
        .upload_backup(&ctx.bucket, name, metadata, archive, log)
        .await?;

    Ok(status)
}

/// Requeue failed reconciles with a short delay
pub fn error_policy(backup: Arc<Backup>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(backup = %backup.name_any(), error = %error, "backup reconciliation failed");
    Action::requeue(Duration::from_secs(30))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::BackupSpec;
    use crate::client::MockDynamicClient;
    use crate::cloud::MockObjectStore;
    use crate::discovery::DiscoveryHelper;
    use crate::podexec::MockPodCommandExecutor;

    fn backupper() -> Arc<Backupper> {
        let mut dynamic = MockDynamicClient::new();
        dynamic.expect_list().returning(|_, _, _| Ok(Vec::new()));
        let mut exec = MockPodCommandExecutor::new();
        exec.expect_execute().returning(|_, _, _| Ok(()));
        Arc::new(Backupper::new(
            Arc::new(DiscoveryHelper::from_resources(Vec::new())),
            Arc::new(dynamic),
            Arc::new(exec),
            None,
            None,
            Vec::new(),
        ))
    }

    fn context(kube: MockKubeClient, store: MockObjectStore) -> Arc<Context> {
        Arc::new(Context {
            kube: Arc::new(kube),
            backupper: backupper(),
            backup_service: Arc::new(BackupService::new(Arc::new(store))),
            bucket: "bkt".to_string(),
            snapshots_enabled: false,
            plugin_manager: Arc::new(PluginManager::new()),
            tracker: Arc::new(BackupTracker::new()),
        })
    }

    fn backup_in_phase(phase: Option<BackupPhase>) -> Arc<Backup> {
        let mut backup = Backup::new("b1", BackupSpec::default());
        backup.metadata.namespace = Some("caravel".to_string());
        backup.status = phase.map(BackupStatus::with_phase);
        Arc::new(backup)
    }

    #[tokio::test]
    async fn new_backup_runs_to_completed_and_uploads() {
        let mut kube = MockKubeClient::new();
        kube.expect_patch_backup_status()
            .withf(|ns, name, status| {
                ns == "caravel" && name == "b1" && status.phase == BackupPhase::InProgress
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        kube.expect_patch_backup_status()
            .withf(|_, _, status| {
                status.phase == BackupPhase::Completed && status.expiration.is_some()
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut store = MockObjectStore::new();
        // metadata sidecar, archive, and log blob
        store.expect_put_object().times(3).returning(|_, _, _| Ok(()));

        let ctx = context(kube, store);
        let action = reconcile(backup_in_phase(None), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(!ctx.tracker.contains("caravel", "b1"));
    }

    #[tokio::test]
    async fn invalid_spec_becomes_failed_validation() {
        let mut kube = MockKubeClient::new();
        kube.expect_patch_backup_status()
            .withf(|_, _, status| {
                status.phase == BackupPhase::FailedValidation
                    && status.validation_errors.iter().any(|e| e.contains("snapshotVolumes"))
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let ctx = context(kube, MockObjectStore::new());
        let mut backup = Backup::new("b1", BackupSpec {
            snapshot_volumes: Some(true),
            ..Default::default()
        });
        backup.metadata.namespace = Some("caravel".to_string());

        let action = reconcile(Arc::new(backup), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn terminal_phases_are_never_reconciled_again() {
        // No mock expectations: any API write would panic the test.
        for phase in [
            BackupPhase::Completed,
            BackupPhase::Failed,
            BackupPhase::FailedValidation,
            BackupPhase::InProgress,
            BackupPhase::Deleting,
        ] {
            let ctx = context(MockKubeClient::new(), MockObjectStore::new());
            let backup = backup_in_phase(Some(phase));
            // Reconciling twice observes the same terminal state each time.
            assert_eq!(
                reconcile(backup.clone(), ctx.clone()).await.unwrap(),
                Action::await_change()
            );
            assert_eq!(
                reconcile(backup, ctx).await.unwrap(),
                Action::await_change()
            );
        }
    }
}
