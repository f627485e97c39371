//! Restore controller
//!
//! Drives a `Restore` through New → InProgress → Completed/
//! FailedValidation. The referenced backup is resolved from the cluster
//! first and from the bucket second, so restores work on a cluster that
//! has only just been pointed at existing storage.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use kube::api::{Api, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use std::io::Write as _;
use tracing::{error, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::api::{Backup, Restore, RestorePhase, RestoreStatus};
use crate::cloud::{BackupService, CachedBackupService};
use crate::controller::patch_status;
use crate::plugin::PluginManager;
use crate::restore::Restorer;
use crate::Error;

/// Kubernetes access the restore controller needs.
///
/// A trait so reconcile logic runs against a mock in tests while the
/// server wires in the real client.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Patch a Restore's status subresource
    async fn patch_restore_status(
        &self,
        namespace: &str,
        name: &str,
        status: &RestoreStatus,
    ) -> Result<(), Error>;

    /// A Backup by name; `None` when it does not exist
    async fn get_backup(&self, namespace: &str, name: &str) -> Result<Option<Backup>, Error>;

    /// Create a Backup object (re-materialized from the bucket)
    async fn create_backup(&self, namespace: &str, backup: &Backup) -> Result<Backup, Error>;
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
    async fn patch_restore_status(
        &self,
        namespace: &str,
        name: &str,
        status: &RestoreStatus,
    ) -> Result<(), Error> {
        patch_status::<Restore, _>(&self.client, namespace, name, status).await?;
        Ok(())
    }

    async fn get_backup(&self, namespace: &str, name: &str) -> Result<Option<Backup>, Error> {
        let api: Api<Backup> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(backup) => Ok(Some(backup)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_backup(&self, namespace: &str, backup: &Backup) -> Result<Backup, Error> {
        let api: Api<Backup> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), backup).await?)
    }
}

/// Collaborators for the restore controller
pub struct Context {
    /// API access
    pub kube: Arc<dyn KubeClient>,
    /// The restore pipeline
    pub restorer: Arc<Restorer>,
    /// Artifact storage, cached for listings
    pub backup_service: Arc<CachedBackupService>,
    /// Bucket holding artifacts
    pub bucket: String,
    /// Namespace holding Caravel resources
    pub namespace: String,
    /// Whether a block store is configured
    pub snapshots_enabled: bool,
    /// Custom action source
    pub plugin_manager: Arc<PluginManager>,
}

/// Reconcile one Restore
pub async fn reconcile(restore: Arc<Restore>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = restore.name_any();
    let namespace = restore.namespace().unwrap_or_else(|| ctx.namespace.clone());

    let phase = restore
        .status
        .as_ref()
        .map(|s| s.phase)
        .unwrap_or(RestorePhase::New);
    if phase != RestorePhase::New {
        return Ok(Action::await_change());
    }

    info!(restore = %name, backup = %restore.spec.backup_name, "processing new restore");

    let mut validation_errors = restore.spec.validate();
    if restore.spec.restore_pvs == Some(true) && !ctx.snapshots_enabled {
        validation_errors.push(
            "restorePVs is true but no persistent volume provider is configured".to_string(),
        );
    }

    // A restore without its backup is a validation failure, never retried.
    let backup = if validation_errors.is_empty() {
        match fetch_backup(&restore.spec.backup_name, &ctx).await? {
            Some(b) => Some(b),
            None => {
                validation_errors
                    .push(format!("backup {:?} not found", restore.spec.backup_name));
                None
            }
        }
    } else {
        None
    };

    let Some(backup) = backup else {
        warn!(restore = %name, errors = ?validation_errors, "restore failed validation");
        let status = RestoreStatus {
            phase: RestorePhase::FailedValidation,
            validation_errors,
            ..Default::default()
        };
        ctx.kube
            .patch_restore_status(&namespace, &name, &status)
            .await?;
        return Ok(Action::await_change());
    };

    ctx.kube
        .patch_restore_status(
            &namespace,
            &name,
            &RestoreStatus {
                phase: RestorePhase::InProgress,
                ..Default::default()
            },
        )
        .await?;

    let archive = ctx
        .backup_service
        .service()
        .download_backup(&ctx.bucket, &restore.spec.backup_name)
        .await?;

    let actions = ctx.plugin_manager.restore_item_actions();
    let mut log = Vec::new();
    let (warnings, errors) = ctx
        .restorer
        .restore(&restore, &backup, &archive, &mut log, &actions)
        .await?;

    upload_results(ctx.backup_service.service(), &ctx.bucket, &name, &warnings, &errors, log)
        .await;

    let status = RestoreStatus {
        phase: RestorePhase::Completed,
        warnings,
        errors,
        ..Default::default()
    };
    ctx.kube
        .patch_restore_status(&namespace, &name, &status)
        .await?;

    Ok(Action::await_change())
}

/// The backup from the cluster, falling back to the bucket.
///
/// A backup found only in the bucket is re-created in the cluster so later
/// operations (deletion, downloads) have an object to work with.
async fn fetch_backup(backup_name: &str, ctx: &Context) -> Result<Option<Backup>, Error> {
    if let Some(backup) = ctx.kube.get_backup(&ctx.namespace, backup_name).await? {
        return Ok(Some(backup));
    }

    let from_bucket = ctx.backup_service.get_backups(&ctx.bucket).await?;
    let Some(found) = from_bucket
        .into_iter()
        .find(|b| b.metadata.name.as_deref() == Some(backup_name))
    else {
        return Ok(None);
    };

    let mut fresh = found.clone();
    fresh.metadata.resource_version = None;
    fresh.metadata.uid = None;
    fresh.metadata.namespace = Some(ctx.namespace.clone());
    match ctx.kube.create_backup(&ctx.namespace, &fresh).await {
        Ok(created) => Ok(Some(created)),
        Err(e) if e.is_already_exists() => Ok(Some(found)),
        Err(e) => Err(e),
    }
}

async fn upload_results(
    service: &BackupService,
    bucket: &str,
    name: &str,
    warnings: &crate::api::RestoreResult,
    errors: &crate::api::RestoreResult,
    log: Vec<u8>,
) {
    if let Err(e) = service.upload_restore_log(bucket, name, log).await {
        warn!(restore = %name, error = %e, "failed to upload restore log");
    }

    let results = serde_json::json!({"warnings": warnings, "errors": errors});
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    let blob = serde_json::to_vec(&results)
        .ok()
        .and_then(|bytes| encoder.write_all(&bytes).ok().map(|_| encoder))
        .and_then(|enc| enc.finish().ok());
    match blob {
        Some(blob) => {
            if let Err(e) = service.upload_restore_results(bucket, name, blob).await {
                warn!(restore = %name, error = %e, "failed to upload restore results");
            }
        }
        None => warn!(restore = %name, "failed to encode restore results"),
    }
}

/// Requeue failed reconciles with a short delay
pub fn error_policy(restore: Arc<Restore>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(restore = %restore.name_any(), error = %error, "restore reconciliation failed");
    Action::requeue(Duration::from_secs(30))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{BackupSpec, RestoreSpec};
    use crate::client::MockDynamicClient;
    use crate::cloud::MockObjectStore;
    use crate::discovery::DiscoveryHelper;

    fn restorer() -> Arc<Restorer> {
        let mut dynamic = MockDynamicClient::new();
        dynamic.expect_create().returning(|_, _, obj| Ok(obj));
        Arc::new(Restorer::new(
            Arc::new(DiscoveryHelper::from_resources(Vec::new())),
            Arc::new(dynamic),
            None,
            None,
            Vec::new(),
        ))
    }

    fn context(kube: MockKubeClient, store: MockObjectStore) -> Arc<Context> {
        let service = BackupService::new(Arc::new(store));
        Arc::new(Context {
            kube: Arc::new(kube),
            restorer: restorer(),
            backup_service: Arc::new(CachedBackupService::new(
                service,
                Duration::from_secs(60),
            )),
            bucket: "bkt".to_string(),
            namespace: "caravel".to_string(),
            snapshots_enabled: false,
            plugin_manager: Arc::new(PluginManager::new()),
        })
    }

    fn restore_named(backup_name: &str, phase: Option<RestorePhase>) -> Arc<Restore> {
        let mut restore = Restore::new(
            "r1",
            RestoreSpec {
                backup_name: backup_name.to_string(),
                ..Default::default()
            },
        );
        restore.metadata.namespace = Some("caravel".to_string());
        restore.status = phase.map(|p| RestoreStatus {
            phase: p,
            ..Default::default()
        });
        Arc::new(restore)
    }

    fn empty_archive() -> Vec<u8> {
        let tar = crate::backup::TarAppender::new(
            GzEncoder::new(Vec::new(), Compression::default()),
            0,
        );
        tar.into_inner().unwrap().finish().unwrap()
    }

    #[tokio::test]
    async fn missing_backup_is_failed_validation() {
        let mut kube = MockKubeClient::new();
        kube.expect_get_backup().returning(|_, _| Ok(None));
        kube.expect_patch_restore_status()
            .withf(|ns, name, status| {
                ns == "caravel"
                    && name == "r1"
                    && status.phase == RestorePhase::FailedValidation
                    && status.validation_errors.iter().any(|e| e.contains("not found"))
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut store = MockObjectStore::new();
        store
            .expect_list_common_prefixes()
            .returning(|_, _, _| Ok(Vec::new()));

        let action = reconcile(restore_named("gone", None), context(kube, store))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn new_restore_runs_to_completed() {
        let backup = Backup::new("b1", BackupSpec::default());
        let mut kube = MockKubeClient::new();
        kube.expect_get_backup()
            .returning(move |_, _| Ok(Some(backup.clone())));
        kube.expect_patch_restore_status()
            .withf(|_, _, status| status.phase == RestorePhase::InProgress)
            .times(1)
            .returning(|_, _, _| Ok(()));
        kube.expect_patch_restore_status()
            .withf(|_, _, status| status.phase == RestorePhase::Completed)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut store = MockObjectStore::new();
        store
            .expect_get_object()
            .withf(|_, key| key == "backups/b1/b1.tar.gz")
            .returning(|_, _| Ok(empty_archive()));
        // restore log and results blobs
        store.expect_put_object().times(2).returning(|_, _, _| Ok(()));

        let action = reconcile(restore_named("b1", None), context(kube, store))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn terminal_restores_are_never_reconciled_again() {
        // No mock expectations: any API call would panic the test.
        for phase in [
            RestorePhase::Completed,
            RestorePhase::FailedValidation,
            RestorePhase::InProgress,
        ] {
            let ctx = context(MockKubeClient::new(), MockObjectStore::new());
            let restore = restore_named("b1", Some(phase));
            assert_eq!(
                reconcile(restore.clone(), ctx.clone()).await.unwrap(),
                Action::await_change()
            );
            assert_eq!(
                reconcile(restore, ctx).await.unwrap(),
                Action::await_change()
            );
        }
    }
}
