//! Pod volume backup orchestration
//!
//! The backup pipeline delegates file-level volume backups to the node
//! agent by creating one `PodVolumeBackup` work item per annotated volume
//! and waiting for the agent to finish. The resulting snapshot IDs are
//! annotated onto the archived pod so restore can find them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use serde_json::Value;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use super::RepositoryManager;
use crate::api::{
    Backup, PodRef, PodVolumeBackup, PodVolumeBackupSpec, PodVolumePhase, PodVolumeRestore,
    PodVolumeRestoreSpec, Restore, BACKUP_NAME_LABEL, POD_UID_LABEL, RESTORE_NAME_LABEL,
};
use crate::client::{item_annotations, item_name, item_namespace};
use crate::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_secs(3);
const DEFAULT_COMPLETION_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Volumes a pod asks to have backed up, from its annotation.
///
/// The value is either a single volume name or a JSON array of names.
pub fn volumes_to_backup(pod: &Value) -> Vec<String> {
    let annotations = item_annotations(pod);
    let Some(raw) = annotations.get(crate::POD_VOLUME_BACKUP_ANNOTATION) else {
        return Vec::new();
    };
    if raw.starts_with('[') {
        serde_json::from_str(raw).unwrap_or_else(|_| vec![raw.clone()])
    } else {
        raw.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Drives file-level backups of a pod's annotated volumes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodVolumeBackupper: Send + Sync {
    /// Back up every annotated volume of the pod, returning snapshot IDs
    /// for the volumes that succeeded and errors for the ones that did not
    async fn backup_pod_volumes(
        &self,
        backup: &Backup,
        pod: &Value,
    ) -> (BTreeMap<String, String>, Vec<Error>);
}

/// [`PodVolumeBackupper`] that creates work item CRs for the node agent
pub struct CrPodVolumeBackupper {
    client: Client,
    namespace: String,
    repo_manager: Arc<RepositoryManager>,
    completion_timeout: Duration,
}

impl CrPodVolumeBackupper {
    /// Create an orchestrator writing work items into `namespace`
    pub fn new(client: Client, namespace: &str, repo_manager: Arc<RepositoryManager>) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            repo_manager,
            completion_timeout: DEFAULT_COMPLETION_TIMEOUT,
        }
    }

    async fn backup_one_volume(
        &self,
        backup: &Backup,
        pod: &Value,
        volume: &str,
    ) -> Result<String> {
        let pod_name = item_name(pod);
        let pod_namespace = item_namespace(pod);
        let pod_uid = pod
            .pointer("/metadata/uid")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let node = pod
            .pointer("/spec/nodeName")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if node.is_empty() {
            return Err(Error::restic(format!(
                "pod {pod_namespace}/{pod_name} is not scheduled, cannot back up volume {volume}"
            )));
        }

        let volume_exists = pod
            .pointer("/spec/volumes")
            .and_then(Value::as_array)
            .map(|vols| {
                vols.iter()
                    .any(|v| v.get("name").and_then(Value::as_str) == Some(volume))
            })
            .unwrap_or(false);
        if !volume_exists {
            return Err(Error::restic(format!(
                "volume {volume} does not exist in pod {pod_name}"
            )));
        }

        let backup_name = backup.metadata.name.clone().unwrap_or_default();
        let backup_uid = backup.metadata.uid.clone().unwrap_or_default();

        let mut tags = BTreeMap::new();
        tags.insert("backup".to_string(), backup_name.clone());
        tags.insert("backup-uid".to_string(), backup_uid.clone());
        tags.insert("ns".to_string(), pod_namespace.clone());
        tags.insert("pod".to_string(), pod_name.clone());
        tags.insert("pod-uid".to_string(), pod_uid.clone());
        tags.insert("volume".to_string(), volume.to_string());

        // One work item per (backup, pod, volume): the name is derived, so
        // a re-enqueue of the same backup finds the existing item.
        let item_name = format!("{backup_name}-{pod_name}-{volume}");
        let mut labels = BTreeMap::new();
        labels.insert(BACKUP_NAME_LABEL.to_string(), backup_name.clone());
        labels.insert(POD_UID_LABEL.to_string(), pod_uid.clone());

        let pvb = PodVolumeBackup {
            metadata: ObjectMeta {
                name: Some(item_name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: PodVolumeBackupSpec {
                node,
                pod: PodRef {
                    namespace: pod_namespace.clone(),
                    name: pod_name.clone(),
                    uid: pod_uid.clone(),
                },
                volume: volume.to_string(),
                repo_prefix: self.repo_manager.repo_prefix().to_string(),
                tags,
            },
            status: None,
        };

        let api: Api<PodVolumeBackup> = Api::namespaced(self.client.clone(), &self.namespace);
        match api.create(&PostParams::default(), &pvb).await {
            Ok(_) => info!(item = %item_name, "created pod volume backup"),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(item = %item_name, "pod volume backup already exists")
            }
            Err(e) => return Err(e.into()),
        }

        // Wait for the node agent to run restic and report back.
        let deadline = tokio::time::Instant::now() + self.completion_timeout;
        loop {
            if tokio::time::Instant::now() > deadline {
                return Err(Error::restic(format!(
                    "timed out waiting for pod volume backup {item_name}"
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;

            let current = api.get(&item_name).await?;
            match current.status {
                Some(status) if status.phase == PodVolumePhase::Completed => {
                    if let Some(id) = status.snapshot_id {
                        return Ok(id);
                    }
                    // The agent completed without recording an ID; ask the
                    // repository directly.
                    return self
                        .repo_manager
                        .get_snapshot_id(&pod_namespace, &backup_uid, &pod_uid, volume)
                        .await;
                }
                Some(status) if status.phase == PodVolumePhase::Failed => {
                    return Err(Error::restic(format!(
                        "pod volume backup {item_name} failed: {}",
                        status.message.unwrap_or_else(|| "unknown error".to_string())
                    )));
                }
                _ => continue,
            }
        }
    }
}

#[async_trait]
impl PodVolumeBackupper for CrPodVolumeBackupper {
    async fn backup_pod_volumes(
        &self,
        backup: &Backup,
        pod: &Value,
    ) -> (BTreeMap<String, String>, Vec<Error>) {
        let volumes = volumes_to_backup(pod);
        if volumes.is_empty() {
            return (BTreeMap::new(), Vec::new());
        }

        let pod_namespace = item_namespace(pod);
        let mut snapshots = BTreeMap::new();
        let mut errs = Vec::new();

        // The namespace's repository must exist before the agent can write
        // into it; init_repo is a no-op when it already does.
        if let Err(e) = self.repo_manager.init_repo(&pod_namespace).await {
            errs.push(e);
            return (snapshots, errs);
        }

        for volume in volumes {
            match self.backup_one_volume(backup, pod, &volume).await {
                Ok(snapshot_id) => {
                    snapshots.insert(volume, snapshot_id);
                }
                Err(e) => errs.push(e),
            }
        }
        (snapshots, errs)
    }
}

/// Snapshot IDs recorded on a pod during backup, keyed by volume name
pub fn recorded_snapshots(pod: &Value) -> BTreeMap<String, String> {
    item_annotations(pod)
        .into_iter()
        .filter_map(|(k, v)| {
            k.strip_prefix(crate::POD_VOLUME_SNAPSHOT_ANNOTATION_PREFIX)
                .map(|volume| (volume.to_string(), v))
        })
        .collect()
}

/// Controller owner reference tying a work item to its Restore.
///
/// The node agent reads this back to learn the restore's UID, which the
/// completion helper needs to signal the right wait init container.
pub fn restore_owner_reference(restore: &Restore) -> Option<OwnerReference> {
    let name = restore.metadata.name.clone()?;
    let uid = restore.metadata.uid.clone()?;
    Some(OwnerReference {
        api_version: format!("{}/{}", crate::api::API_GROUP, crate::api::API_VERSION),
        kind: "Restore".to_string(),
        name,
        uid,
        controller: Some(true),
        ..Default::default()
    })
}

/// Creates restore work items for a pod's recorded snapshots
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodVolumeRestorer: Send + Sync {
    /// Create one `PodVolumeRestore` per recorded snapshot of the (already
    /// created) pod. The pod blocks on its wait init container until the
    /// node agent completes them.
    async fn restore_pod_volumes(&self, restore: &Restore, pod: &Value) -> Result<()>;
}

/// [`PodVolumeRestorer`] that creates work item CRs for the node agent
pub struct CrPodVolumeRestorer {
    client: Client,
    namespace: String,
    repo_prefix: String,
}

impl CrPodVolumeRestorer {
    /// Create an orchestrator writing work items into `namespace`
    pub fn new(client: Client, namespace: &str, repo_prefix: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            repo_prefix: repo_prefix.to_string(),
        }
    }
}

#[async_trait]
impl PodVolumeRestorer for CrPodVolumeRestorer {
    async fn restore_pod_volumes(&self, restore: &Restore, pod: &Value) -> Result<()> {
        let snapshots = recorded_snapshots(pod);
        if snapshots.is_empty() {
            return Ok(());
        }

        let restore_name = restore.metadata.name.clone().unwrap_or_default();
        let pod_name = item_name(pod);
        let pod_namespace = item_namespace(pod);
        let pod_uid = pod
            .pointer("/metadata/uid")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let owner = restore_owner_reference(restore);

        let api: Api<PodVolumeRestore> = Api::namespaced(self.client.clone(), &self.namespace);
        let mut errs = Vec::new();

        for (volume, snapshot_id) in snapshots {
            let item_name = format!("{restore_name}-{pod_name}-{volume}");
            let mut labels = BTreeMap::new();
            labels.insert(RESTORE_NAME_LABEL.to_string(), restore_name.clone());
            labels.insert(POD_UID_LABEL.to_string(), pod_uid.clone());

            let pvr = PodVolumeRestore {
                metadata: ObjectMeta {
                    name: Some(item_name.clone()),
                    namespace: Some(self.namespace.clone()),
                    labels: Some(labels),
                    owner_references: owner.clone().map(|o| vec![o]),
                    ..Default::default()
                },
                spec: PodVolumeRestoreSpec {
                    pod: PodRef {
                        namespace: pod_namespace.clone(),
                        name: pod_name.clone(),
                        uid: pod_uid.clone(),
                    },
                    volume,
                    repo_prefix: self.repo_prefix.clone(),
                    snapshot_id,
                },
                status: None,
            };

            match api.create(&PostParams::default(), &pvr).await {
                Ok(_) => info!(item = %item_name, "created pod volume restore"),
                Err(kube::Error::Api(ae)) if ae.code == 409 => {
                    debug!(item = %item_name, "pod volume restore already exists")
                }
                Err(e) => errs.push(e.into()),
            }
        }

        Error::aggregate(errs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn annotation_accepts_single_name() {
        let pod = json!({
            "metadata": {"annotations": {"backup.caravel.dev/backup-volumes": "data"}}
        });
        assert_eq!(volumes_to_backup(&pod), vec!["data"]);
    }

    #[test]
    fn annotation_accepts_comma_list() {
        let pod = json!({
            "metadata": {"annotations": {"backup.caravel.dev/backup-volumes": "data, logs"}}
        });
        assert_eq!(volumes_to_backup(&pod), vec!["data", "logs"]);
    }

    #[test]
    fn annotation_accepts_json_array() {
        let pod = json!({
            "metadata": {"annotations": {"backup.caravel.dev/backup-volumes": "[\"data\",\"logs\"]"}}
        });
        assert_eq!(volumes_to_backup(&pod), vec!["data", "logs"]);
    }

    #[test]
    fn missing_annotation_means_no_volumes() {
        let pod = json!({"metadata": {"name": "nginx-0"}});
        assert!(volumes_to_backup(&pod).is_empty());
    }

    #[test]
    fn owner_reference_marks_the_restore_as_controller() {
        use crate::api::RestoreSpec;

        let mut restore = Restore::new(
            "r1",
            RestoreSpec {
                backup_name: "b1".into(),
                ..Default::default()
            },
        );
        restore.metadata.uid = Some("restore-uid-1".into());

        let owner = restore_owner_reference(&restore).unwrap();
        assert_eq!(owner.api_version, "caravel.dev/v1");
        assert_eq!(owner.kind, "Restore");
        assert_eq!(owner.name, "r1");
        assert_eq!(owner.uid, "restore-uid-1");
        assert_eq!(owner.controller, Some(true));
    }

    #[test]
    fn owner_reference_requires_a_uid() {
        use crate::api::RestoreSpec;

        let restore = Restore::new("r1", RestoreSpec::default());
        assert!(restore_owner_reference(&restore).is_none());
    }

    #[test]
    fn recorded_snapshots_strip_the_annotation_prefix() {
        let pod = json!({
            "metadata": {"annotations": {
                "snapshot.caravel.dev/data": "snap-1",
                "snapshot.caravel.dev/logs": "snap-2",
                "unrelated": "x"
            }}
        });
        let snaps = recorded_snapshots(&pod);
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps["data"], "snap-1");
        assert_eq!(snaps["logs"], "snap-2");
    }
}
