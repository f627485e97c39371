//! Reconcile loops for every Caravel resource
//!
//! Event-driven kinds (Backup, Restore, DeleteBackupRequest,
//! DownloadRequest, and the agent's pod volume work items) run as
//! controllers with rate-limited retries; the period-driven passes
//! (Schedule, garbage collection, bucket sync) run as cancellable interval
//! loops. Status transitions are JSON merge-patches over a deep copy, so
//! concurrent writers collide loudly instead of clobbering each other.

pub mod backup;
pub mod backup_deletion;
pub mod backup_sync;
pub mod download_request;
pub mod gc;
pub mod pod_volume_backup;
pub mod pod_volume_restore;
pub mod restore;
pub mod schedule;

use std::fmt::Debug;

use async_trait::async_trait;
use dashmap::DashSet;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Secret};
use kube::api::{Api, Patch, PatchParams};
use kube::core::NamespaceResourceScope;
use kube::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;

#[cfg(test)]
use mockall::automock;

use crate::api::{PodVolumeBackup, PodVolumeBackupStatus, PodVolumeRestore, PodVolumeRestoreStatus};
use crate::restic::CREDENTIALS_SECRET;
use crate::{Error, Result};

/// Patch an object's status subresource with a JSON merge-patch
pub(crate) async fn patch_status<K, S>(
    client: &Client,
    namespace: &str,
    name: &str,
    status: &S,
) -> Result<K>
where
    K: kube::Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
    K::DynamicType: Default,
    S: Serialize,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "status": status });
    Ok(api
        .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?)
}

/// Kubernetes access needed by the node agent's work item controllers.
///
/// A trait so reconcile logic runs against a mock in tests while the
/// agent binary wires in the real client.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// A pod by namespace and name; `None` when it does not exist yet
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    /// The bound PV name of a claim, when it has one
    async fn pvc_volume_name(&self, namespace: &str, claim: &str) -> Result<Option<String>>;

    /// The repository key for a namespace, from the credentials secret
    async fn repository_key(&self, repo_namespace: &str) -> Result<Vec<u8>>;

    /// Patch a PodVolumeBackup's status subresource
    async fn patch_pod_volume_backup_status(
        &self,
        namespace: &str,
        name: &str,
        status: &PodVolumeBackupStatus,
    ) -> Result<()>;

    /// Patch a PodVolumeRestore's status subresource
    async fn patch_pod_volume_restore_status(
        &self,
        namespace: &str,
        name: &str,
        status: &PodVolumeRestoreStatus,
    ) -> Result<()>;
}

/// [`AgentClient`] backed by the API server
pub struct AgentClientImpl {
    client: Client,
    server_namespace: String,
}

impl AgentClientImpl {
    /// Create a client reading credentials from `server_namespace`
    pub fn new(client: Client, server_namespace: &str) -> Self {
        Self {
            client,
            server_namespace: server_namespace.to_string(),
        }
    }
}

#[async_trait]
impl AgentClient for AgentClientImpl {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(pod) => Ok(Some(pod)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn pvc_volume_name(&self, namespace: &str, claim: &str) -> Result<Option<String>> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let pvc = api.get(claim).await?;
        Ok(pvc.spec.and_then(|s| s.volume_name))
    }

    async fn repository_key(&self, repo_namespace: &str) -> Result<Vec<u8>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.server_namespace);
        let secret = api.get(CREDENTIALS_SECRET).await?;
        secret
            .data
            .as_ref()
            .and_then(|d| d.get(repo_namespace))
            .map(|k| k.0.clone())
            .ok_or_else(|| {
                Error::restic(format!("no repository key for namespace {repo_namespace}"))
            })
    }

    async fn patch_pod_volume_backup_status(
        &self,
        namespace: &str,
        name: &str,
        status: &PodVolumeBackupStatus,
    ) -> Result<()> {
        patch_status::<PodVolumeBackup, _>(&self.client, namespace, name, status).await?;
        Ok(())
    }

    async fn patch_pod_volume_restore_status(
        &self,
        namespace: &str,
        name: &str,
        status: &PodVolumeRestoreStatus,
    ) -> Result<()> {
        patch_status::<PodVolumeRestore, _>(&self.client, namespace, name, status).await?;
        Ok(())
    }
}

/// Tracks backups currently being taken, so deletion requests can refuse
/// to tear down a backup mid-run
#[derive(Default)]
pub struct BackupTracker {
    in_progress: DashSet<String>,
}

impl BackupTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    fn key(namespace: &str, name: &str) -> String {
        format!("{namespace}/{name}")
    }

    /// Record a backup as in progress
    pub fn add(&self, namespace: &str, name: &str) {
        self.in_progress.insert(Self::key(namespace, name));
    }

    /// Whether the backup is currently running
    pub fn contains(&self, namespace: &str, name: &str) -> bool {
        self.in_progress.contains(&Self::key(namespace, name))
    }

    /// Clear a finished backup
    pub fn remove(&self, namespace: &str, name: &str) {
        self.in_progress.remove(&Self::key(namespace, name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_round_trip() {
        let tracker = BackupTracker::new();
        assert!(!tracker.contains("caravel", "b1"));
        tracker.add("caravel", "b1");
        assert!(tracker.contains("caravel", "b1"));
        assert!(!tracker.contains("caravel", "b2"));
        tracker.remove("caravel", "b1");
        assert!(!tracker.contains("caravel", "b1"));
    }
}
