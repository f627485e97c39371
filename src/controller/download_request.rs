//! DownloadRequest controller
//!
//! Signs a time-limited URL for one artifact and records it in status.
//! Expired requests delete themselves so the namespace does not
//! accumulate dead objects.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use kube::api::{Api, DeleteParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{error, info};

#[cfg(test)]
use mockall::automock;

use crate::api::{DownloadRequest, DownloadRequestPhase, DownloadRequestStatus};
use crate::cloud::BackupService;
use crate::controller::patch_status;
use crate::Error;

/// How long signed URLs remain valid
pub const SIGNED_URL_TTL: Duration = Duration::from_secs(10 * 60);

/// Kubernetes access the download request controller needs.
///
/// A trait so reconcile logic runs against a mock in tests while the
/// server wires in the real client.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Patch a DownloadRequest's status subresource
    async fn patch_download_request_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DownloadRequestStatus,
    ) -> Result<(), Error>;

    /// Delete a DownloadRequest
    async fn delete_download_request(&self, namespace: &str, name: &str) -> Result<(), Error>;
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
    async fn patch_download_request_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DownloadRequestStatus,
    ) -> Result<(), Error> {
        patch_status::<DownloadRequest, _>(&self.client, namespace, name, status).await?;
        Ok(())
    }

    async fn delete_download_request(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<DownloadRequest> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Collaborators for the download request controller
pub struct Context {
    /// API access
    pub kube: Arc<dyn KubeClient>,
    /// Artifact storage
    pub backup_service: Arc<BackupService>,
    /// Bucket holding artifacts
    pub bucket: String,
    /// Namespace holding Caravel resources
    pub namespace: String,
}

/// Reconcile one DownloadRequest
pub async fn reconcile(request: Arc<DownloadRequest>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = request.name_any();
    let namespace = request.namespace().unwrap_or_else(|| ctx.namespace.clone());

    match request
        .status
        .as_ref()
        .map(|s| s.phase)
        .unwrap_or(DownloadRequestPhase::New)
    {
        DownloadRequestPhase::New => {
            let url = ctx
                .backup_service
                .create_signed_url(
                    &ctx.bucket,
                    request.spec.target.kind,
                    &request.spec.target.name,
                    SIGNED_URL_TTL,
                )
                .await?;

            let expiration =
                Utc::now() + chrono::Duration::from_std(SIGNED_URL_TTL).unwrap_or_default();
            info!(request = %name, target = %request.spec.target.name, "signed download url");

            let status = DownloadRequestStatus {
                phase: DownloadRequestPhase::Processed,
                download_url: Some(url),
                expiration: Some(expiration),
            };
            ctx.kube
                .patch_download_request_status(&namespace, &name, &status)
                .await?;
            Ok(Action::requeue(SIGNED_URL_TTL))
        }
        DownloadRequestPhase::Processed => {
            let expired = request
                .status
                .as_ref()
                .and_then(|s| s.expiration)
                .map(|exp| exp <= Utc::now())
                .unwrap_or(true);

            if expired {
                info!(request = %name, "download request expired, deleting");
                ctx.kube.delete_download_request(&namespace, &name).await?;
                Ok(Action::await_change())
            } else {
                Ok(Action::requeue(SIGNED_URL_TTL))
            }
        }
    }
}

/// Requeue failed reconciles with a short delay
pub fn error_policy(request: Arc<DownloadRequest>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(request = %request.name_any(), error = %error, "download request reconciliation failed");
    Action::requeue(Duration::from_secs(30))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{DownloadRequestSpec, DownloadTarget, DownloadTargetKind};
    use crate::cloud::MockObjectStore;

    fn context(kube: MockKubeClient, store: MockObjectStore) -> Arc<Context> {
        Arc::new(Context {
            kube: Arc::new(kube),
            backup_service: Arc::new(BackupService::new(Arc::new(store))),
            bucket: "bkt".to_string(),
            namespace: "caravel".to_string(),
        })
    }

    fn request(status: Option<DownloadRequestStatus>) -> Arc<DownloadRequest> {
        let mut req = DownloadRequest::new(
            "dl-1",
            DownloadRequestSpec {
                target: DownloadTarget {
                    kind: DownloadTargetKind::BackupLog,
                    name: "b1".to_string(),
                },
            },
        );
        req.metadata.namespace = Some("caravel".to_string());
        req.status = status;
        Arc::new(req)
    }

    #[tokio::test]
    async fn new_request_is_signed_and_processed() {
        let mut store = MockObjectStore::new();
        store
            .expect_create_signed_url()
            .withf(|_, key, ttl| key == "backups/b1/b1-logs.gz" && *ttl == SIGNED_URL_TTL)
            .returning(|_, _, _| Ok("https://signed.example/b1-logs".to_string()));

        let mut kube = MockKubeClient::new();
        kube.expect_patch_download_request_status()
            .withf(|ns, name, status| {
                ns == "caravel"
                    && name == "dl-1"
                    && status.phase == DownloadRequestPhase::Processed
                    && status.download_url.as_deref() == Some("https://signed.example/b1-logs")
                    && status.expiration.is_some()
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let action = reconcile(request(None), context(kube, store)).await.unwrap();
        assert_eq!(action, Action::requeue(SIGNED_URL_TTL));
    }

    #[tokio::test]
    async fn expired_request_deletes_itself() {
        let mut kube = MockKubeClient::new();
        kube.expect_delete_download_request()
            .withf(|ns, name| ns == "caravel" && name == "dl-1")
            .times(1)
            .returning(|_, _| Ok(()));

        let status = DownloadRequestStatus {
            phase: DownloadRequestPhase::Processed,
            download_url: Some("https://signed.example".to_string()),
            expiration: Some(Utc::now() - chrono::Duration::minutes(1)),
        };
        let action = reconcile(
            request(Some(status)),
            context(kube, MockObjectStore::new()),
        )
        .await
        .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn unexpired_request_is_left_alone() {
        // No expectations: a delete or patch would panic the test.
        let status = DownloadRequestStatus {
            phase: DownloadRequestPhase::Processed,
            download_url: Some("https://signed.example".to_string()),
            expiration: Some(Utc::now() + chrono::Duration::minutes(5)),
        };
        let action = reconcile(
            request(Some(status)),
            context(MockKubeClient::new(), MockObjectStore::new()),
        )
        .await
        .unwrap();
        assert_eq!(action, Action::requeue(SIGNED_URL_TTL));
    }
}
