//! Bucket-to-cluster backup sync loop
//!
//! Periodically lists the bucket and re-creates any Backup present in
//! storage but absent from the cluster. This is the disaster-recovery
//! path: point a fresh control plane at an existing bucket and its
//! backups reappear, ready to restore.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use kube::api::{Api, ListParams, PostParams};
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::Backup;
use crate::cloud::CachedBackupService;
use crate::Result;

/// Run the backup sync loop until cancelled
pub async fn run(
    client: Client,
    namespace: String,
    backup_service: Arc<CachedBackupService>,
    bucket: String,
    period: Duration,
    token: CancellationToken,
) {
    info!(period_secs = period.as_secs(), "starting backup sync");
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("backup sync stopping");
                return;
            }
            _ = ticker.tick() => {
                if let Err(e) = sync_once(&client, &namespace, &backup_service, &bucket).await {
                    error!(error = %e, "backup sync pass failed");
                }
            }
        }
    }
}

async fn sync_once(
    client: &Client,
    namespace: &str,
    backup_service: &CachedBackupService,
    bucket: &str,
) -> Result<()> {
    let in_bucket = backup_service.get_backups(bucket).await?;

    let api: Api<Backup> = Api::namespaced(client.clone(), namespace);
    let in_cluster: HashSet<String> = api
        .list(&ListParams::default())
        .await?
        .items
        .into_iter()
        .map(|b| b.name_any())
        .collect();

    for backup in in_bucket {
        let name = backup.name_any();
        if name.is_empty() || in_cluster.contains(&name) {
            continue;
        }

        info!(backup = %name, "syncing backup from storage into cluster");

        // Objects from another cluster carry that cluster's identity
        // fields; clear them so this API server accepts the create.
        let mut fresh = backup;
        fresh.metadata.resource_version = None;
        fresh.metadata.uid = None;
        fresh.metadata.self_link = None;
        fresh.metadata.namespace = Some(namespace.to_string());

        match api.create(&PostParams::default(), &fresh).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 409 => {}
            Err(e) => warn!(backup = %name, error = %e, "failed to sync backup"),
        }
    }
    Ok(())
}
