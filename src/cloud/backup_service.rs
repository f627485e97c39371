//! Backup artifact layout over an object store
//!
//! Neutral collaborator between the backup and restore sides: both address
//! artifacts purely through this service, never through raw keys. The
//! layout inside a bucket is
//!
//! ```text
//! backups/<name>/<name>.tar.gz
//! backups/<name>/<name>-logs.gz
//! backups/<name>/caravel-backup.json
//! restores/<name>/restore-<name>-log.gz
//! restores/<name>/restore-<name>-results.gz
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::api::{Backup, DownloadTargetKind};
use crate::cloud::ObjectStore;
use crate::{Error, Result};

/// Sidecar metadata object name within a backup directory
pub const METADATA_OBJECT: &str = "caravel-backup.json";

/// Key of a backup's archive
fn archive_key(name: &str) -> String {
    format!("backups/{name}/{name}.tar.gz")
}

/// Key of a backup's log blob
fn backup_log_key(name: &str) -> String {
    format!("backups/{name}/{name}-logs.gz")
}

/// Key of a backup's metadata sidecar
fn metadata_key(name: &str) -> String {
    format!("backups/{name}/{METADATA_OBJECT}")
}

/// Key of a restore's log blob
fn restore_log_key(name: &str) -> String {
    format!("restores/{name}/restore-{name}-log.gz")
}

/// Key of a restore's results blob
fn restore_results_key(name: &str) -> String {
    format!("restores/{name}/restore-{name}-results.gz")
}

/// Key for a download target
pub fn download_target_key(kind: DownloadTargetKind, name: &str) -> String {
    match kind {
        DownloadTargetKind::BackupContents => archive_key(name),
        DownloadTargetKind::BackupLog => backup_log_key(name),
        DownloadTargetKind::RestoreLog => restore_log_key(name),
        DownloadTargetKind::RestoreResults => restore_results_key(name),
    }
}

/// Stores and retrieves backup artifacts at the canonical layout
#[derive(Clone)]
pub struct BackupService {
    store: Arc<dyn ObjectStore>,
}

impl BackupService {
    /// Wrap an object store
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Upload a finished backup: metadata sidecar, archive, and log.
    ///
    /// The metadata sidecar is what makes a backup visible to
    /// [`Self::get_backups`], so it goes first and is rolled back if the
    /// archive upload fails; a log upload failure only warns.
    pub async fn upload_backup(
        &self,
        bucket: &str,
        name: &str,
        metadata: Vec<u8>,
        archive: Vec<u8>,
        log: Vec<u8>,
    ) -> Result<()> {
        self.store
            .put_object(bucket, &metadata_key(name), metadata)
            .await?;

        if let Err(err) = self.store.put_object(bucket, &archive_key(name), archive).await {
            if let Err(del_err) = self.store.delete_object(bucket, &metadata_key(name)).await {
                warn!(backup = %name, error = %del_err, "failed to roll back metadata after archive upload failure");
            }
            return Err(err);
        }

        if let Err(err) = self.store.put_object(bucket, &backup_log_key(name), log).await {
            warn!(backup = %name, error = %err, "failed to upload backup log");
        }
        Ok(())
    }

    /// Download a backup archive
    pub async fn download_backup(&self, bucket: &str, name: &str) -> Result<Vec<u8>> {
        self.store.get_object(bucket, &archive_key(name)).await
    }

    /// All backups recorded in the bucket, parsed from metadata sidecars.
    ///
    /// A directory with an unreadable or unparsable sidecar is skipped
    /// with a warning rather than failing the listing.
    pub async fn get_backups(&self, bucket: &str) -> Result<Vec<Backup>> {
        let prefixes = self
            .store
            .list_common_prefixes(bucket, "backups/", "/")
            .await?;

        let mut backups = Vec::with_capacity(prefixes.len());
        for prefix in prefixes {
            let name = prefix
                .trim_start_matches("backups/")
                .trim_end_matches('/')
                .to_string();
            if name.is_empty() {
                continue;
            }
            match self.store.get_object(bucket, &metadata_key(&name)).await {
                Ok(bytes) => match serde_json::from_slice::<Backup>(&bytes) {
                    Ok(backup) => backups.push(backup),
                    Err(err) => {
                        warn!(backup = %name, error = %err, "skipping backup with unparsable metadata")
                    }
                },
                Err(err) => {
                    warn!(backup = %name, error = %err, "skipping backup with unreadable metadata")
                }
            }
        }
        Ok(backups)
    }

    /// Delete every object under a backup's directory
    pub async fn delete_backup_dir(&self, bucket: &str, name: &str) -> Result<()> {
        let keys = self
            .store
            .list_objects(bucket, &format!("backups/{name}/"))
            .await?;

        let mut errs = Vec::new();
        for key in keys {
            if let Err(err) = self.store.delete_object(bucket, &key).await {
                errs.push(Error::object_store(format!("deleting {key}: {err}")));
            }
        }
        Error::aggregate(errs)
    }

    /// Signed URL for one artifact of a backup or restore
    pub async fn create_signed_url(
        &self,
        bucket: &str,
        kind: DownloadTargetKind,
        name: &str,
        ttl: Duration,
    ) -> Result<String> {
        self.store
            .create_signed_url(bucket, &download_target_key(kind, name), ttl)
            .await
    }

    /// Upload a restore's log blob
    pub async fn upload_restore_log(&self, bucket: &str, name: &str, log: Vec<u8>) -> Result<()> {
        self.store
            .put_object(bucket, &restore_log_key(name), log)
            .await
    }

    /// Upload a restore's results (warnings/errors) blob
    pub async fn upload_restore_results(
        &self,
        bucket: &str,
        name: &str,
        results: Vec<u8>,
    ) -> Result<()> {
        self.store
            .put_object(bucket, &restore_results_key(name), results)
            .await
    }
}

/// A [`BackupService`] whose listing is cached for a bounded period.
///
/// The cache is strictly a subset of what the bucket holds: it only ever
/// serves what a full listing returned, and every refresh replaces it
/// wholesale.
pub struct CachedBackupService {
    inner: BackupService,
    refresh_period: Duration,
    cache: RwLock<Option<(Instant, Vec<Backup>)>>,
}

impl CachedBackupService {
    /// Wrap a service with a listing cache refreshed at `refresh_period`
    pub fn new(inner: BackupService, refresh_period: Duration) -> Self {
        Self {
            inner,
            refresh_period,
            cache: RwLock::new(None),
        }
    }

    /// The underlying uncached service
    pub fn service(&self) -> &BackupService {
        &self.inner
    }

    /// Cached listing, refreshed from the bucket when stale
    pub async fn get_backups(&self, bucket: &str) -> Result<Vec<Backup>> {
        {
            let cache = self.cache.read().await;
            if let Some((at, backups)) = cache.as_ref() {
                if at.elapsed() < self.refresh_period {
                    debug!(count = backups.len(), "serving backups from cache");
                    return Ok(backups.clone());
                }
            }
        }

        let fresh = self.inner.get_backups(bucket).await?;
        *self.cache.write().await = Some((Instant::now(), fresh.clone()));
        Ok(fresh)
    }

    /// Drop the cache so the next listing goes to the bucket
    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }
}
