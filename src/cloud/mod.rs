//! Cloud provider interfaces
//!
//! Object and block storage are reached exclusively through these traits.
//! The production implementations are RPC proxies to out-of-process
//! drivers (see [`crate::plugin`]); tests substitute mocks.

mod backup_service;

pub use backup_service::{BackupService, CachedBackupService};

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::Result;

/// Blob storage at a keyed layout within a bucket
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Initialize with the provider configuration block. Called once
    /// before any other method; `config` always carries at least `bucket`.
    async fn init(&self, config: &BTreeMap<String, String>) -> Result<()>;

    /// Store a blob
    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()>;

    /// Fetch a blob
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;

    /// List "directories" under a prefix, up to the delimiter
    async fn list_common_prefixes(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: &str,
    ) -> Result<Vec<String>>;

    /// List object keys under a prefix
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;

    /// Delete a blob
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()>;

    /// Produce a pre-signed GET URL valid for `ttl`
    async fn create_signed_url(&self, bucket: &str, key: &str, ttl: Duration) -> Result<String>;
}

/// Volume snapshot management for persistent disks
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Initialize with the provider configuration block
    async fn init(&self, config: &BTreeMap<String, String>) -> Result<()>;

    /// Create a volume from a snapshot, returning the new volume ID
    async fn create_volume_from_snapshot(
        &self,
        snapshot_id: &str,
        volume_type: &str,
        zone: &str,
        iops: Option<i64>,
    ) -> Result<String>;

    /// Volume type and IOPS for an existing volume
    async fn get_volume_info(&self, volume_id: &str, zone: &str)
        -> Result<(String, Option<i64>)>;

    /// Whether the volume has finished provisioning
    async fn is_volume_ready(&self, volume_id: &str, zone: &str) -> Result<bool>;

    /// Snapshot IDs carrying all the given tags
    async fn list_snapshots(&self, tag_filters: &BTreeMap<String, String>) -> Result<Vec<String>>;

    /// Snapshot a volume, returning the snapshot ID
    async fn create_snapshot(
        &self,
        volume_id: &str,
        zone: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<String>;

    /// Delete a snapshot
    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()>;

    /// Derive the provider volume ID from a PersistentVolume object.
    /// `None` means the volume type is not supported and must be skipped.
    async fn get_volume_id(&self, pv: &serde_json::Value) -> Result<Option<String>>;

    /// Rewrite the PersistentVolume's provider reference to a new volume,
    /// returning the updated object
    async fn set_volume_id(
        &self,
        pv: serde_json::Value,
        volume_id: &str,
    ) -> Result<serde_json::Value>;
}
