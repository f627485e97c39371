//! Config Custom Resource Definition
//!
//! Process-wide configuration read once at startup. The server watches its
//! Config for drift and shuts down gracefully when it changes, relying on
//! the supervising workload controller to restart it with the new values.

use std::collections::BTreeMap;
use std::time::Duration;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Name of the Config object the server reads
pub const DEFAULT_CONFIG_NAME: &str = "default";

const DEFAULT_BACKUP_SYNC_PERIOD_SECS: u64 = 60 * 60;
const DEFAULT_GC_SYNC_PERIOD_SECS: u64 = 60 * 60;
const DEFAULT_SCHEDULE_SYNC_PERIOD_SECS: u64 = 60;

/// Default group-resource priority order for backup and restore
pub const DEFAULT_RESOURCE_PRIORITIES: &[&str] = &[
    "namespaces",
    "persistentvolumes",
    "persistentvolumeclaims",
    "secrets",
    "configmaps",
    "serviceaccounts",
    "limitranges",
    "pods",
];

/// Specification for the server Config
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "caravel.dev",
    version = "v1",
    kind = "Config",
    plural = "configs",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSpec {
    /// Object storage provider holding archives and restic repositories
    pub backup_storage_provider: ObjectStorageProviderConfig,

    /// Block storage provider for volume snapshots; absent disables
    /// snapshot and snapshot-restore support
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_provider: Option<CloudProviderConfig>,

    /// Seconds between bucket-to-cluster backup sync passes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_sync_period_seconds: Option<u64>,

    /// Seconds between garbage collection passes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gc_sync_period_seconds: Option<u64>,

    /// Seconds between schedule evaluation passes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_sync_period_seconds: Option<u64>,

    /// Ordered group-resource priorities for backup and restore
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_priorities: Vec<String>,

    /// When true, only the restore and download controllers run
    #[serde(default)]
    pub restore_only_mode: bool,
}

/// An object storage provider and its bucket
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStorageProviderConfig {
    /// Plugin name, e.g. `aws`, `gcp`, `azure`
    pub name: String,

    /// Bucket holding backup archives
    pub bucket: String,

    /// Bucket or prefix for restic repositories; defaults to
    /// `<bucket>/restic`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restic_bucket: Option<String>,

    /// Provider-specific settings passed through to the plugin at Init
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
}

/// A block storage provider
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloudProviderConfig {
    /// Plugin name
    pub name: String,

    /// Provider-specific settings passed through to the plugin at Init
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
}

impl ConfigSpec {
    /// Apply server defaults in place.
    ///
    /// The bucket name is copied into the provider config map so object
    /// store plugins can read it at Init without a dedicated parameter.
    pub fn apply_defaults(&mut self) {
        if self.backup_sync_period_seconds.is_none() {
            self.backup_sync_period_seconds = Some(DEFAULT_BACKUP_SYNC_PERIOD_SECS);
        }
        if self.gc_sync_period_seconds.is_none() {
            self.gc_sync_period_seconds = Some(DEFAULT_GC_SYNC_PERIOD_SECS);
        }
        if self.schedule_sync_period_seconds.is_none() {
            self.schedule_sync_period_seconds = Some(DEFAULT_SCHEDULE_SYNC_PERIOD_SECS);
        }
        if self.resource_priorities.is_empty() {
            self.resource_priorities = DEFAULT_RESOURCE_PRIORITIES
                .iter()
                .map(|s| s.to_string())
                .collect();
            info!(priorities = ?self.resource_priorities, "using default resource priorities");
        } else {
            info!(priorities = ?self.resource_priorities, "using resource priorities from config");
        }

        self.backup_storage_provider.config.insert(
            "bucket".to_string(),
            self.backup_storage_provider.bucket.clone(),
        );
    }

    /// Bucket-to-cluster sync period
    pub fn backup_sync_period(&self) -> Duration {
        Duration::from_secs(
            self.backup_sync_period_seconds
                .unwrap_or(DEFAULT_BACKUP_SYNC_PERIOD_SECS),
        )
    }

    /// Garbage collection period
    pub fn gc_sync_period(&self) -> Duration {
        Duration::from_secs(
            self.gc_sync_period_seconds
                .unwrap_or(DEFAULT_GC_SYNC_PERIOD_SECS),
        )
    }

    /// Schedule evaluation period
    pub fn schedule_sync_period(&self) -> Duration {
        Duration::from_secs(
            self.schedule_sync_period_seconds
                .unwrap_or(DEFAULT_SCHEDULE_SYNC_PERIOD_SECS),
        )
    }

    /// Restic repository prefix within object storage
    pub fn restic_bucket(&self) -> String {
        self.backup_storage_provider
            .restic_bucket
            .clone()
            .unwrap_or_else(|| format!("{}/restic", self.backup_storage_provider.bucket))
    }
}
