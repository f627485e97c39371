//! Backup Custom Resource Definition
//!
//! A `Backup` is an intent to capture cluster state into an archive in
//! object storage. Its status records the archive format version, the
//! expiration derived from the TTL, and the volume snapshots taken.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::hooks::BackupHooks;

/// Current archive format version written into backup status
pub const ARCHIVE_FORMAT_VERSION: u32 = 1;

/// Specification for a Backup
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "caravel.dev",
    version = "v1",
    kind = "Backup",
    plural = "backups",
    namespaced,
    status = "BackupStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Expires","type":"date","jsonPath":".status.expiration"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    /// Namespaces to include; empty or `*` means all
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included_namespaces: Vec<String>,

    /// Namespaces to exclude; excludes win over includes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_namespaces: Vec<String>,

    /// Resources to include, as partial or fully-qualified names; empty or
    /// `*` means all
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included_resources: Vec<String>,

    /// Resources to exclude
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_resources: Vec<String>,

    /// Label selector restricting which items are backed up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<String>,

    /// Whether cluster-scoped resources are included. `None` means
    /// "include those needed by the namespaced items"; `Some(false)` skips
    /// everything cluster-scoped except namespaces themselves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_cluster_resources: Option<bool>,

    /// Whether persistent volumes are snapshotted through the block store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_volumes: Option<bool>,

    /// How long the backup lives before garbage collection, e.g. `24h`,
    /// `30d`. Defaults to 30 days.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,

    /// Ordered group-resource priorities overriding the server defaults
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_priorities: Option<Vec<String>>,

    /// Pre/post hooks executed in pods during the backup
    #[serde(default, skip_serializing_if = "is_default_hooks")]
    pub hooks: BackupHooks,
}

fn is_default_hooks(h: &BackupHooks) -> bool {
    h.resources.is_empty()
}

impl BackupSpec {
    /// Validate the spec, returning every problem found.
    ///
    /// Validation failures put the backup into `FailedValidation` and are
    /// never retried, so the list is exhaustive rather than fail-fast.
    pub fn validate(&self) -> Vec<String> {
        let mut errs = Vec::new();

        for ns in self.excluded_namespaces.iter() {
            if ns == "*" {
                errs.push("excludedNamespaces cannot contain '*'".to_string());
            }
        }
        for r in self.excluded_resources.iter() {
            if r == "*" {
                errs.push("excludedResources cannot contain '*'".to_string());
            }
        }
        if let Some(ttl) = &self.ttl {
            if parse_ttl(ttl).is_none() {
                errs.push(format!("invalid ttl {ttl:?}: expected e.g. 90s, 24h, 30d"));
            }
        }
        if let Some(sel) = &self.label_selector {
            if let Err(e) = crate::util::labels::LabelQuery::parse(sel) {
                errs.push(format!("invalid labelSelector: {e}"));
            }
        }

        errs
    }

    /// TTL as a chrono duration, applying the 30-day default.
    pub fn ttl_duration(&self) -> Duration {
        self.ttl
            .as_deref()
            .and_then(parse_ttl)
            .unwrap_or_else(|| Duration::seconds(crate::DEFAULT_BACKUP_TTL_SECS))
    }
}

/// Parse a duration of the form `<n><unit>` with unit s, m, h, or d.
pub fn parse_ttl(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.len() < 2 {
        return None;
    }
    let (num, unit) = s.split_at(s.len() - 1);
    let n: i64 = num.parse().ok()?;
    if n < 0 {
        return None;
    }
    match unit {
        "s" => Some(Duration::seconds(n)),
        "m" => Some(Duration::minutes(n)),
        "h" => Some(Duration::hours(n)),
        "d" => Some(Duration::days(n)),
        _ => None,
    }
}

/// Status for a Backup
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    /// Current phase of the backup lifecycle
    #[serde(default)]
    pub phase: BackupPhase,

    /// Problems found during validation; set with `FailedValidation`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation_errors: Vec<String>,

    /// Archive format version the backup was written with
    #[serde(default)]
    pub version: u32,

    /// When the backup becomes eligible for garbage collection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,

    /// Volume snapshots taken, keyed by persistent volume name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volume_backups: BTreeMap<String, VolumeBackupInfo>,
}

impl BackupStatus {
    /// Create a status in the given phase
    pub fn with_phase(phase: BackupPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }
}

/// Phase of a Backup's lifecycle
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum BackupPhase {
    /// Accepted but not yet picked up by the backup controller
    #[default]
    New,
    /// The backup pipeline is running
    InProgress,
    /// Archive uploaded; per-item errors, if any, are in the log blob
    Completed,
    /// The archive could not be produced or uploaded
    Failed,
    /// The spec failed validation; never retried
    FailedValidation,
    /// A DeleteBackupRequest is tearing the backup down
    Deleting,
}

impl BackupPhase {
    /// True for phases that are never reconciled again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::FailedValidation
        )
    }
}

impl std::fmt::Display for BackupPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "New",
            Self::InProgress => "InProgress",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::FailedValidation => "FailedValidation",
            Self::Deleting => "Deleting",
        };
        write!(f, "{s}")
    }
}

/// Record of one persistent-volume snapshot taken during a backup.
///
/// Produced by the backup pipeline, consumed by restore to re-create the
/// volume with matching provider characteristics.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeBackupInfo {
    /// Provider snapshot identifier
    pub snapshot_id: String,

    /// Provider volume type (e.g. gp2, pd-ssd)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_type: Option<String>,

    /// Provisioned IOPS, where the provider reports them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iops: Option<i64>,

    /// Availability zone the volume lived in
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub availability_zone: String,
}
