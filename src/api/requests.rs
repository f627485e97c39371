//! Deletion and download request Custom Resource Definitions
//!
//! Both are short-lived request objects: a `DeleteBackupRequest` tears a
//! backup and all its artifacts down, a `DownloadRequest` surfaces a
//! time-limited signed URL for one artifact. Processed requests are
//! garbage-collected by their controllers.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a DeleteBackupRequest
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "caravel.dev",
    version = "v1",
    kind = "DeleteBackupRequest",
    plural = "deletebackuprequests",
    namespaced,
    status = "DeleteBackupRequestStatus",
    printcolumn = r#"{"name":"Backup","type":"string","jsonPath":".spec.backupName"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DeleteBackupRequestSpec {
    /// Name of the backup to delete
    pub backup_name: String,
}

/// Status for a DeleteBackupRequest
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeleteBackupRequestStatus {
    /// Current phase
    #[serde(default)]
    pub phase: DeleteBackupRequestPhase,

    /// Failures hit while deleting artifacts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Phase of a DeleteBackupRequest
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum DeleteBackupRequestPhase {
    /// Accepted but not yet picked up
    #[default]
    New,
    /// Artifact deletion underway
    InProgress,
    /// Deletion finished; errors, if any, are recorded
    Processed,
}

impl std::fmt::Display for DeleteBackupRequestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "New",
            Self::InProgress => "InProgress",
            Self::Processed => "Processed",
        };
        write!(f, "{s}")
    }
}

/// Specification for a DownloadRequest
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "caravel.dev",
    version = "v1",
    kind = "DownloadRequest",
    plural = "downloadrequests",
    namespaced,
    status = "DownloadRequestStatus",
    printcolumn = r#"{"name":"Target","type":"string","jsonPath":".spec.target.kind"}"#,
    printcolumn = r#"{"name":"Name","type":"string","jsonPath":".spec.target.name"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequestSpec {
    /// Artifact to surface a signed URL for
    pub target: DownloadTarget,
}

/// An artifact addressed by kind and owning operation name
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadTarget {
    /// Which artifact of the operation
    #[serde(default)]
    pub kind: DownloadTargetKind,

    /// Name of the backup or restore the artifact belongs to
    pub name: String,
}

/// Kinds of downloadable artifacts
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum DownloadTargetKind {
    /// The backup archive itself
    #[default]
    BackupContents,
    /// The gzipped backup log
    BackupLog,
    /// The gzipped restore log
    RestoreLog,
    /// The gzipped restore results (warnings/errors) blob
    RestoreResults,
}

/// Status for a DownloadRequest
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequestStatus {
    /// Current phase
    #[serde(default)]
    pub phase: DownloadRequestPhase,

    /// The signed URL, set when Processed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,

    /// When the signed URL stops working; the request object is deleted
    /// shortly after
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,
}

/// Phase of a DownloadRequest
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum DownloadRequestPhase {
    /// Accepted but not yet signed
    #[default]
    New,
    /// Signed URL recorded in status
    Processed,
}

impl std::fmt::Display for DownloadRequestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "New",
            Self::Processed => "Processed",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_target_serializes_kind_as_pascal_case() {
        let spec = DownloadRequestSpec {
            target: DownloadTarget {
                kind: DownloadTargetKind::BackupLog,
                name: "nightly-20240501".into(),
            },
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["target"]["kind"], "BackupLog");
        assert_eq!(json["target"]["name"], "nightly-20240501");
    }

    #[test]
    fn delete_request_phase_progression_is_named() {
        assert_eq!(DeleteBackupRequestPhase::New.to_string(), "New");
        assert_eq!(
            DeleteBackupRequestPhase::InProgress.to_string(),
            "InProgress"
        );
        assert_eq!(DeleteBackupRequestPhase::Processed.to_string(), "Processed");
    }
}
