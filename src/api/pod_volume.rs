//! Pod volume work item Custom Resource Definitions
//!
//! `PodVolumeBackup` and `PodVolumeRestore` are per-volume work items
//! delegated to the node-local agent. The orchestrator creates them; the
//! agent running on the pod's node reconciles them by invoking restic and
//! records the resulting snapshot ID back into status.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to the pod a volume belongs to
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodRef {
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub name: String,
    /// Pod UID, used for restic tags and restore target paths
    pub uid: String,
}

/// Specification for a PodVolumeBackup
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "caravel.dev",
    version = "v1",
    kind = "PodVolumeBackup",
    plural = "podvolumebackups",
    namespaced,
    status = "PodVolumeBackupStatus",
    printcolumn = r#"{"name":"Pod","type":"string","jsonPath":".spec.pod.name"}"#,
    printcolumn = r#"{"name":"Volume","type":"string","jsonPath":".spec.volume"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PodVolumeBackupSpec {
    /// Node the pod is scheduled on; only that node's agent picks this up
    pub node: String,

    /// The pod owning the volume
    pub pod: PodRef,

    /// Name of the volume within the pod spec
    pub volume: String,

    /// Repository URL prefix, e.g. `s3:https://s3.amazonaws.com/bucket/restic`
    pub repo_prefix: String,

    /// Tags recorded on the restic snapshot (backup name/uid, pod uid, ...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

/// Status for a PodVolumeBackup
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodVolumeBackupStatus {
    /// Current phase
    #[serde(default)]
    pub phase: PodVolumePhase,

    /// Restic snapshot ID, set on completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,

    /// Failure detail when the phase is Failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Specification for a PodVolumeRestore
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "caravel.dev",
    version = "v1",
    kind = "PodVolumeRestore",
    plural = "podvolumerestores",
    namespaced,
    status = "PodVolumeRestoreStatus",
    printcolumn = r#"{"name":"Pod","type":"string","jsonPath":".spec.pod.name"}"#,
    printcolumn = r#"{"name":"Volume","type":"string","jsonPath":".spec.volume"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PodVolumeRestoreSpec {
    /// The pod whose volume is being repopulated
    pub pod: PodRef,

    /// Name of the volume within the pod spec
    pub volume: String,

    /// Repository URL prefix
    pub repo_prefix: String,

    /// Restic snapshot to restore
    pub snapshot_id: String,
}

/// Status for a PodVolumeRestore
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodVolumeRestoreStatus {
    /// Current phase
    #[serde(default)]
    pub phase: PodVolumePhase,

    /// Failure detail when the phase is Failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Phase shared by both pod volume work item kinds
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum PodVolumePhase {
    /// Accepted, awaiting the owning node's agent
    #[default]
    New,
    /// The agent is running restic
    InProgress,
    /// Restic finished successfully
    Completed,
    /// Restic failed; message carries stderr
    Failed,
}

impl PodVolumePhase {
    /// True for phases the agent never picks up again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for PodVolumePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "New",
            Self::InProgress => "InProgress",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        };
        write!(f, "{s}")
    }
}
