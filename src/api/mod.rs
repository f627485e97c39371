//! Custom Resource Definitions for the Caravel API group
//!
//! All Caravel resources live in the `caravel.dev/v1` API group and are
//! namespaced to the server namespace (work items for the node agent
//! included). Specs express user intent; controllers own the status
//! subresource and advance each object's phase.

mod backup;
mod config;
mod hooks;
mod pod_volume;
mod requests;
mod restore;
mod schedule;

pub use backup::{Backup, BackupPhase, BackupSpec, BackupStatus, VolumeBackupInfo};
pub use backup::ARCHIVE_FORMAT_VERSION;
pub use config::{
    CloudProviderConfig, Config, ConfigSpec, ObjectStorageProviderConfig, DEFAULT_CONFIG_NAME,
    DEFAULT_RESOURCE_PRIORITIES,
};
pub use hooks::{BackupHooks, ExecHook, HookErrorMode, ResourceHookSpec};
pub use pod_volume::{
    PodRef, PodVolumeBackup, PodVolumeBackupSpec, PodVolumeBackupStatus, PodVolumePhase,
    PodVolumeRestore, PodVolumeRestoreSpec, PodVolumeRestoreStatus,
};
pub use requests::{
    DeleteBackupRequest, DeleteBackupRequestPhase, DeleteBackupRequestSpec,
    DeleteBackupRequestStatus, DownloadRequest, DownloadRequestPhase, DownloadRequestSpec,
    DownloadRequestStatus, DownloadTarget, DownloadTargetKind,
};
pub use restore::{Restore, RestorePhase, RestoreResult, RestoreSpec, RestoreStatus};
pub use schedule::{Schedule, SchedulePhase, ScheduleSpec, ScheduleStatus};

use kube::CustomResourceExt;

/// API group for all Caravel resources
pub const API_GROUP: &str = "caravel.dev";

/// API version for all Caravel resources
pub const API_VERSION: &str = "v1";

/// Label recording the UID of the pod a work item belongs to
pub const POD_UID_LABEL: &str = "caravel.dev/pod-uid";

/// Label recording the backup a derived object belongs to
pub const BACKUP_NAME_LABEL: &str = "caravel.dev/backup-name";

/// Label recording the restore a derived object belongs to
pub const RESTORE_NAME_LABEL: &str = "caravel.dev/restore-name";

/// Render every Caravel CRD manifest, for `caravel --crd`.
pub fn all_crds() -> Vec<k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition>
{
    vec![
        Backup::crd(),
        Restore::crd(),
        Schedule::crd(),
        DeleteBackupRequest::crd(),
        DownloadRequest::crd(),
        PodVolumeBackup::crd(),
        PodVolumeRestore::crd(),
        Config::crd(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crds_carry_the_caravel_group() {
        for crd in all_crds() {
            assert_eq!(crd.spec.group, API_GROUP);
        }
    }

    #[test]
    fn crds_are_namespaced() {
        for crd in all_crds() {
            assert_eq!(crd.spec.scope, "Namespaced", "{}", crd.spec.names.kind);
        }
    }
}
