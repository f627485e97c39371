//! Caravel - cluster backup and disaster recovery for Kubernetes
//!
//! Caravel captures the declarative state of a cluster (its API objects)
//! together with the persistent-disk data they reference, stores the result
//! in cloud object storage, and reconstructs any recorded point-in-time
//! state into the same or a different cluster.
//!
//! Operators declare intent through custom resources (`Backup`, `Restore`,
//! `Schedule`, `DeleteBackupRequest`, `DownloadRequest`); Caravel's
//! controllers reconcile those declarations to completion.
//!
//! # Architecture
//!
//! - The **backup pipeline** walks discovered resources in priority order,
//!   filters them, runs pod hooks, snapshots persistent volumes through a
//!   pluggable block store, and streams a gzipped tar to object storage.
//! - The **restore pipeline** re-materializes archived objects in priority
//!   order, remaps namespaces, and re-creates volumes from snapshots.
//! - **Controllers** advance each custom resource through its state machine.
//! - The **plugin runtime** hosts out-of-process cloud drivers and custom
//!   item actions over a framed RPC transport on stdio.
//! - The **restic subsystem** manages per-namespace encrypted repositories
//!   for file-level pod volume backups, executed by a node-local agent.
//!
//! # Modules
//!
//! - [`api`] - Custom Resource Definitions (Backup, Restore, Schedule, etc.)
//! - [`backup`] - Backup pipeline (group walk, item backupper, tar writer)
//! - [`restore`] - Restore pipeline
//! - [`controller`] - Reconcile loops for every Caravel resource
//! - [`client`] - Dynamic client access for runtime-discovered kinds
//! - [`cloud`] - Object-store and block-store interfaces, backup service
//! - [`plugin`] - Out-of-process driver runtime
//! - [`restic`] - Per-namespace repository manager and command builder
//! - [`discovery`] - API resource discovery and priority ordering
//! - [`podexec`] - Command execution inside pods for backup hooks
//! - [`server`] - Server bootstrap and component wiring
//! - [`util`] - Include/exclude algebra, label selectors, operation logs
//! - [`error`] - Error types

#![deny(missing_docs)]
#![cfg_attr(test, allow(missing_docs))]

pub mod api;
pub mod backup;
pub mod client;
pub mod cloud;
pub mod controller;
pub mod discovery;
pub mod error;
pub mod plugin;
pub mod podexec;
pub mod restic;
pub mod restore;
pub mod server;
pub mod util;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// Centralized so CRD defaults, server wiring, and test fixtures agree.

/// Namespace Caravel runs in when none is configured
pub const DEFAULT_NAMESPACE: &str = "caravel";

/// Directory scanned for driver plugins
pub const DEFAULT_PLUGIN_DIR: &str = "/plugins";

/// Annotation listing pod volumes to back up with restic
pub const POD_VOLUME_BACKUP_ANNOTATION: &str = "backup.caravel.dev/backup-volumes";

/// Annotation prefix recording restic snapshot IDs per volume
pub const POD_VOLUME_SNAPSHOT_ANNOTATION_PREFIX: &str = "snapshot.caravel.dev/";

/// Label storing availability-zone info on PersistentVolumes
pub const ZONE_LABEL: &str = "failure-domain.beta.kubernetes.io/zone";

/// Default TTL applied to backups with no explicit TTL (30 days)
pub const DEFAULT_BACKUP_TTL_SECS: i64 = 30 * 24 * 60 * 60;
