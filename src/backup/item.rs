//! Single-item backup logic
//!
//! Runs one object through the full per-item sequence: filters, dedup,
//! pre-hooks, custom actions (with recursive additional items), volume
//! snapshots, pod volume backups, post-hooks, and finally the archive
//! entry. Per-item failures bubble up as ordinary errors for the group
//! walk to accumulate; archive write failures are fatal to the backup.

use std::collections::{BTreeMap, HashSet};
use std::io::Write;

use serde_json::Value;

use super::hooks::{HookPhase, ItemHookHandler, ResolvedHook};
use super::tar::TarAppender;
use crate::api::{Backup, VolumeBackupInfo};
use crate::client::{item_labels, item_name, item_namespace, set_item_annotation, DynamicClient};
use crate::cloud::BlockStore;
use crate::discovery::DiscoveryHelper;
use crate::plugin::{BackupItemAction, ResourceSelector};
use crate::restic::PodVolumeBackupper;
use crate::util::{IncludesExcludes, OperationLog};
use crate::{Error, Result};

/// Dedup key: one archive entry per (resource, namespace, name)
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ItemKey {
    /// Canonical group-resource key
    pub resource: String,
    /// Namespace; empty for cluster-scoped items
    pub namespace: String,
    /// Object name
    pub name: String,
}

/// An item action with its scope resolved for matching
pub struct ResolvedAction {
    /// The action itself
    pub action: std::sync::Arc<dyn BackupItemAction>,
    /// Scope filters from `applies_to`
    pub selector: ResourceSelector,
}

/// Per-backup mutable state and collaborators for backing up items
pub struct ItemBackupper<'a, W: Write, L: Write> {
    /// The backup being taken
    pub backup: &'a Backup,
    /// Namespace filter
    pub namespaces: &'a IncludesExcludes,
    /// Resource filter over canonical group-resource keys
    pub resources: &'a IncludesExcludes,
    /// Resolved custom actions
    pub actions: &'a [ResolvedAction],
    /// Resolved hooks
    pub hooks: &'a [ResolvedHook],
    /// Hook executor
    pub hook_handler: &'a ItemHookHandler,
    /// Discovery, for resolving additional items
    pub discovery: &'a DiscoveryHelper,
    /// Dynamic reads for additional items
    pub dynamic: &'a dyn DynamicClient,
    /// Volume snapshot driver; absent disables PV snapshots
    pub block_store: Option<&'a dyn BlockStore>,
    /// Pod volume orchestrator; absent disables file-level backups
    pub pod_volumes: Option<&'a dyn PodVolumeBackupper>,
    /// Items already archived this backup
    pub backed_up: &'a mut HashSet<ItemKey>,
    /// Archive writer
    pub tar: &'a mut TarAppender<W>,
    /// Volume snapshots recorded so far, keyed by PV name
    pub volume_backups: &'a mut BTreeMap<String, VolumeBackupInfo>,
    /// The backup's operation log
    pub log: &'a mut OperationLog<L>,
}

impl<W: Write, L: Write> ItemBackupper<'_, W, L> {
    /// Back up one item, including anything its actions pull in.
    ///
    /// Filters are re-checked here because custom actions can enqueue
    /// items from anywhere.
    pub async fn backup_item(&mut self, mut item: Value, group_resource: &str) -> Result<()> {
        let namespace = item_namespace(&item);
        let name = item_name(&item);
        let display = if namespace.is_empty() {
            format!("{group_resource}/{name}")
        } else {
            format!("{group_resource}/{namespace}/{name}")
        };

        if !namespace.is_empty() && !self.namespaces.should_include(&namespace) {
            self.log
                .info(format!("excluding {display}: namespace is excluded"));
            return Ok(());
        }

        // Namespaces themselves are archived even when cluster-scoped
        // resources are excluded, so restores can re-create them.
        if namespace.is_empty()
            && group_resource != "namespaces"
            && self.backup.spec.include_cluster_resources == Some(false)
        {
            self.log.info(format!(
                "excluding {display}: cluster-scoped resources are excluded"
            ));
            return Ok(());
        }

        if !self.resources.should_include(group_resource) {
            self.log
                .info(format!("excluding {display}: resource is excluded"));
            return Ok(());
        }

        let key = ItemKey {
            resource: group_resource.to_string(),
            namespace: namespace.clone(),
            name: name.clone(),
        };
        if !self.backed_up.insert(key) {
            self.log
                .info(format!("skipping {display}: already backed up"));
            return Ok(());
        }

        self.log.info(format!("backing up {display}"));

        self.hook_handler
            .handle(self.log, group_resource, &item, self.hooks, HookPhase::Pre)
            .await?;

        let mut item_errs: Vec<Error> = Vec::new();

        match self.execute_actions(item, group_resource, &namespace).await {
            Ok(updated) => item = updated,
            Err((returned, err)) => {
                self.log
                    .error(format!("error executing actions for {display}: {err}"));
                item_errs.push(err);
                item = returned;
            }
        }

        if group_resource == "persistentvolumes" {
            match self.block_store {
                None => self
                    .log
                    .info("volume snapshots are not enabled, skipping".to_string()),
                Some(store) => {
                    if let Err(e) = self.take_pv_snapshot(store, &item, &name).await {
                        item_errs.push(e);
                    }
                }
            }
        }

        if group_resource == "pods" {
            if let Some(pod_volumes) = self.pod_volumes {
                let (snapshots, errs) =
                    pod_volumes.backup_pod_volumes(self.backup, &item).await;
                for (volume, snapshot_id) in snapshots {
                    set_item_annotation(
                        &mut item,
                        &format!("{}{volume}", crate::POD_VOLUME_SNAPSHOT_ANNOTATION_PREFIX),
                        &snapshot_id,
                    );
                }
                for e in errs {
                    self.log
                        .error(format!("pod volume backup error for {display}: {e}"));
                    item_errs.push(e);
                }
            }
        }

        if let Err(e) = self
            .hook_handler
            .handle(self.log, group_resource, &item, self.hooks, HookPhase::Post)
            .await
        {
            item_errs.push(e);
        }

        // A failed item is recorded in the log and errors, never archived.
        Error::aggregate(item_errs)?;

        let path = if namespace.is_empty() {
            format!("resources/{group_resource}/cluster/{name}.json")
        } else {
            format!("resources/{group_resource}/namespaces/{namespace}/{name}.json")
        };
        let body = serde_json::to_vec(&item)?;
        self.tar.append(&path, &body)
    }

    /// Run every matching action, recursing into additional items.
    /// On failure the (possibly part-mutated) item comes back with the
    /// error so the caller still holds it.
    async fn execute_actions(
        &mut self,
        mut item: Value,
        group_resource: &str,
        namespace: &str,
    ) -> std::result::Result<Value, (Value, Error)> {
        for idx in 0..self.actions.len() {
            let selector = &self.actions[idx].selector;
            if !selector.resources.should_include(group_resource) {
                continue;
            }
            if !namespace.is_empty() && !selector.namespaces.should_include(namespace) {
                continue;
            }
            if !selector.labels.matches(&item_labels(&item)) {
                continue;
            }

            self.log.info(format!(
                "executing custom action for {group_resource}/{}",
                item_name(&item)
            ));

            let action = self.actions[idx].action.clone();
            let (updated, additional) = match action.execute(item, self.backup).await {
                Ok(result) => result,
                Err(e) => {
                    // The action consumed the item; archive nothing for it.
                    return Err((Value::Null, e));
                }
            };
            item = updated;

            for identifier in additional {
                let resolved = match self.discovery.resource_for(&identifier.group_resource) {
                    Ok(r) => r,
                    Err(e) => return Err((item, e)),
                };
                let ns = if identifier.namespace.is_empty() {
                    None
                } else {
                    Some(identifier.namespace.clone())
                };
                let additional_item = match self
                    .dynamic
                    .get(&resolved.api_resource, ns, identifier.name.clone())
                    .await
                {
                    Ok(obj) => obj,
                    Err(e) => return Err((item, e)),
                };
                let gr = resolved.group_resource();
                if let Err(e) = Box::pin(self.backup_item(additional_item, &gr)).await {
                    return Err((item, e));
                }
            }
        }
        Ok(item)
    }

    /// Snapshot the disk behind a PersistentVolume and record its info.
    async fn take_pv_snapshot(
        &mut self,
        store: &dyn BlockStore,
        item: &Value,
        pv_name: &str,
    ) -> Result<()> {
        if self.backup.spec.snapshot_volumes == Some(false) {
            self.log
                .info("backup has volume snapshots disabled, skipping".to_string());
            return Ok(());
        }

        let labels = item_labels(item);
        let zone = labels.get(crate::ZONE_LABEL).cloned().unwrap_or_default();
        if zone.is_empty() {
            self.log.info(format!(
                "label {} is not present on persistent volume {pv_name}",
                crate::ZONE_LABEL
            ));
        }

        let volume_id = store
            .get_volume_id(item)
            .await
            .map_err(|e| Error::block_store(format!("getting volume ID for {pv_name}: {e}")))?;
        let Some(volume_id) = volume_id else {
            self.log.info(format!(
                "persistent volume {pv_name} is not a supported volume type for snapshots, skipping"
            ));
            return Ok(());
        };

        let backup_name = self.backup.metadata.name.clone().unwrap_or_default();
        let mut tags = BTreeMap::new();
        tags.insert("caravel.dev/backup".to_string(), backup_name);
        tags.insert("caravel.dev/pv".to_string(), pv_name.to_string());

        self.log
            .info(format!("snapshotting persistent volume {pv_name} ({volume_id})"));
        let snapshot_id = store
            .create_snapshot(&volume_id, &zone, &tags)
            .await
            .map_err(|e| {
                self.log
                    .error(format!("error creating snapshot for {pv_name}: {e}"));
                Error::block_store(format!("creating snapshot for {pv_name}: {e}"))
            })?;

        let (volume_type, iops) = store
            .get_volume_info(&volume_id, &zone)
            .await
            .map_err(|e| Error::block_store(format!("getting volume info for {pv_name}: {e}")))?;

        self.volume_backups.insert(
            pv_name.to_string(),
            VolumeBackupInfo {
                snapshot_id,
                volume_type: Some(volume_type),
                iops,
                availability_zone: zone,
            },
        );
        Ok(())
    }
}
