//! Restore pipeline
//!
//! Reads a backup archive and re-materializes its objects in priority
//! order: namespaces are ensured (and remapped) before the namespaced
//! objects inside them, persistent volumes are re-created from recorded
//! snapshots, and pods with file-level backups are fitted with a wait init
//! container plus `PodVolumeRestore` work items for the node agent.
//!
//! Nothing is ever overwritten: an object that already exists in the
//! target cluster is recorded as a warning and left alone.

use std::collections::{BTreeMap, HashSet};
use std::io::{Read, Write};
use std::sync::Arc;

use flate2::read::GzDecoder;
use serde_json::{json, Value};

use crate::api::{Backup, Restore, RestoreResult};
use crate::client::{item_labels, DynamicClient};
use crate::cloud::BlockStore;
use crate::discovery::DiscoveryHelper;
use crate::plugin::{ResourceSelector, RestoreItemAction};
use crate::restic::{recorded_snapshots, PodVolumeRestorer, INIT_CONTAINER};
use crate::util::{IncludesExcludes, LabelQuery, OperationLog};
use crate::{Error, Result};

/// Resources never restored: node-bound state and Caravel's own records
const NON_RESTORABLE: &[&str] = &[
    "nodes",
    "events",
    "events.events.k8s.io",
    "backups.caravel.dev",
    "restores.caravel.dev",
];

/// One object read out of an archive
#[derive(Clone, Debug)]
pub struct ArchivedItem {
    /// Namespace recorded at backup time; empty for cluster-scoped
    pub namespace: String,
    /// Object name from the entry path
    pub name: String,
    /// The object body
    pub item: Value,
}

/// Partition an archive's entries by canonical group-resource key.
pub fn parse_archive(archive: &[u8]) -> Result<BTreeMap<String, Vec<ArchivedItem>>> {
    let mut tar = tar::Archive::new(GzDecoder::new(archive));
    let mut partitioned: BTreeMap<String, Vec<ArchivedItem>> = BTreeMap::new();

    for entry in tar
        .entries()
        .map_err(|e| Error::archive(format!("reading archive: {e}")))?
    {
        let mut entry = entry.map_err(|e| Error::archive(format!("reading entry: {e}")))?;
        let path = entry
            .path()
            .map_err(|e| Error::archive(format!("reading entry path: {e}")))?
            .to_string_lossy()
            .into_owned();

        let parts: Vec<&str> = path.split('/').collect();
        let (group_resource, namespace, file) = match parts.as_slice() {
            ["resources", gr, "cluster", file] => (gr.to_string(), String::new(), *file),
            ["resources", gr, "namespaces", ns, file] => {
                (gr.to_string(), ns.to_string(), *file)
            }
            _ => continue, // metadata and anything unrecognized
        };

        let mut body = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut body)
            .map_err(|e| Error::archive(format!("reading entry {path}: {e}")))?;
        let item: Value = serde_json::from_slice(&body)
            .map_err(|e| Error::archive(format!("parsing entry {path}: {e}")))?;

        partitioned.entry(group_resource).or_default().push(ArchivedItem {
            namespace,
            name: file.trim_end_matches(".json").to_string(),
            item,
        });
    }

    Ok(partitioned)
}

/// Strip server-managed fields so the object can be re-created.
///
/// Keeps name, namespace, labels, and annotations; drops uid,
/// resourceVersion, selfLink, creationTimestamp, and the entire status.
pub fn reset_metadata_and_status(item: &mut Value) {
    if let Some(obj) = item.as_object_mut() {
        obj.remove("status");
    }
    if let Some(metadata) = item.get_mut("metadata").and_then(Value::as_object_mut) {
        metadata.retain(|k, _| matches!(k.as_str(), "name" | "namespace" | "labels" | "annotations"));
    }
}

/// Prepend the wait init container so the pod blocks until the node agent
/// has repopulated the listed volumes.
pub fn add_restore_init_container(pod: &mut Value, volumes: &[String]) {
    let mounts: Vec<Value> = volumes
        .iter()
        .map(|v| json!({"name": v, "mountPath": format!("/restores/{v}")}))
        .collect();

    let init = json!({
        "name": INIT_CONTAINER,
        "image": "caravel/restore-helper:latest",
        "command": ["/caravel-restore-helper"],
        "volumeMounts": mounts,
    });

    let Some(spec) = pod.get_mut("spec").and_then(Value::as_object_mut) else {
        return;
    };
    let containers = spec
        .entry("initContainers")
        .or_insert_with(|| Value::Array(Vec::new()));
    if let Some(list) = containers.as_array_mut() {
        list.insert(0, init);
    }
}

/// Performs restores: one instance serves the whole server
pub struct Restorer {
    discovery: Arc<DiscoveryHelper>,
    dynamic: Arc<dyn DynamicClient>,
    block_store: Option<Arc<dyn BlockStore>>,
    pod_volume_restorer: Option<Arc<dyn PodVolumeRestorer>>,
    resource_priorities: Vec<String>,
}

impl Restorer {
    /// Wire a restorer from its collaborators
    pub fn new(
        discovery: Arc<DiscoveryHelper>,
        dynamic: Arc<dyn DynamicClient>,
        block_store: Option<Arc<dyn BlockStore>>,
        pod_volume_restorer: Option<Arc<dyn PodVolumeRestorer>>,
        resource_priorities: Vec<String>,
    ) -> Self {
        Self {
            discovery,
            dynamic,
            block_store,
            pod_volume_restorer,
            resource_priorities,
        }
    }

    /// Re-apply an archive to the cluster.
    ///
    /// Per-item findings land in the returned (warnings, errors) pair;
    /// `Err` is reserved for an unusable archive or spec.
    pub async fn restore<L: Write>(
        &self,
        restore: &Restore,
        backup: &Backup,
        archive: &[u8],
        log_sink: L,
        actions: &[Arc<dyn RestoreItemAction>],
    ) -> Result<(RestoreResult, RestoreResult)> {
        let mut log = OperationLog::gzipped(log_sink);
        let mut warnings = RestoreResult::default();
        let mut errors = RestoreResult::default();

        let restore_name = restore.metadata.name.clone().unwrap_or_default();
        log.info(format!(
            "starting restore {restore_name} from backup {}",
            restore.spec.backup_name
        ));

        let partitioned = parse_archive(archive)?;

        let namespaces = IncludesExcludes::new()
            .includes(restore.spec.included_namespaces.clone())
            .excludes(restore.spec.excluded_namespaces.clone());
        let resources = IncludesExcludes::generate(
            &restore.spec.included_resources,
            &restore.spec.excluded_resources,
            |name| {
                self.discovery
                    .resource_for(name)
                    .map(|r| r.group_resource())
                    .unwrap_or_else(|_| name.to_string())
            },
        );
        let labels = match restore.spec.label_selector.as_deref() {
            Some(s) => LabelQuery::parse(s).map_err(Error::validation)?,
            None => LabelQuery::everything(),
        };

        let mut resolved_actions = Vec::with_capacity(actions.len());
        for action in actions {
            let selector = ResourceSelector::resolve(action.applies_to().await?)?;
            resolved_actions.push((action.clone(), selector));
        }

        let ordered = self.ordered_group_resources(&partitioned);
        let mut ensured_namespaces: HashSet<String> = HashSet::new();

        for group_resource in ordered {
            if NON_RESTORABLE.contains(&group_resource.as_str()) {
                log.info(format!("skipping non-restorable resource {group_resource}"));
                continue;
            }
            if !resources.should_include(&group_resource) {
                log.info(format!("excluding resource {group_resource}"));
                continue;
            }

            let items = partitioned.get(&group_resource).cloned().unwrap_or_default();
            for archived in items {
                if !archived.namespace.is_empty()
                    && !namespaces.should_include(&archived.namespace)
                {
                    continue;
                }
                if !labels.matches(&item_labels(&archived.item)) {
                    continue;
                }

                self.restore_item(
                    restore,
                    backup,
                    &group_resource,
                    archived,
                    &resolved_actions,
                    &mut ensured_namespaces,
                    &mut warnings,
                    &mut errors,
                    &mut log,
                )
                .await;
            }
        }

        log.info(format!(
            "restore {restore_name} finished: {} warning(s), {} error(s)",
            warnings.count(),
            errors.count()
        ));
        let _ = log.finish_gzip();

        Ok((warnings, errors))
    }

    /// Archive group-resources ordered priorities-first then ascending.
    fn ordered_group_resources(
        &self,
        partitioned: &BTreeMap<String, Vec<ArchivedItem>>,
    ) -> Vec<String> {
        let mut remaining: Vec<String> = partitioned.keys().cloned().collect();
        let mut ordered = Vec::with_capacity(remaining.len());

        for priority in &self.resource_priorities {
            let key = self
                .discovery
                .resource_for(priority)
                .map(|r| r.group_resource())
                .unwrap_or_else(|_| priority.clone());
            if let Some(pos) = remaining.iter().position(|r| *r == key) {
                ordered.push(remaining.remove(pos));
            }
        }
        // BTreeMap keys are already ascending
        ordered.extend(remaining);
        ordered
    }

    #[allow(clippy::too_many_arguments)]
    async fn restore_item<L: Write>(
        &self,
        restore: &Restore,
        backup: &Backup,
        group_resource: &str,
        archived: ArchivedItem,
        actions: &[(Arc<dyn RestoreItemAction>, ResourceSelector)],
        ensured_namespaces: &mut HashSet<String>,
        warnings: &mut RestoreResult,
        errors: &mut RestoreResult,
        log: &mut OperationLog<L>,
    ) {
        let mut item = archived.item;
        let original_namespace = archived.namespace.clone();
        let target_namespace = restore
            .spec
            .namespace_mapping
            .get(&original_namespace)
            .cloned()
            .unwrap_or_else(|| original_namespace.clone());

        // Namespaces are ensured, not blindly re-created, and their names
        // follow the mapping.
        if group_resource == "namespaces" {
            let target = restore
                .spec
                .namespace_mapping
                .get(&archived.name)
                .cloned()
                .unwrap_or_else(|| archived.name.clone());
            if let Err(e) = self.ensure_namespace(&target, ensured_namespaces).await {
                errors.add("", format!("ensuring namespace {target}: {e}"));
            } else {
                log.info(format!("ensured namespace {target}"));
            }
            return;
        }

        reset_metadata_and_status(&mut item);

        if group_resource == "persistentvolumes" {
            match self.prepare_persistent_volume(restore, backup, &archived.name, item).await {
                Ok(prepared) => item = prepared,
                Err(e) => {
                    log.error(format!("persistent volume {}: {e}", archived.name));
                    errors.add("", format!("persistent volume {}: {e}", archived.name));
                    return;
                }
            }
        }

        let resolved = match self.discovery.resource_for(group_resource) {
            Ok(r) => r,
            Err(e) => {
                log.warn(format!(
                    "resource {group_resource} is not served by the target cluster: {e}"
                ));
                warnings.add_global(format!("{group_resource} not restorable here: {e}"));
                return;
            }
        };

        let namespace = if resolved.namespaced {
            if let Some(meta) = item.get_mut("metadata").and_then(Value::as_object_mut) {
                meta.insert(
                    "namespace".to_string(),
                    Value::String(target_namespace.clone()),
                );
            }
            if let Err(e) = self
                .ensure_namespace(&target_namespace, ensured_namespaces)
                .await
            {
                errors.add(
                    &target_namespace,
                    format!("ensuring namespace {target_namespace}: {e}"),
                );
                return;
            }
            Some(target_namespace.clone())
        } else {
            None
        };

        // Custom actions see the item after namespace remapping, so what
        // they mutate is what lands in the cluster.
        for (action, selector) in actions {
            if !selector.resources.should_include(group_resource) {
                continue;
            }
            if !original_namespace.is_empty()
                && !selector.namespaces.should_include(&original_namespace)
            {
                continue;
            }
            if !selector.labels.matches(&item_labels(&item)) {
                continue;
            }
            match action.execute(item.clone(), restore).await {
                Ok(updated) => item = updated,
                Err(e) => {
                    log.error(format!(
                        "custom action failed for {group_resource}/{}: {e}",
                        archived.name
                    ));
                    errors.add(
                        namespace.as_deref().unwrap_or(""),
                        format!("custom action for {group_resource}/{}: {e}", archived.name),
                    );
                    return;
                }
            }
        }

        // Pods carrying recorded snapshots block on the wait init
        // container until the node agent repopulates their volumes.
        let snapshots = recorded_snapshots(&item);
        if group_resource == "pods" && !snapshots.is_empty() {
            let volumes: Vec<String> = snapshots.keys().cloned().collect();
            add_restore_init_container(&mut item, &volumes);
        }

        let display = match &namespace {
            Some(ns) => format!("{group_resource}/{ns}/{}", archived.name),
            None => format!("{group_resource}/{}", archived.name),
        };
        log.info(format!("restoring {display}"));

        let created = match self
            .dynamic
            .create(&resolved.api_resource, namespace.clone(), item)
            .await
        {
            Ok(created) => created,
            Err(e) if e.is_already_exists() => {
                log.warn(format!("{display} already exists, not overwritten"));
                warnings.add(namespace.as_deref().unwrap_or(""), format!("{display} already exists"));
                return;
            }
            Err(e) => {
                log.error(format!("error restoring {display}: {e}"));
                errors.add(namespace.as_deref().unwrap_or(""), format!("{display}: {e}"));
                return;
            }
        };

        if group_resource == "pods" && !snapshots.is_empty() {
            if let Some(restorer) = &self.pod_volume_restorer {
                if let Err(e) = restorer.restore_pod_volumes(restore, &created).await {
                    errors.add(
                        namespace.as_deref().unwrap_or(""),
                        format!("pod volume restore for {display}: {e}"),
                    );
                }
            } else {
                warnings.add(
                    namespace.as_deref().unwrap_or(""),
                    format!("{display} has file-level backups but pod volume restores are disabled"),
                );
            }
        }
    }

    /// Re-create a PV's disk from its recorded snapshot, when enabled.
    ///
    /// Without a recorded snapshot (or with restorePVs disabled) the
    /// object is restored as-is. The claim reference's server-managed
    /// fields are always cleared so the PV can bind again.
    async fn prepare_persistent_volume(
        &self,
        restore: &Restore,
        backup: &Backup,
        pv_name: &str,
        mut item: Value,
    ) -> Result<Value> {
        if let Some(claim_ref) = item
            .pointer_mut("/spec/claimRef")
            .and_then(Value::as_object_mut)
        {
            claim_ref.remove("uid");
            claim_ref.remove("resourceVersion");
        }

        if restore.spec.restore_pvs == Some(false) {
            return Ok(item);
        }

        let info = backup
            .status
            .as_ref()
            .and_then(|s| s.volume_backups.get(pv_name));
        let (Some(info), Some(store)) = (info, self.block_store.as_ref()) else {
            return Ok(item);
        };

        let volume_id = store
            .create_volume_from_snapshot(
                &info.snapshot_id,
                info.volume_type.as_deref().unwrap_or_default(),
                &info.availability_zone,
                info.iops,
            )
            .await?;
        store.set_volume_id(item.take(), &volume_id).await
    }

    async fn ensure_namespace(
        &self,
        name: &str,
        ensured: &mut HashSet<String>,
    ) -> Result<()> {
        if name.is_empty() || !ensured.insert(name.to_string()) {
            return Ok(());
        }

        let ns_resource = self.discovery.resource_for("namespaces")?;
        let ns = json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {"name": name}
        });
        match self.dynamic.create(&ns_resource.api_resource, None, ns).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => {
                ensured.remove(name);
                Err(e)
            }
        }
    }
}
