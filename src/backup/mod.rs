//! Backup pipeline
//!
//! Walks every discovered resource in priority order, filters items by the
//! backup's include/exclude rules and label selector, and streams each
//! surviving object as JSON into a gzip-compressed tar. Volume snapshots,
//! pod volume backups, hooks, and custom actions happen per item on the
//! way into the archive.
//!
//! Per-item failures are accumulated: the backup completes with a
//! non-empty error count. Archive write failures abort the whole backup.

mod hooks;
mod item;
mod tar;

pub use hooks::{resolve_hooks, ItemHookHandler, ResolvedHook};
pub use item::{ItemBackupper, ItemKey, ResolvedAction};
pub use tar::TarAppender;

use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::sync::Arc;

use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::api::{Backup, ARCHIVE_FORMAT_VERSION};
use crate::client::DynamicClient;
use crate::cloud::BlockStore;
use crate::discovery::DiscoveryHelper;
use crate::plugin::{BackupItemAction, ResourceSelector};
use crate::podexec::PodCommandExecutor;
use crate::restic::PodVolumeBackupper;
use crate::util::{cohabitating_resources, IncludesExcludes, LabelQuery, OperationLog};
use crate::{Error, Result};

/// Counters a finished backup reports to its controller
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BackupSummary {
    /// Items that failed and were left out of the archive
    pub errors: usize,
    /// Warnings recorded in the operation log
    pub warnings: usize,
}

/// Takes backups: one instance serves the whole server
pub struct Backupper {
    discovery: Arc<DiscoveryHelper>,
    dynamic: Arc<dyn DynamicClient>,
    hook_handler: ItemHookHandler,
    block_store: Option<Arc<dyn BlockStore>>,
    pod_volumes: Option<Arc<dyn PodVolumeBackupper>>,
    resource_priorities: Vec<String>,
}

impl Backupper {
    /// Wire a backupper from its collaborators
    pub fn new(
        discovery: Arc<DiscoveryHelper>,
        dynamic: Arc<dyn DynamicClient>,
        pod_exec: Arc<dyn PodCommandExecutor>,
        block_store: Option<Arc<dyn BlockStore>>,
        pod_volumes: Option<Arc<dyn PodVolumeBackupper>>,
        resource_priorities: Vec<String>,
    ) -> Self {
        Self {
            discovery,
            dynamic,
            hook_handler: ItemHookHandler::new(pod_exec),
            block_store,
            pod_volumes,
            resource_priorities,
        }
    }

    /// Run the backup, streaming the archive into `archive_sink` and the
    /// gzipped operation log into `log_sink`.
    ///
    /// The backup's status picks up the archive version and every volume
    /// snapshot taken. `Err` means the archive is unusable; accumulated
    /// per-item failures are reported through the summary instead.
    pub async fn backup<W: Write, L: Write>(
        &self,
        backup: &mut Backup,
        archive_sink: W,
        log_sink: L,
        actions: &[Arc<dyn BackupItemAction>],
    ) -> Result<BackupSummary> {
        let start = Utc::now();
        let mut tar = TarAppender::new(
            GzEncoder::new(archive_sink, Compression::default()),
            start.timestamp().max(0) as u64,
        );
        let mut log = OperationLog::gzipped(log_sink);

        let backup_name = backup.metadata.name.clone().unwrap_or_default();
        log.info(format!("starting backup {backup_name}"));

        let namespaces = IncludesExcludes::new()
            .includes(backup.spec.included_namespaces.clone())
            .excludes(backup.spec.excluded_namespaces.clone());
        log.info(format!("including namespaces: {}", namespaces.includes_string()));
        log.info(format!("excluding namespaces: {}", namespaces.excludes_string()));

        let resources = hooks::qualify_resources(
            &backup.spec.included_resources,
            &backup.spec.excluded_resources,
            &self.discovery,
        );
        log.info(format!("including resources: {}", resources.includes_string()));
        log.info(format!("excluding resources: {}", resources.excludes_string()));

        let label_selector = backup.spec.label_selector.clone();
        if let Some(selector) = &label_selector {
            LabelQuery::parse(selector).map_err(Error::validation)?;
        }

        let resolved_hooks = resolve_hooks(&backup.spec.hooks.resources, &self.discovery)?;
        let resolved_actions = self.resolve_actions(actions).await?;

        let priorities = backup
            .spec
            .resource_priorities
            .clone()
            .unwrap_or_else(|| self.resource_priorities.clone());

        let mut backed_up = HashSet::new();
        let mut volume_backups = BTreeMap::new();
        let mut cohabitating = cohabitating_resources();
        let mut failed_items = 0usize;

        {
            let frozen_backup = backup.clone();
            let mut ib = ItemBackupper {
                backup: &frozen_backup,
                namespaces: &namespaces,
                resources: &resources,
                actions: &resolved_actions,
                hooks: &resolved_hooks,
                hook_handler: &self.hook_handler,
                discovery: &self.discovery,
                dynamic: self.dynamic.as_ref(),
                block_store: self.block_store.as_deref(),
                pod_volumes: self.pod_volumes.as_deref(),
                backed_up: &mut backed_up,
                tar: &mut tar,
                volume_backups: &mut volume_backups,
                log: &mut log,
            };

            for resource in self.discovery.sorted_resources(&priorities) {
                let gr = resource.group_resource();

                if let Some(entry) = cohabitating.get_mut(&resource.api_resource.plural) {
                    if entry.has_group(&resource.api_resource.group) {
                        if entry.seen {
                            ib.log.info(format!(
                                "skipping {gr}: already backed up under another group"
                            ));
                            continue;
                        }
                        entry.seen = true;
                    }
                }

                if !ib.resources.should_include(&gr) {
                    continue;
                }
                if !resource.namespaced
                    && gr != "namespaces"
                    && frozen_backup.spec.include_cluster_resources == Some(false)
                {
                    continue;
                }

                let items = match ib
                    .dynamic
                    .list(&resource.api_resource, resource.namespaced, label_selector.clone())
                    .await
                {
                    Ok(items) => items,
                    Err(e) => {
                        ib.log.error(format!("error listing {gr}: {e}"));
                        failed_items += 1;
                        continue;
                    }
                };

                for obj in items {
                    if let Err(e) = ib.backup_item(obj, &gr).await {
                        if matches!(e, Error::Archive(_)) {
                            return Err(e);
                        }
                        ib.log.error(format!("error backing up item in {gr}: {e}"));
                        failed_items += 1;
                    }
                }
            }
        }

        backup.status.get_or_insert_with(Default::default).version = ARCHIVE_FORMAT_VERSION;
        backup
            .status
            .get_or_insert_with(Default::default)
            .volume_backups = volume_backups;

        // `metadata` entry: one version byte, then the finalized backup.
        let mut metadata = vec![ARCHIVE_FORMAT_VERSION as u8];
        metadata.extend(serde_json::to_vec(&*backup)?);
        tar.append("metadata", &metadata)?;

        tar.into_inner()?
            .finish()
            .map_err(|e| Error::archive(format!("finishing gzip stream: {e}")))?;

        let summary = BackupSummary {
            errors: failed_items,
            warnings: log.warning_count(),
        };
        if summary.errors == 0 {
            log.info(format!("backup {backup_name} completed successfully"));
        } else {
            log.info(format!(
                "backup {backup_name} completed with {} error(s)",
                summary.errors
            ));
        }
        let _ = log.finish_gzip();

        Ok(summary)
    }

    async fn resolve_actions(
        &self,
        actions: &[Arc<dyn BackupItemAction>],
    ) -> Result<Vec<ResolvedAction>> {
        let mut resolved = Vec::with_capacity(actions.len());
        for action in actions {
            let selector = ResourceSelector::resolve(action.applies_to().await?)?;
            resolved.push(ResolvedAction {
                action: action.clone(),
                selector,
            });
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{BackupHooks, BackupSpec, ExecHook, HookErrorMode, ResourceHookSpec};
    use crate::client::MockDynamicClient;
    use crate::cloud::MockBlockStore;
    use crate::discovery::DiscoveredResource;
    use crate::podexec::MockPodCommandExecutor;
    use flate2::read::GzDecoder;
    use kube::discovery::ApiResource;
    use serde_json::{json, Value};
    use std::io::Read;

    fn resource(plural: &str, kind: &str, group: &str, namespaced: bool) -> DiscoveredResource {
        DiscoveredResource {
            api_resource: ApiResource {
                group: group.to_string(),
                version: "v1".to_string(),
                api_version: if group.is_empty() {
                    "v1".to_string()
                } else {
                    format!("{group}/v1")
                },
                kind: kind.to_string(),
                plural: plural.to_string(),
            },
            namespaced,
        }
    }

    fn discovery() -> Arc<DiscoveryHelper> {
        Arc::new(DiscoveryHelper::from_resources(vec![
            resource("namespaces", "Namespace", "", false),
            resource("persistentvolumes", "PersistentVolume", "", false),
            resource("pods", "Pod", "", true),
            resource("services", "Service", "", true),
            resource("deployments", "Deployment", "apps", true),
            resource("deployments", "Deployment", "extensions", true),
        ]))
    }

    fn priorities() -> Vec<String> {
        vec!["namespaces".to_string(), "persistentvolumes".to_string()]
    }

    fn namespace_obj(name: &str, app: &str) -> Value {
        json!({
            "apiVersion": "v1", "kind": "Namespace",
            "metadata": {"name": name, "labels": {"app": app}}
        })
    }

    fn deployment(ns: &str, name: &str, group: &str) -> Value {
        json!({
            "apiVersion": format!("{group}/v1"), "kind": "Deployment",
            "metadata": {"name": name, "namespace": ns, "labels": {"app": "nginx"}}
        })
    }

    fn service(ns: &str, name: &str) -> Value {
        json!({
            "apiVersion": "v1", "kind": "Service",
            "metadata": {"name": name, "namespace": ns, "labels": {"app": "nginx"}}
        })
    }

    fn pv(name: &str) -> Value {
        json!({
            "apiVersion": "v1", "kind": "PersistentVolume",
            "metadata": {
                "name": name,
                "labels": {"app": "nginx", crate::ZONE_LABEL: "us-east-1a"}
            },
            "spec": {"awsElasticBlockStore": {"volumeID": "vol-123"}}
        })
    }

    fn pod(ns: &str, name: &str) -> Value {
        json!({
            "apiVersion": "v1", "kind": "Pod",
            "metadata": {"name": name, "namespace": ns, "labels": {"app": "nginx"}},
            "spec": {"nodeName": "node-a", "containers": [{"name": "nginx"}]}
        })
    }

    /// Mock listing: returns canned items per group-resource.
    fn dynamic_with(items: Vec<(&'static str, Vec<Value>)>) -> Arc<MockDynamicClient> {
        let mut mock = MockDynamicClient::new();
        mock.expect_list().returning(move |ar, _, _| {
            let key = crate::discovery::group_resource_key(&ar.plural, &ar.group);
            Ok(items
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.clone())
                .unwrap_or_default())
        });
        Arc::new(mock)
    }

    fn backupper(
        dynamic: Arc<MockDynamicClient>,
        block_store: Option<Arc<dyn BlockStore>>,
    ) -> Backupper {
        let mut exec = MockPodCommandExecutor::new();
        exec.expect_execute().returning(|_, _, _| Ok(()));
        Backupper::new(
            discovery(),
            dynamic,
            Arc::new(exec),
            block_store,
            None,
            priorities(),
        )
    }

    fn entry_names(archive: &[u8]) -> Vec<String> {
        let mut tar = ::tar::Archive::new(GzDecoder::new(archive));
        tar.entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    async fn run_backup(
        backupper: &Backupper,
        backup: &mut Backup,
    ) -> (Vec<u8>, BackupSummary) {
        let mut archive = Vec::new();
        let mut log = Vec::new();
        let summary = backupper
            .backup(backup, &mut archive, &mut log, &[])
            .await
            .unwrap();
        (archive, summary)
    }

    fn nginx_backup() -> Backup {
        let mut backup = Backup::new(
            "b1",
            BackupSpec {
                label_selector: Some("app=nginx".into()),
                ..Default::default()
            },
        );
        backup.metadata.uid = Some("uid-b1".into());
        backup
    }

    #[tokio::test]
    async fn nginx_without_pv_archives_exactly_its_objects() {
        let dynamic = dynamic_with(vec![
            ("namespaces", vec![namespace_obj("nginx-example", "nginx")]),
            (
                "deployments.apps",
                vec![deployment("nginx-example", "nginx-deploy", "apps")],
            ),
            ("services", vec![service("nginx-example", "nginx-svc")]),
        ]);
        let b = backupper(dynamic, None);

        let mut backup = nginx_backup();
        let (archive, summary) = run_backup(&b, &mut backup).await;

        let mut names = entry_names(&archive);
        names.sort();
        assert_eq!(
            names,
            vec![
                "metadata",
                "resources/deployments.apps/namespaces/nginx-example/nginx-deploy.json",
                "resources/namespaces/cluster/nginx-example.json",
                "resources/services/namespaces/nginx-example/nginx-svc.json",
            ]
        );
        assert_eq!(summary.errors, 0);
    }

    #[tokio::test]
    async fn nginx_with_pv_records_volume_backup_info() {
        let dynamic = dynamic_with(vec![
            ("namespaces", vec![namespace_obj("nginx-example", "nginx")]),
            ("persistentvolumes", vec![pv("nginx-pv")]),
        ]);

        let mut store = MockBlockStore::new();
        store
            .expect_get_volume_id()
            .returning(|_| Ok(Some("vol-123".to_string())));
        store
            .expect_create_snapshot()
            .withf(|volume_id, zone, tags| {
                volume_id == "vol-123"
                    && zone == "us-east-1a"
                    && tags.get("caravel.dev/backup").map(String::as_str) == Some("b1")
                    && tags.get("caravel.dev/pv").map(String::as_str) == Some("nginx-pv")
            })
            .returning(|_, _, _| Ok("snap-abc".to_string()));
        store
            .expect_get_volume_info()
            .returning(|_, _| Ok(("gp2".to_string(), Some(100))));

        let b = backupper(dynamic, Some(Arc::new(store)));
        let mut backup = nginx_backup();
        let (archive, summary) = run_backup(&b, &mut backup).await;

        assert_eq!(summary.errors, 0);
        let info = &backup.status.as_ref().unwrap().volume_backups["nginx-pv"];
        assert_eq!(info.snapshot_id, "snap-abc");
        assert_eq!(info.volume_type.as_deref(), Some("gp2"));
        assert_eq!(info.iops, Some(100));
        assert_eq!(info.availability_zone, "us-east-1a");

        assert!(entry_names(&archive)
            .contains(&"resources/persistentvolumes/cluster/nginx-pv.json".to_string()));
    }

    #[tokio::test]
    async fn snapshot_volumes_false_skips_the_block_store() {
        let dynamic = dynamic_with(vec![("persistentvolumes", vec![pv("nginx-pv")])]);

        let mut store = MockBlockStore::new();
        store.expect_get_volume_id().times(0);
        store.expect_create_snapshot().times(0);

        let b = backupper(dynamic, Some(Arc::new(store)));
        let mut backup = nginx_backup();
        backup.spec.snapshot_volumes = Some(false);
        let (archive, summary) = run_backup(&b, &mut backup).await;

        assert_eq!(summary.errors, 0);
        // the PV object itself is still archived
        assert!(entry_names(&archive)
            .contains(&"resources/persistentvolumes/cluster/nginx-pv.json".to_string()));
        assert!(backup.status.unwrap().volume_backups.is_empty());
    }

    #[tokio::test]
    async fn failing_pre_hook_keeps_item_out_of_archive() {
        let dynamic = dynamic_with(vec![("pods", vec![pod("nginx-example", "nginx-0")])]);

        let mut exec = MockPodCommandExecutor::new();
        exec.expect_execute()
            .returning(|_, _, _| Err(Error::hook("exit status 1")));

        let b = Backupper::new(
            discovery(),
            dynamic,
            Arc::new(exec),
            None,
            None,
            priorities(),
        );

        let mut backup = nginx_backup();
        backup.spec.hooks = BackupHooks {
            resources: vec![ResourceHookSpec {
                name: "flush".into(),
                pre: vec![ExecHook {
                    command: vec!["/sbin/flush".into()],
                    on_error: HookErrorMode::Fail,
                    ..Default::default()
                }],
                ..Default::default()
            }],
        };

        let (archive, summary) = run_backup(&b, &mut backup).await;
        assert_eq!(summary.errors, 1);
        assert_eq!(entry_names(&archive), vec!["metadata"]);
    }

    #[tokio::test]
    async fn cohabitating_deployment_archived_once_under_canonical_group() {
        // The same deployment is visible under both apps and extensions.
        let dynamic = dynamic_with(vec![
            (
                "deployments.apps",
                vec![deployment("nginx-example", "web", "apps")],
            ),
            (
                "deployments.extensions",
                vec![deployment("nginx-example", "web", "extensions")],
            ),
        ]);
        let b = backupper(dynamic, None);

        let mut backup = nginx_backup();
        let (archive, _) = run_backup(&b, &mut backup).await;

        let deployment_entries: Vec<String> = entry_names(&archive)
            .into_iter()
            .filter(|n| n.contains("deployments"))
            .collect();
        assert_eq!(
            deployment_entries,
            vec!["resources/deployments.apps/namespaces/nginx-example/web.json"]
        );
    }

    #[tokio::test]
    async fn duplicate_listings_dedup_to_one_entry() {
        let dup = service("nginx-example", "nginx-svc");
        let dynamic = dynamic_with(vec![("services", vec![dup.clone(), dup])]);
        let b = backupper(dynamic, None);

        let mut backup = nginx_backup();
        let (archive, summary) = run_backup(&b, &mut backup).await;

        assert_eq!(summary.errors, 0);
        let service_entries: Vec<String> = entry_names(&archive)
            .into_iter()
            .filter(|n| n.contains("services"))
            .collect();
        assert_eq!(service_entries.len(), 1);
    }

    #[tokio::test]
    async fn priorities_lead_the_archive_order() {
        let dynamic = dynamic_with(vec![
            ("namespaces", vec![namespace_obj("nginx-example", "nginx")]),
            ("services", vec![service("nginx-example", "nginx-svc")]),
            (
                "deployments.apps",
                vec![deployment("nginx-example", "web", "apps")],
            ),
        ]);
        let b = backupper(dynamic, None);

        let mut backup = nginx_backup();
        let (archive, _) = run_backup(&b, &mut backup).await;

        let names = entry_names(&archive);
        // namespaces is the top priority, then remainder alphabetically:
        // deployments.apps before services
        assert!(names[0].starts_with("resources/namespaces/"));
        let deploy_idx = names.iter().position(|n| n.contains("deployments")).unwrap();
        let svc_idx = names.iter().position(|n| n.contains("services")).unwrap();
        assert!(deploy_idx < svc_idx);
    }

    #[tokio::test]
    async fn excluding_cluster_resources_keeps_namespaces() {
        let dynamic = dynamic_with(vec![
            ("namespaces", vec![namespace_obj("nginx-example", "nginx")]),
            ("persistentvolumes", vec![pv("nginx-pv")]),
        ]);
        let b = backupper(dynamic, None);

        let mut backup = nginx_backup();
        backup.spec.include_cluster_resources = Some(false);
        let (archive, _) = run_backup(&b, &mut backup).await;

        let names = entry_names(&archive);
        assert!(names.contains(&"resources/namespaces/cluster/nginx-example.json".to_string()));
        assert!(!names.iter().any(|n| n.contains("persistentvolumes")));
    }

    #[tokio::test]
    async fn identical_specs_produce_identical_entry_sets() {
        let items = vec![
            (
                "namespaces",
                vec![namespace_obj("nginx-example", "nginx")],
            ),
            ("services", vec![service("nginx-example", "nginx-svc")]),
        ];
        let b1 = backupper(dynamic_with(items.clone()), None);
        let b2 = backupper(dynamic_with(items), None);

        let (a1, _) = run_backup(&b1, &mut nginx_backup()).await;
        let (a2, _) = run_backup(&b2, &mut nginx_backup()).await;

        assert_eq!(entry_names(&a1), entry_names(&a2));
    }

    #[tokio::test]
    async fn metadata_entry_carries_version_byte_and_backup() {
        let dynamic = dynamic_with(vec![]);
        let b = backupper(dynamic, None);
        let mut backup = nginx_backup();
        let (archive, _) = run_backup(&b, &mut backup).await;

        let mut tar = ::tar::Archive::new(GzDecoder::new(&archive[..]));
        let mut entry = tar
            .entries()
            .unwrap()
            .map(|e| e.unwrap())
            .find(|e| e.path().unwrap().to_string_lossy() == "metadata")
            .unwrap();
        let mut body = Vec::new();
        entry.read_to_end(&mut body).unwrap();

        assert_eq!(body[0], ARCHIVE_FORMAT_VERSION as u8);
        let recorded: Backup = serde_json::from_slice(&body[1..]).unwrap();
        assert_eq!(recorded.metadata.name.as_deref(), Some("b1"));
        assert_eq!(recorded.status.unwrap().version, ARCHIVE_FORMAT_VERSION);
    }
}
