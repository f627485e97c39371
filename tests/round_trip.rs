//! End-to-end pipeline test: back up an in-memory cluster, restore into a
//! second one, and compare what comes out the other side.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::discovery::ApiResource;
use parking_lot::Mutex;
use serde_json::{json, Value};

use caravel::api::{Backup, BackupSpec, Restore, RestoreSpec};
use caravel::backup::Backupper;
use caravel::client::{item_name, item_namespace, DynamicClient};
use caravel::discovery::{DiscoveredResource, DiscoveryHelper};
use caravel::podexec::PodCommandExecutor;
use caravel::restore::Restorer;
use caravel::util::LabelQuery;
use caravel::{Error, Result};

/// In-memory cluster keyed by canonical group-resource
#[derive(Default)]
struct FakeCluster {
    objects: Mutex<HashMap<String, Vec<Value>>>,
}

impl FakeCluster {
    fn seed(&self, group_resource: &str, obj: Value) {
        self.objects
            .lock()
            .entry(group_resource.to_string())
            .or_default()
            .push(obj);
    }

    fn all(&self, group_resource: &str) -> Vec<Value> {
        self.objects
            .lock()
            .get(group_resource)
            .cloned()
            .unwrap_or_default()
    }

    fn key(ar: &ApiResource) -> String {
        caravel::discovery::group_resource_key(&ar.plural, &ar.group)
    }
}

#[async_trait]
impl DynamicClient for FakeCluster {
    async fn list(
        &self,
        ar: &ApiResource,
        _namespaced: bool,
        label_selector: Option<String>,
    ) -> Result<Vec<Value>> {
        let query = match label_selector.as_deref() {
            Some(s) => LabelQuery::parse(s).map_err(Error::validation)?,
            None => LabelQuery::everything(),
        };
        Ok(self
            .all(&Self::key(ar))
            .into_iter()
            .filter(|obj| query.matches(&caravel::client::item_labels(obj)))
            .collect())
    }

    async fn get(
        &self,
        ar: &ApiResource,
        namespace: Option<String>,
        name: String,
    ) -> Result<Value> {
        self.all(&Self::key(ar))
            .into_iter()
            .find(|obj| {
                item_name(obj) == name
                    && namespace
                        .as_deref()
                        .map(|ns| item_namespace(obj) == ns)
                        .unwrap_or(true)
            })
            .ok_or_else(|| Error::validation(format!("not found: {name}")))
    }

    async fn create(
        &self,
        ar: &ApiResource,
        _namespace: Option<String>,
        obj: Value,
    ) -> Result<Value> {
        let key = Self::key(ar);
        let name = item_name(&obj);
        let namespace = item_namespace(&obj);

        let mut objects = self.objects.lock();
        let existing = objects.entry(key).or_default();
        if existing
            .iter()
            .any(|o| item_name(o) == name && item_namespace(o) == namespace)
        {
            return Err(kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: format!("{name} already exists"),
                reason: "AlreadyExists".to_string(),
                code: 409,
            })
            .into());
        }
        existing.push(obj.clone());
        Ok(obj)
    }
}

struct NoopExec;

#[async_trait]
impl PodCommandExecutor for NoopExec {
    async fn execute(&self, _: &str, _: &str, _: &caravel::api::ExecHook) -> Result<()> {
        Ok(())
    }
}

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
        resource("pods", "Pod", "", true),
        resource("services", "Service", "", true),
        resource("deployments", "Deployment", "apps", true),
    ]))
}

fn priorities() -> Vec<String> {
    vec!["namespaces".to_string(), "pods".to_string()]
}

fn seeded_cluster() -> Arc<FakeCluster> {
    let cluster = Arc::new(FakeCluster::default());
    cluster.seed(
        "namespaces",
        json!({
            "apiVersion": "v1", "kind": "Namespace",
            "metadata": {"name": "nginx-example", "labels": {"app": "nginx"}}
        }),
    );
    cluster.seed(
        "deployments.apps",
        json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": {
                "name": "nginx-deploy", "namespace": "nginx-example",
                "labels": {"app": "nginx"},
                "uid": "uid-1", "resourceVersion": "100",
                "creationTimestamp": "2024-01-01T00:00:00Z"
            },
            "spec": {"replicas": 2, "selector": {"matchLabels": {"app": "nginx"}}},
            "status": {"readyReplicas": 2}
        }),
    );
    cluster.seed(
        "services",
        json!({
            "apiVersion": "v1", "kind": "Service",
            "metadata": {
                "name": "nginx-svc", "namespace": "nginx-example",
                "labels": {"app": "nginx"}, "uid": "uid-2"
            },
            "spec": {"ports": [{"port": 80}]}
        }),
    );
    cluster
}

async fn take_backup(cluster: Arc<FakeCluster>, backup: &mut Backup) -> Vec<u8> {
    let backupper = Backupper::new(
        discovery(),
        cluster,
        Arc::new(NoopExec),
        None,
        None,
        priorities(),
    );
    let mut archive = Vec::new();
    let mut log = Vec::new();
    let summary = backupper
        .backup(backup, &mut archive, &mut log, &[])
        .await
        .expect("backup runs");
    assert_eq!(summary.errors, 0);
    archive
}

#[tokio::test]
async fn restore_of_a_backup_reproduces_the_cluster() {
    let source = seeded_cluster();
    let mut backup = Backup::new(
        "b1",
        BackupSpec {
            label_selector: Some("app=nginx".into()),
            ..Default::default()
        },
    );
    let archive = take_backup(source.clone(), &mut backup).await;

    // Restore into an empty cluster.
    let target = Arc::new(FakeCluster::default());
    let restorer = Restorer::new(
        discovery(),
        target.clone(),
        None,
        None,
        priorities(),
    );
    let restore = Restore::new(
        "r1",
        RestoreSpec {
            backup_name: "b1".into(),
            ..Default::default()
        },
    );

    let (warnings, errors) = restorer
        .restore(&restore, &backup, &archive, Vec::new(), &[])
        .await
        .expect("restore runs");
    assert!(warnings.is_empty(), "{warnings:?}");
    assert!(errors.is_empty(), "{errors:?}");

    // Every non-excluded object exists in the target with identical spec
    // and cleared server-managed fields.
    let deployments = target.all("deployments.apps");
    assert_eq!(deployments.len(), 1);
    let restored = &deployments[0];
    assert_eq!(item_name(restored), "nginx-deploy");
    assert_eq!(item_namespace(restored), "nginx-example");
    assert_eq!(restored["spec"]["replicas"], 2);
    assert!(restored["metadata"].get("uid").is_none());
    assert!(restored["metadata"].get("resourceVersion").is_none());
    assert!(restored.get("status").is_none());

    let services = target.all("services");
    assert_eq!(services.len(), 1);
    assert_eq!(services[0]["spec"]["ports"][0]["port"], 80);

    let namespaces = target.all("namespaces");
    assert_eq!(namespaces.len(), 1);
    assert_eq!(item_name(&namespaces[0]), "nginx-example");
}

#[tokio::test]
async fn restore_into_the_source_cluster_only_warns() {
    let source = seeded_cluster();
    let mut backup = Backup::new("b1", BackupSpec::default());
    let archive = take_backup(source.clone(), &mut backup).await;

    let restorer = Restorer::new(discovery(), source, None, None, priorities());
    let restore = Restore::new(
        "r1",
        RestoreSpec {
            backup_name: "b1".into(),
            ..Default::default()
        },
    );

    let (warnings, errors) = restorer
        .restore(&restore, &backup, &archive, Vec::new(), &[])
        .await
        .expect("restore runs");

    assert!(errors.is_empty(), "{errors:?}");
    // The deployment and service already exist; the namespace is ensured,
    // which tolerates pre-existing namespaces silently.
    assert_eq!(warnings.count(), 2, "{warnings:?}");
}

#[tokio::test]
async fn namespace_remap_lands_objects_in_the_new_namespace() {
    let source = seeded_cluster();
    let mut backup = Backup::new("b1", BackupSpec::default());
    let archive = take_backup(source, &mut backup).await;

    let target = Arc::new(FakeCluster::default());
    let restorer = Restorer::new(discovery(), target.clone(), None, None, priorities());

    let mut spec = RestoreSpec {
        backup_name: "b1".into(),
        ..Default::default()
    };
    spec.namespace_mapping
        .insert("nginx-example".to_string(), "nginx-copy".to_string());
    let restore = Restore::new("r1", spec);

    let (_, errors) = restorer
        .restore(&restore, &backup, &archive, Vec::new(), &[])
        .await
        .expect("restore runs");
    assert!(errors.is_empty(), "{errors:?}");

    let deployments = target.all("deployments.apps");
    assert_eq!(item_namespace(&deployments[0]), "nginx-copy");
    let namespaces = target.all("namespaces");
    assert!(namespaces.iter().any(|n| item_name(n) == "nginx-copy"));
}
