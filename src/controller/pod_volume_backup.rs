//! PodVolumeBackup controller (node agent)
//!
//! Runs inside the per-node agent daemonset. Each agent only processes
//! work items whose pod is scheduled on its own node, invoking restic
//! against the pod's volume directory on the host and recording the
//! resulting snapshot ID back into status.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{error, info};

use crate::api::{PodVolumeBackup, PodVolumeBackupStatus, PodVolumePhase};
use crate::controller::AgentClient;
use crate::restic::{self, CommandRunner};
use crate::Error;

/// Collaborators for the agent-side backup controller
pub struct Context {
    /// API access
    pub kube: Arc<dyn AgentClient>,
    /// The node this agent runs on
    pub node_name: String,
    /// Namespace holding Caravel resources
    pub namespace: String,
    /// Restic executor
    pub runner: Arc<dyn CommandRunner>,
}

/// Resolve the on-host directory name for a pod volume.
///
/// Volumes backed by a PersistentVolumeClaim live under the bound PV's
/// name; everything else lives under the volume's own name.
pub fn volume_directory(pod: &Pod, volume_name: &str, pvc_volume_name: Option<&str>) -> Option<String> {
    let volumes = pod.spec.as_ref()?.volumes.as_ref()?;
    let volume = volumes.iter().find(|v| v.name == volume_name)?;
    if volume.persistent_volume_claim.is_some() {
        pvc_volume_name.map(|s| s.to_string())
    } else {
        Some(volume.name.clone())
    }
}

/// Claim name behind a pod volume, when it is PVC-backed
pub fn volume_claim_name(pod: &Pod, volume_name: &str) -> Option<String> {
    pod.spec
        .as_ref()?
        .volumes
        .as_ref()?
        .iter()
        .find(|v| v.name == volume_name)?
        .persistent_volume_claim
        .as_ref()
        .map(|claim| claim.claim_name.clone())
}

/// Host path restic reads the volume from
pub fn host_volume_path(pod_uid: &str, volume_dir: &str) -> String {
    format!("/host_pods/{pod_uid}/volumes/{volume_dir}")
}

/// Resolve a work item's volume to its on-host directory name.
///
/// PVC-backed volumes go through the claim to the bound PV's name.
pub(crate) async fn resolve_volume_directory(
    kube: &dyn AgentClient,
    pod: &Pod,
    pod_namespace: &str,
    volume: &str,
) -> Result<String, Error> {
    let pvc_volume_name = match volume_claim_name(pod, volume) {
        Some(claim) => kube.pvc_volume_name(pod_namespace, &claim).await?,
        None => None,
    };
    volume_directory(pod, volume, pvc_volume_name.as_deref()).ok_or_else(|| {
        Error::restic(format!(
            "volume {volume} not found in pod {pod_namespace}/{}",
            pod.metadata.name.as_deref().unwrap_or_default()
        ))
    })
}

/// Reconcile one PodVolumeBackup
pub async fn reconcile(pvb: Arc<PodVolumeBackup>, ctx: Arc<Context>) -> Result<Action, Error> {
    // Another node's work item; its agent will pick it up.
    if pvb.spec.node != ctx.node_name {
        return Ok(Action::await_change());
    }
    let phase = pvb
        .status
        .as_ref()
        .map(|s| s.phase)
        .unwrap_or(PodVolumePhase::New);
    if phase != PodVolumePhase::New {
        return Ok(Action::await_change());
    }

    let name = pvb.name_any();
    let namespace = pvb.namespace().unwrap_or_else(|| ctx.namespace.clone());
    info!(item = %name, volume = %pvb.spec.volume, "processing pod volume backup");

    ctx.kube
        .patch_pod_volume_backup_status(
            &namespace,
            &name,
            &PodVolumeBackupStatus {
                phase: PodVolumePhase::InProgress,
                ..Default::default()
            },
        )
        .await?;

    match run_backup(&pvb, &ctx).await {
        Ok(snapshot_id) => {
            ctx.kube
                .patch_pod_volume_backup_status(
                    &namespace,
                    &name,
                    &PodVolumeBackupStatus {
                        phase: PodVolumePhase::Completed,
                        snapshot_id: Some(snapshot_id),
                        message: None,
                    },
                )
                .await?;
        }
        Err(e) => {
            error!(item = %name, error = %e, "pod volume backup failed");
            ctx.kube
                .patch_pod_volume_backup_status(
                    &namespace,
                    &name,
                    &PodVolumeBackupStatus {
                        phase: PodVolumePhase::Failed,
                        snapshot_id: None,
                        message: Some(e.to_string()),
                    },
                )
                .await?;
        }
    }

    Ok(Action::await_change())
}

async fn run_backup(pvb: &PodVolumeBackup, ctx: &Context) -> Result<String, Error> {
    let pod_ref = &pvb.spec.pod;
    let pod = ctx
        .kube
        .get_pod(&pod_ref.namespace, &pod_ref.name)
        .await?
        .ok_or_else(|| {
            Error::restic(format!("pod {}/{} not found", pod_ref.namespace, pod_ref.name))
        })?;

    let volume_dir =
        resolve_volume_directory(ctx.kube.as_ref(), &pod, &pod_ref.namespace, &pvb.spec.volume)
            .await?;

    let key = ctx.kube.repository_key(&pod_ref.namespace).await?;
    let credentials = restic::password_tempfile(&key)?;

    let path = host_volume_path(&pod_ref.uid, &volume_dir);
    let cmd = restic::command::backup_command(
        &pvb.spec.repo_prefix,
        &pod_ref.namespace,
        credentials.path(),
        &path,
        &pvb.spec.tags,
    );

    let output = ctx.runner.run(&cmd).await?;
    if !output.success {
        return Err(Error::restic(format!("restic backup failed: {}", output.stderr)));
    }

    // The snapshot ID comes from a tag-filtered query, not from parsing
    // backup output, so interrupted runs resolve the same way.
    let snapshots_cmd = restic::command::snapshots_command(
        &pvb.spec.repo_prefix,
        &pod_ref.namespace,
        credentials.path(),
        &pvb.spec.tags,
    );
    let output = ctx.runner.run(&snapshots_cmd).await?;
    if !output.success {
        return Err(Error::restic(format!(
            "restic snapshots query failed: {}",
            output.stderr
        )));
    }
    restic::parse_snapshot_id(&output.stdout)
}

/// Requeue failed reconciles with a short delay
pub fn error_policy(pvb: Arc<PodVolumeBackup>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(item = %pvb.name_any(), error = %error, "pod volume backup reconciliation failed");
    Action::requeue(Duration::from_secs(15))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{PodRef, PodVolumeBackupSpec};
    use crate::controller::MockAgentClient;
    use crate::restic::{CommandOutput, MockCommandRunner};
    use k8s_openapi::api::core::v1::{
        PersistentVolumeClaimVolumeSource, PodSpec, Volume,
    };

    fn pod_with_volumes(volumes: Vec<Volume>) -> Pod {
        Pod {
            spec: Some(PodSpec {
                volumes: Some(volumes),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn work_item(node: &str, phase: Option<PodVolumePhase>) -> Arc<PodVolumeBackup> {
        let mut pvb = PodVolumeBackup::new(
            "b1-nginx-0-data",
            PodVolumeBackupSpec {
                node: node.to_string(),
                pod: PodRef {
                    namespace: "nginx-example".to_string(),
                    name: "nginx-0".to_string(),
                    uid: "pod-uid-1".to_string(),
                },
                volume: "data".to_string(),
                repo_prefix: "s3:x/bkt/restic".to_string(),
                tags: Default::default(),
            },
        );
        pvb.metadata.namespace = Some("caravel".to_string());
        pvb.status = phase.map(|p| PodVolumeBackupStatus {
            phase: p,
            ..Default::default()
        });
        Arc::new(pvb)
    }

    fn context(kube: MockAgentClient, runner: MockCommandRunner) -> Arc<Context> {
        Arc::new(Context {
            kube: Arc::new(kube),
            node_name: "node-a".to_string(),
            namespace: "caravel".to_string(),
            runner: Arc::new(runner),
        })
    }

    fn ok_output(stdout: &str) -> CommandOutput {
        CommandOutput {
            success: true,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    #[test]
    fn plain_volume_uses_its_own_name() {
        let pod = pod_with_volumes(vec![Volume {
            name: "scratch".into(),
            ..Default::default()
        }]);
        assert_eq!(
            volume_directory(&pod, "scratch", None),
            Some("scratch".to_string())
        );
        assert_eq!(volume_claim_name(&pod, "scratch"), None);
    }

    #[test]
    fn pvc_volume_uses_the_bound_pv_name() {
        let pod = pod_with_volumes(vec![Volume {
            name: "data".into(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: "data-claim".into(),
                ..Default::default()
            }),
            ..Default::default()
        }]);
        assert_eq!(
            volume_directory(&pod, "data", Some("pvc-1234")),
            Some("pvc-1234".to_string())
        );
        assert_eq!(volume_claim_name(&pod, "data"), Some("data-claim".to_string()));
    }

    #[test]
    fn unknown_volume_is_none() {
        let pod = pod_with_volumes(vec![]);
        assert_eq!(volume_directory(&pod, "missing", None), None);
    }

    #[test]
    fn host_path_layout() {
        assert_eq!(
            host_volume_path("uid-1", "pvc-1234"),
            "/host_pods/uid-1/volumes/pvc-1234"
        );
    }

    #[tokio::test]
    async fn other_nodes_items_are_ignored() {
        // No expectations: any API call or restic run would panic.
        let ctx = context(MockAgentClient::new(), MockCommandRunner::new());
        let action = reconcile(work_item("node-b", None), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn finished_items_are_never_reprocessed() {
        for phase in [
            PodVolumePhase::InProgress,
            PodVolumePhase::Completed,
            PodVolumePhase::Failed,
        ] {
            let ctx = context(MockAgentClient::new(), MockCommandRunner::new());
            let item = work_item("node-a", Some(phase));
            assert_eq!(
                reconcile(item.clone(), ctx.clone()).await.unwrap(),
                Action::await_change()
            );
            assert_eq!(reconcile(item, ctx).await.unwrap(), Action::await_change());
        }
    }

    #[tokio::test]
    async fn new_item_runs_restic_and_records_the_snapshot() {
        let mut kube = MockAgentClient::new();
        kube.expect_get_pod()
            .withf(|ns, name| ns == "nginx-example" && name == "nginx-0")
            .returning(|_, _| {
                Ok(Some(pod_with_volumes(vec![Volume {
                    name: "data".into(),
                    ..Default::default()
                }])))
            });
        kube.expect_repository_key()
            .withf(|ns| ns == "nginx-example")
            .returning(|_| Ok(b"repo-key".to_vec()));
        kube.expect_patch_pod_volume_backup_status()
            .withf(|_, _, status| status.phase == PodVolumePhase::InProgress)
            .times(1)
            .returning(|_, _, _| Ok(()));
        kube.expect_patch_pod_volume_backup_status()
            .withf(|_, _, status| {
                status.phase == PodVolumePhase::Completed
                    && status.snapshot_id.as_deref() == Some("ab12cd34")
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|cmd| {
                cmd.command == "backup"
                    && cmd.args == vec!["/host_pods/pod-uid-1/volumes/data".to_string()]
            })
            .times(1)
            .returning(|_| Ok(ok_output("")));
        runner
            .expect_run()
            .withf(|cmd| cmd.command == "snapshots")
            .times(1)
            .returning(|_| Ok(ok_output(r#"[{"short_id":"ab12cd34"}]"#)));

        let action = reconcile(work_item("node-a", None), context(kube, runner))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn missing_pod_marks_the_item_failed() {
        let mut kube = MockAgentClient::new();
        kube.expect_get_pod().returning(|_, _| Ok(None));
        kube.expect_patch_pod_volume_backup_status()
            .withf(|_, _, status| status.phase == PodVolumePhase::InProgress)
            .times(1)
            .returning(|_, _, _| Ok(()));
        kube.expect_patch_pod_volume_backup_status()
            .withf(|_, _, status| {
                status.phase == PodVolumePhase::Failed
                    && status.message.as_deref().unwrap_or_default().contains("not found")
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        reconcile(work_item("node-a", None), context(kube, MockCommandRunner::new()))
            .await
            .unwrap();
    }
}
