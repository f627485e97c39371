//! Backup hook resolution and execution
//!
//! Hook specs are resolved once per backup: resource names qualified
//! through discovery, label selectors parsed. During the walk, pods that
//! match a hook's scope get its commands exec'd before and after their
//! archive entry is written.

use std::io::Write;

use std::sync::Arc;

use serde_json::Value;

use crate::api::{ExecHook, HookErrorMode, ResourceHookSpec};
use crate::client::{item_labels, item_name, item_namespace};
use crate::discovery::DiscoveryHelper;
use crate::podexec::PodCommandExecutor;
use crate::util::{IncludesExcludes, LabelQuery, OperationLog};
use crate::{Error, Result};

/// Which side of the item's backup a hook runs on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookPhase {
    /// Before the archive entry is written
    Pre,
    /// After the archive entry is written
    Post,
}

/// A hook spec with its filters resolved for matching
pub struct ResolvedHook {
    /// Name from the spec, used in error messages
    pub name: String,
    /// Namespace filter
    pub namespaces: IncludesExcludes,
    /// Resource filter over canonical group-resource keys
    pub resources: IncludesExcludes,
    /// Label filter
    pub labels: LabelQuery,
    /// Commands for the pre phase
    pub pre: Vec<ExecHook>,
    /// Commands for the post phase
    pub post: Vec<ExecHook>,
}

/// Resolve every hook spec against discovery
pub fn resolve_hooks(
    specs: &[ResourceHookSpec],
    discovery: &DiscoveryHelper,
) -> Result<Vec<ResolvedHook>> {
    specs
        .iter()
        .map(|spec| {
            let labels = match spec.label_selector.as_deref() {
                Some(s) => LabelQuery::parse(s)
                    .map_err(|e| Error::validation(format!("hook {}: {e}", spec.name)))?,
                None => LabelQuery::everything(),
            };
            Ok(ResolvedHook {
                name: spec.name.clone(),
                namespaces: IncludesExcludes::new()
                    .includes(spec.included_namespaces.clone())
                    .excludes(spec.excluded_namespaces.clone()),
                resources: qualify_resources(
                    &spec.included_resources,
                    &spec.excluded_resources,
                    discovery,
                ),
                labels,
                pre: spec.pre_hooks().to_vec(),
                post: spec.post.clone(),
            })
        })
        .collect()
}

/// Qualify partial resource names to canonical group-resource keys,
/// dropping ones discovery cannot resolve
pub fn qualify_resources(
    includes: &[String],
    excludes: &[String],
    discovery: &DiscoveryHelper,
) -> IncludesExcludes {
    IncludesExcludes::generate(includes, excludes, |name| {
        discovery
            .resource_for(name)
            .map(|r| r.group_resource())
            .unwrap_or_default()
    })
}

/// Runs matching hooks against pod items
pub struct ItemHookHandler {
    pod_exec: Arc<dyn PodCommandExecutor>,
}

impl ItemHookHandler {
    /// Create a handler executing through `pod_exec`
    pub fn new(pod_exec: Arc<dyn PodCommandExecutor>) -> Self {
        Self { pod_exec }
    }

    /// Run every matching hook's commands for the phase.
    ///
    /// A command failing with `OnError=Fail` aborts immediately; with
    /// `OnError=Continue` it is logged and the remaining commands run.
    /// Only pods can host hooks; other kinds return immediately.
    pub async fn handle<L: Write>(
        &self,
        log: &mut OperationLog<L>,
        group_resource: &str,
        item: &Value,
        hooks: &[ResolvedHook],
        phase: HookPhase,
    ) -> Result<()> {
        if group_resource != "pods" {
            return Ok(());
        }

        let namespace = item_namespace(item);
        let name = item_name(item);
        let labels = item_labels(item);

        for hook in hooks {
            if !hook.resources.should_include(group_resource) {
                continue;
            }
            if !hook.namespaces.should_include(&namespace) {
                continue;
            }
            if !hook.labels.matches(&labels) {
                continue;
            }

            let commands = match phase {
                HookPhase::Pre => &hook.pre,
                HookPhase::Post => &hook.post,
            };

            for exec in commands {
                log.info(format!(
                    "running hook {} command {:?} in pod {namespace}/{name}",
                    hook.name, exec.command
                ));
                match self.pod_exec.execute(&namespace, &name, exec).await {
                    Ok(()) => {}
                    Err(err) => match exec.on_error {
                        HookErrorMode::Fail => {
                            log.error(format!(
                                "hook {} failed in pod {namespace}/{name}: {err}",
                                hook.name
                            ));
                            return Err(Error::hook(format!(
                                "hook {} failed for pod {namespace}/{name}: {err}",
                                hook.name
                            )));
                        }
                        HookErrorMode::Continue => {
                            log.warn(format!(
                                "hook {} failed in pod {namespace}/{name} (continuing): {err}",
                                hook.name
                            ));
                        }
                    },
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ExecHook;
    use crate::discovery::DiscoveredResource;
    use crate::podexec::MockPodCommandExecutor;
    use kube::discovery::ApiResource;
    use serde_json::json;

    fn discovery() -> DiscoveryHelper {
        DiscoveryHelper::from_resources(vec![DiscoveredResource {
            api_resource: ApiResource {
                group: String::new(),
                version: "v1".into(),
                api_version: "v1".into(),
                kind: "Pod".into(),
                plural: "pods".into(),
            },
            namespaced: true,
        }])
    }

    fn pod(namespace: &str, name: &str, app: &str) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": name, "namespace": namespace, "labels": {"app": app}}
        })
    }

    fn hook_spec(on_error: HookErrorMode) -> ResourceHookSpec {
        ResourceHookSpec {
            name: "flush".into(),
            included_namespaces: vec!["nginx-example".into()],
            label_selector: Some("app=nginx".into()),
            pre: vec![ExecHook {
                container: Some("nginx".into()),
                command: vec!["/sbin/flush".into()],
                on_error,
                timeout_seconds: None,
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn matching_pre_hook_runs() {
        let hooks = resolve_hooks(&[hook_spec(HookErrorMode::Fail)], &discovery()).unwrap();

        let mut exec = MockPodCommandExecutor::new();
        exec.expect_execute()
            .withf(|namespace, pod, _| namespace == "nginx-example" && pod == "nginx-0")
            .times(1)
            .returning(|_, _, _| Ok(()));

        let handler = ItemHookHandler::new(Arc::new(exec));
        let mut log = OperationLog::new(Vec::new());
        handler
            .handle(
                &mut log,
                "pods",
                &pod("nginx-example", "nginx-0", "nginx"),
                &hooks,
                HookPhase::Pre,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn non_matching_namespace_skips() {
        let hooks = resolve_hooks(&[hook_spec(HookErrorMode::Fail)], &discovery()).unwrap();

        let mut exec = MockPodCommandExecutor::new();
        exec.expect_execute().times(0);

        let handler = ItemHookHandler::new(Arc::new(exec));
        let mut log = OperationLog::new(Vec::new());
        handler
            .handle(
                &mut log,
                "pods",
                &pod("other", "nginx-0", "nginx"),
                &hooks,
                HookPhase::Pre,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn on_error_fail_aborts() {
        let hooks = resolve_hooks(&[hook_spec(HookErrorMode::Fail)], &discovery()).unwrap();

        let mut exec = MockPodCommandExecutor::new();
        exec.expect_execute()
            .returning(|_, _, _| Err(Error::hook("exit status 1")));

        let handler = ItemHookHandler::new(Arc::new(exec));
        let mut log = OperationLog::new(Vec::new());
        let err = handler
            .handle(
                &mut log,
                "pods",
                &pod("nginx-example", "nginx-0", "nginx"),
                &hooks,
                HookPhase::Pre,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("flush"));
        assert_eq!(log.error_count(), 1);
    }

    #[tokio::test]
    async fn on_error_continue_keeps_going() {
        let hooks = resolve_hooks(&[hook_spec(HookErrorMode::Continue)], &discovery()).unwrap();

        let mut exec = MockPodCommandExecutor::new();
        exec.expect_execute()
            .returning(|_, _, _| Err(Error::hook("exit status 1")));

        let handler = ItemHookHandler::new(Arc::new(exec));
        let mut log = OperationLog::new(Vec::new());
        handler
            .handle(
                &mut log,
                "pods",
                &pod("nginx-example", "nginx-0", "nginx"),
                &hooks,
                HookPhase::Pre,
            )
            .await
            .unwrap();
        assert_eq!(log.warning_count(), 1);
    }

    #[tokio::test]
    async fn hooks_only_apply_to_pods() {
        let hooks = resolve_hooks(&[hook_spec(HookErrorMode::Fail)], &discovery()).unwrap();

        let mut exec = MockPodCommandExecutor::new();
        exec.expect_execute().times(0);

        let handler = ItemHookHandler::new(Arc::new(exec));
        let mut log = OperationLog::new(Vec::new());
        handler
            .handle(
                &mut log,
                "deployments.apps",
                &pod("nginx-example", "nginx-deploy", "nginx"),
                &hooks,
                HookPhase::Pre,
            )
            .await
            .unwrap();
    }
}
