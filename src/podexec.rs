//! Command execution inside pods
//!
//! Backup hooks exec into the pod being backed up over the API server's
//! attach channel. The executor is a trait so the pipelines can run
//! against a mock in tests.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams};
use kube::Client;
use tokio::io::AsyncReadExt;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::api::ExecHook;
use crate::{Error, Result};

const DEFAULT_HOOK_TIMEOUT_SECS: u64 = 30;

/// Executes a hook command inside a pod
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodCommandExecutor: Send + Sync {
    /// Run the hook in the given pod, honoring its container and timeout.
    /// Returns an error if the command cannot run or exits nonzero.
    async fn execute(&self, namespace: &str, pod: &str, hook: &ExecHook) -> Result<()>;
}

/// Executor backed by the API server's exec subresource
pub struct KubePodCommandExecutor {
    client: Client,
}

impl KubePodCommandExecutor {
    /// Create an executor using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodCommandExecutor for KubePodCommandExecutor {
    async fn execute(&self, namespace: &str, pod: &str, hook: &ExecHook) -> Result<()> {
        if hook.command.is_empty() {
            return Err(Error::hook("hook command must not be empty"));
        }

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);

        // The container defaults to the pod's first.
        let container = match &hook.container {
            Some(c) => c.clone(),
            None => {
                let pod_obj = pods.get(pod).await?;
                pod_obj
                    .spec
                    .as_ref()
                    .and_then(|s| s.containers.first())
                    .map(|c| c.name.clone())
                    .ok_or_else(|| Error::hook(format!("pod {namespace}/{pod} has no containers")))?
            }
        };

        let params = AttachParams::default()
            .container(container.clone())
            .stdout(true)
            .stderr(true);

        let mut attached = pods.exec(pod, hook.command.clone(), &params).await?;

        // Drain output concurrently so a chatty command cannot stall the
        // attach channel.
        let stdout = attached.stdout();
        let drain = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut out) = stdout {
                let _ = out.read_to_end(&mut buf).await;
            }
            buf
        });

        let timeout = Duration::from_secs(hook.timeout_seconds.unwrap_or(DEFAULT_HOOK_TIMEOUT_SECS));
        let status_fut = attached
            .take_status()
            .ok_or_else(|| Error::hook("exec status channel unavailable"))?;
        let status = tokio::time::timeout(timeout, status_fut)
            .await
            .map_err(|_| {
                Error::hook(format!(
                    "hook in pod {namespace}/{pod} timed out after {}s",
                    timeout.as_secs()
                ))
            })?;

        if let Ok(output) = drain.await {
            if !output.is_empty() {
                debug!(
                    pod = %format!("{namespace}/{pod}"),
                    container = %container,
                    "hook output: {}",
                    String::from_utf8_lossy(&output)
                );
            }
        }

        match status {
            Some(s) if s.status.as_deref() == Some("Success") => Ok(()),
            Some(s) => Err(Error::hook(format!(
                "hook in pod {namespace}/{pod} failed: {}",
                s.message.unwrap_or_else(|| "command exited nonzero".to_string())
            ))),
            None => Err(Error::hook(format!(
                "hook in pod {namespace}/{pod} returned no status"
            ))),
        }
    }
}
