//! Restic repository management
//!
//! Each namespace with pod-volume backups gets one encrypted restic
//! repository under the configured prefix, keyed by a random password held
//! in a Secret in the server namespace. The manager initializes, checks,
//! and prunes repositories (serialized per namespace) and resolves
//! snapshot IDs after the node agent finishes a backup.

pub mod command;
pub mod pod_volume;

pub use command::Command;
pub use pod_volume::{
    recorded_snapshots, restore_owner_reference, volumes_to_backup, CrPodVolumeBackupper,
    CrPodVolumeRestorer, PodVolumeBackupper, PodVolumeRestorer,
};

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// Secret in the server namespace holding one password per repository
pub const CREDENTIALS_SECRET: &str = "caravel-restic-credentials";

/// Name of the init container that blocks restored pods until the agent
/// has repopulated their volumes
pub const INIT_CONTAINER: &str = "caravel-restore-wait";

const KEY_LENGTH: usize = 32;

/// Executes restic commands and agent helper programs; mocked in tests
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the restic command, capturing output
    async fn run(&self, cmd: &Command) -> Result<CommandOutput>;

    /// Run an arbitrary helper program, capturing output
    async fn run_raw(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
}

/// Captured output of a finished command
#[derive(Clone, Debug, Default)]
pub struct CommandOutput {
    /// Whether the process exited zero
    pub success: bool,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
}

impl From<std::process::Output> for CommandOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// Runs restic as a local subprocess
pub struct SubprocessRunner;

#[async_trait]
impl CommandRunner for SubprocessRunner {
    async fn run(&self, cmd: &Command) -> Result<CommandOutput> {
        let output = cmd
            .tokio_command()
            .output()
            .await
            .map_err(|e| Error::restic(format!("running {cmd}: {e}")))?;
        Ok(CommandOutput::from(output))
    }

    async fn run_raw(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::restic(format!("running {program}: {e}")))?;
        Ok(CommandOutput::from(output))
    }
}

/// One parsed entry of `restic snapshots --json`
#[derive(Debug, Deserialize)]
struct SnapshotEntry {
    short_id: String,
}

/// Parse `restic snapshots --json --last` output down to the snapshot ID
pub fn parse_snapshot_id(stdout: &str) -> Result<String> {
    let entries: Vec<SnapshotEntry> = serde_json::from_str(stdout.trim())
        .map_err(|e| Error::restic(format!("parsing snapshots output: {e}")))?;
    entries
        .first()
        .map(|s| s.short_id.clone())
        .ok_or_else(|| Error::restic("no snapshot matched the tag filter"))
}

/// Write a repository key to a temp file restic can read with
/// `--password-file`
pub fn password_tempfile(key: &[u8]) -> Result<tempfile::NamedTempFile> {
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(key)?;
    file.flush()?;
    Ok(file)
}

/// Manages per-namespace restic repositories
pub struct RepositoryManager {
    client: Client,
    namespace: String,
    repo_prefix: String,
    runner: Arc<dyn CommandRunner>,
    // one lock per repository; held across init/check/prune passes
    repo_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl RepositoryManager {
    /// Create a manager storing credentials in `namespace` and
    /// repositories under `repo_prefix`
    pub fn new(
        client: Client,
        namespace: &str,
        repo_prefix: &str,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            repo_prefix: repo_prefix.to_string(),
            runner,
            repo_locks: DashMap::new(),
        }
    }

    /// Repository URL prefix for a provider and bucket/prefix.
    ///
    /// Matches restic's own backend syntax for the supported providers; a
    /// prefix already carrying a scheme passes through unchanged.
    pub fn repo_prefix_for(provider: &str, bucket: &str) -> String {
        if bucket.contains(':') {
            return bucket.to_string();
        }
        match provider {
            "aws" => format!("s3:s3.amazonaws.com/{bucket}"),
            "gcp" => format!("gs:{bucket}:/"),
            "azure" => format!("azure:{bucket}:/"),
            _ => bucket.to_string(),
        }
    }

    /// The configured repository prefix
    pub fn repo_prefix(&self) -> &str {
        &self.repo_prefix
    }

    fn lock_for(&self, namespace: &str) -> Arc<Mutex<()>> {
        self.repo_locks
            .entry(namespace.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn credentials_secret(&self) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        match api.get(CREDENTIALS_SECRET).await {
            Ok(secret) => Ok(Some(secret)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a repository (its key) exists for the namespace
    pub async fn repository_exists(&self, namespace: &str) -> Result<bool> {
        Ok(self
            .credentials_secret()
            .await?
            .and_then(|s| s.data)
            .map(|d| d.contains_key(namespace))
            .unwrap_or(false))
    }

    /// Namespaces that have repositories
    pub async fn all_repositories(&self) -> Result<Vec<String>> {
        Ok(self
            .credentials_secret()
            .await?
            .and_then(|s| s.data)
            .map(|d| d.keys().cloned().collect())
            .unwrap_or_default())
    }

    /// Key for the namespace's repository, as a temp password file
    async fn password_file(&self, namespace: &str) -> Result<tempfile::NamedTempFile> {
        let secret = self
            .credentials_secret()
            .await?
            .ok_or_else(|| Error::restic(format!("no credentials secret {CREDENTIALS_SECRET}")))?;
        let key = secret
            .data
            .as_ref()
            .and_then(|d| d.get(namespace))
            .ok_or_else(|| Error::restic(format!("no repository key for namespace {namespace}")))?;

        password_tempfile(&key.0)
    }

    /// Initialize the namespace's repository, generating and storing its
    /// key first. No-op if the repository already exists.
    pub async fn init_repo(&self, namespace: &str) -> Result<()> {
        let lock = self.lock_for(namespace);
        let _guard = lock.lock().await;

        if self.repository_exists(namespace).await? {
            return Ok(());
        }

        let key: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(KEY_LENGTH)
            .map(char::from)
            .collect();
        self.store_key(namespace, &key).await?;

        let file = password_tempfile(key.as_bytes())?;
        let cmd = command::init_command(&self.repo_prefix, namespace, file.path());
        info!(namespace = %namespace, "initializing restic repository");
        self.run_expecting_success(&cmd).await
    }

    async fn store_key(&self, namespace: &str, key: &str) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);

        match self.credentials_secret().await? {
            Some(_) => {
                let patch = serde_json::json!({
                    "data": { namespace: base64_std(key.as_bytes()) }
                });
                api.patch(
                    CREDENTIALS_SECRET,
                    &PatchParams::default(),
                    &Patch::Merge(&patch),
                )
                .await?;
            }
            None => {
                let mut data = BTreeMap::new();
                data.insert(namespace.to_string(), ByteString(key.as_bytes().to_vec()));
                let secret = Secret {
                    metadata: kube::api::ObjectMeta {
                        name: Some(CREDENTIALS_SECRET.to_string()),
                        namespace: Some(self.namespace.clone()),
                        ..Default::default()
                    },
                    data: Some(data),
                    ..Default::default()
                };
                api.create(&PostParams::default(), &secret).await?;
            }
        }
        Ok(())
    }

    /// Verify repository integrity
    pub async fn check_repo(&self, namespace: &str) -> Result<()> {
        let lock = self.lock_for(namespace);
        let _guard = lock.lock().await;

        let file = self.password_file(namespace).await?;
        let cmd = command::check_command(&self.repo_prefix, namespace, file.path());
        self.run_expecting_success(&cmd).await
    }

    /// Drop unreferenced data from the repository
    pub async fn prune_repo(&self, namespace: &str) -> Result<()> {
        let lock = self.lock_for(namespace);
        let _guard = lock.lock().await;

        let file = self.password_file(namespace).await?;
        let cmd = command::prune_command(&self.repo_prefix, namespace, file.path());
        self.run_expecting_success(&cmd).await
    }

    /// Check every known repository, aggregating failures
    pub async fn check_all_repos(&self) -> Result<()> {
        let mut errs = Vec::new();
        for namespace in self.all_repositories().await? {
            if let Err(e) = self.check_repo(&namespace).await {
                warn!(namespace = %namespace, error = %e, "repository check failed");
                errs.push(e);
            }
        }
        Error::aggregate(errs)
    }

    /// Resolve the snapshot ID the agent just produced for a volume
    pub async fn get_snapshot_id(
        &self,
        namespace: &str,
        backup_uid: &str,
        pod_uid: &str,
        volume: &str,
    ) -> Result<String> {
        let file = self.password_file(namespace).await?;

        let mut tags = BTreeMap::new();
        tags.insert("backup-uid".to_string(), backup_uid.to_string());
        tags.insert("pod-uid".to_string(), pod_uid.to_string());
        tags.insert("volume".to_string(), volume.to_string());

        let cmd = command::snapshots_command(&self.repo_prefix, namespace, file.path(), &tags);
        let output = self.runner.run(&cmd).await?;
        if !output.success {
            return Err(Error::restic(format!(
                "snapshots query failed: {}",
                output.stderr
            )));
        }

        parse_snapshot_id(&output.stdout)
    }

    /// Remove one snapshot from the namespace's repository
    pub async fn forget(&self, namespace: &str, snapshot_id: &str) -> Result<()> {
        let lock = self.lock_for(namespace);
        let _guard = lock.lock().await;

        let file = self.password_file(namespace).await?;
        let cmd = command::forget_command(&self.repo_prefix, namespace, file.path(), snapshot_id);
        self.run_expecting_success(&cmd).await
    }

    async fn run_expecting_success(&self, cmd: &Command) -> Result<()> {
        let output = self.runner.run(cmd).await?;
        if output.success {
            Ok(())
        } else {
            Err(Error::restic(format!(
                "{} failed: {}",
                cmd.command, output.stderr
            )))
        }
    }
}

fn base64_std(bytes: &[u8]) -> String {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    STANDARD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_prefix_per_provider() {
        assert_eq!(
            RepositoryManager::repo_prefix_for("aws", "bkt/restic"),
            "s3:s3.amazonaws.com/bkt/restic"
        );
        assert_eq!(
            RepositoryManager::repo_prefix_for("gcp", "bkt/restic"),
            "gs:bkt/restic:/"
        );
        assert_eq!(
            RepositoryManager::repo_prefix_for("azure", "bkt/restic"),
            "azure:bkt/restic:/"
        );
    }

    #[test]
    fn explicit_scheme_passes_through() {
        assert_eq!(
            RepositoryManager::repo_prefix_for("aws", "s3:minio.local/bkt"),
            "s3:minio.local/bkt"
        );
    }

    #[test]
    fn snapshot_entries_parse_short_ids() {
        let json = r#"[{"short_id":"ab12cd34","paths":["/data"]}]"#;
        let entries: Vec<SnapshotEntry> = serde_json::from_str(json).unwrap();
        assert_eq!(entries[0].short_id, "ab12cd34");
    }

    #[test]
    fn command_output_from_process_output() {
        use std::os::unix::process::ExitStatusExt;
        let output = std::process::Output {
            status: std::process::ExitStatus::from_raw(0),
            stdout: b"ok".to_vec(),
            stderr: Vec::new(),
        };
        let out = CommandOutput::from(output);
        assert!(out.success);
        assert_eq!(out.stdout, "ok");
    }
}
