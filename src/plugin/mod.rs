//! Out-of-process driver runtime
//!
//! Cloud drivers and custom item actions are separate executables speaking
//! a framed JSON-RPC protocol over stdio. The manager scans a directory at
//! startup, probes each executable for the implementations it provides,
//! and hands out proxies keyed by `(kind, name)`. Crashed plugins are
//! respawned lazily on the next call.

mod block_store;
mod item_action;
mod process;
pub mod protocol;

pub use block_store::RemoteBlockStore;
pub use item_action::{
    BackupItemAction, RemoteBackupItemAction, RemoteRestoreItemAction, ResourceSelector,
    RestoreItemAction,
};
pub use protocol::{PluginDescriptor, PluginKind, ResourceIdentifier};

mod object_store;
pub use object_store::RemoteObjectStore;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{Error, Result};
use process::PluginProcess;
use protocol::{Request, Response};

/// Launches and supervises plugin processes, indexed by `(kind, name)`
pub struct PluginManager {
    registry: DashMap<(PluginKind, String), PathBuf>,
    processes: DashMap<PathBuf, Arc<PluginProcess>>,
    // serializes spawn + Init per command so stores initialize exactly once
    spawn_lock: Mutex<()>,
}

impl PluginManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self {
            registry: DashMap::new(),
            processes: DashMap::new(),
            spawn_lock: Mutex::new(()),
        }
    }

    /// Scan a directory for plugin executables and probe each one.
    ///
    /// Unprobeable entries are skipped with a warning so one broken plugin
    /// cannot keep the server from starting.
    pub async fn discover(&self, dir: &Path) -> Result<()> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(dir = %dir.display(), "plugin directory absent, no plugins loaded");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Err(e) = self.probe(&path).await {
                warn!(plugin = %path.display(), error = %e, "skipping unprobeable plugin");
            }
        }
        Ok(())
    }

    async fn probe(&self, command: &Path) -> Result<()> {
        let process = self.process_for(command).await?;
        let response = process.call("", Request::Handshake).await?;
        let Response::Handshake { plugins } = response else {
            return Err(Error::plugin("unexpected handshake response"));
        };

        for descriptor in plugins {
            info!(
                plugin = %command.display(),
                kind = %descriptor.kind,
                name = %descriptor.name,
                "registered plugin"
            );
            self.registry
                .insert((descriptor.kind, descriptor.name), command.to_path_buf());
        }
        Ok(())
    }

    /// The running process for a command, respawning it if dead
    async fn process_for(&self, command: &Path) -> Result<Arc<PluginProcess>> {
        if let Some(process) = self.processes.get(command) {
            if process.is_alive() {
                return Ok(process.clone());
            }
        }

        let _guard = self.spawn_lock.lock().await;
        // another caller may have respawned while we waited
        if let Some(process) = self.processes.get(command) {
            if process.is_alive() {
                return Ok(process.clone());
            }
        }

        let process = PluginProcess::spawn(command)?;
        self.processes
            .insert(command.to_path_buf(), process.clone());
        Ok(process)
    }

    /// Make a call to the named implementation of the given kind
    pub(crate) async fn call(
        &self,
        kind: PluginKind,
        name: &str,
        request: Request,
    ) -> Result<Response> {
        let command = self
            .registry
            .get(&(kind, name.to_string()))
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::plugin(format!("no {kind} plugin named {name:?}")))?;

        let process = self.process_for(&command).await?;
        process.call(name, request).await
    }

    /// Names of every registered implementation of a kind
    pub fn names_of_kind(&self, kind: PluginKind) -> Vec<String> {
        self.registry
            .iter()
            .filter(|e| e.key().0 == kind)
            .map(|e| e.key().1.clone())
            .collect()
    }

    /// An initialized object store proxy
    pub async fn get_object_store(
        self: &Arc<Self>,
        name: &str,
        config: &BTreeMap<String, String>,
    ) -> Result<RemoteObjectStore> {
        let store = RemoteObjectStore::new(self.clone(), name);
        store.do_init(config).await?;
        Ok(store)
    }

    /// An initialized block store proxy
    pub async fn get_block_store(
        self: &Arc<Self>,
        name: &str,
        config: &BTreeMap<String, String>,
    ) -> Result<RemoteBlockStore> {
        let store = RemoteBlockStore::new(self.clone(), name);
        store.do_init(config).await?;
        Ok(store)
    }

    /// Proxies for every registered backup item action
    pub fn backup_item_actions(self: &Arc<Self>) -> Vec<Arc<dyn BackupItemAction>> {
        self.names_of_kind(PluginKind::BackupItemAction)
            .into_iter()
            .map(|name| {
                Arc::new(RemoteBackupItemAction::new(self.clone(), &name))
                    as Arc<dyn BackupItemAction>
            })
            .collect()
    }

    /// Proxies for every registered restore item action
    pub fn restore_item_actions(self: &Arc<Self>) -> Vec<Arc<dyn RestoreItemAction>> {
        self.names_of_kind(PluginKind::RestoreItemAction)
            .into_iter()
            .map(|name| {
                Arc::new(RemoteRestoreItemAction::new(self.clone(), &name))
                    as Arc<dyn RestoreItemAction>
            })
            .collect()
    }

    /// Kill every child process
    pub async fn shutdown(&self) {
        for entry in self.processes.iter() {
            entry.value().shutdown().await;
        }
        self.processes.clear();
    }
}

impl Default for PluginManager {
    fn default() -> Self {
        Self::new()
    }
}
