//! Custom item action interfaces and their plugin proxies
//!
//! Item actions let third-party code mutate items as they flow through the
//! backup and restore pipelines. A backup action may also return
//! additional item identifiers that the pipeline recursively backs up.

use std::sync::Arc;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use super::protocol::{ActionSelector, PluginKind, Request, Response, ResourceIdentifier};
use super::PluginManager;
use crate::api::{Backup, Restore};
use crate::util::{IncludesExcludes, LabelQuery};
use crate::{Error, Result};

/// Scope an item action applies to, resolved for matching
#[derive(Clone, Debug, Default)]
pub struct ResourceSelector {
    /// Namespace filter
    pub namespaces: IncludesExcludes,
    /// Resource filter over canonical group-resource keys
    pub resources: IncludesExcludes,
    /// Label filter
    pub labels: LabelQuery,
}

impl ResourceSelector {
    /// Build from the wire form, parsing the label selector.
    pub fn resolve(raw: ActionSelector) -> Result<Self> {
        let labels = match raw.label_selector.as_deref() {
            Some(s) => LabelQuery::parse(s).map_err(Error::plugin)?,
            None => LabelQuery::everything(),
        };
        Ok(Self {
            namespaces: IncludesExcludes::new()
                .includes(raw.included_namespaces)
                .excludes(raw.excluded_namespaces),
            resources: IncludesExcludes::new()
                .includes(raw.included_resources)
                .excludes(raw.excluded_resources),
            labels,
        })
    }
}

/// Mutates or expands items during backup
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BackupItemAction: Send + Sync {
    /// The scope of items this action wants to see
    async fn applies_to(&self) -> Result<ActionSelector>;

    /// Run against one item; returns the (possibly mutated) item and any
    /// additional items to back up
    async fn execute(
        &self,
        item: serde_json::Value,
        backup: &Backup,
    ) -> Result<(serde_json::Value, Vec<ResourceIdentifier>)>;
}

/// Mutates items during restore
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RestoreItemAction: Send + Sync {
    /// The scope of items this action wants to see
    async fn applies_to(&self) -> Result<ActionSelector>;

    /// Run against one item; returns the (possibly mutated) item
    async fn execute(&self, item: serde_json::Value, restore: &Restore)
        -> Result<serde_json::Value>;
}

/// Backup item action served by a plugin process
pub struct RemoteBackupItemAction {
    manager: Arc<PluginManager>,
    name: String,
}

impl RemoteBackupItemAction {
    pub(crate) fn new(manager: Arc<PluginManager>, name: &str) -> Self {
        Self {
            manager,
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl BackupItemAction for RemoteBackupItemAction {
    async fn applies_to(&self) -> Result<ActionSelector> {
        match self
            .manager
            .call(PluginKind::BackupItemAction, &self.name, Request::AppliesTo)
            .await?
        {
            Response::Selector { selector } => Ok(selector),
            other => Err(Error::plugin(format!(
                "unexpected appliesTo response: {other:?}"
            ))),
        }
    }

    async fn execute(
        &self,
        item: serde_json::Value,
        backup: &Backup,
    ) -> Result<(serde_json::Value, Vec<ResourceIdentifier>)> {
        match self
            .manager
            .call(
                PluginKind::BackupItemAction,
                &self.name,
                Request::ExecuteBackupAction {
                    item,
                    backup: serde_json::to_value(backup)?,
                },
            )
            .await?
        {
            Response::BackupActionResult {
                item,
                additional_items,
            } => Ok((item, additional_items)),
            other => Err(Error::plugin(format!(
                "unexpected backup action response: {other:?}"
            ))),
        }
    }
}

/// Restore item action served by a plugin process
pub struct RemoteRestoreItemAction {
    manager: Arc<PluginManager>,
    name: String,
}

impl RemoteRestoreItemAction {
    pub(crate) fn new(manager: Arc<PluginManager>, name: &str) -> Self {
        Self {
            manager,
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl RestoreItemAction for RemoteRestoreItemAction {
    async fn applies_to(&self) -> Result<ActionSelector> {
        match self
            .manager
            .call(
                PluginKind::RestoreItemAction,
                &self.name,
                Request::AppliesTo,
            )
            .await?
        {
            Response::Selector { selector } => Ok(selector),
            other => Err(Error::plugin(format!(
                "unexpected appliesTo response: {other:?}"
            ))),
        }
    }

    async fn execute(
        &self,
        item: serde_json::Value,
        restore: &Restore,
    ) -> Result<serde_json::Value> {
        match self
            .manager
            .call(
                PluginKind::RestoreItemAction,
                &self.name,
                Request::ExecuteRestoreAction {
                    item,
                    restore: serde_json::to_value(restore)?,
                },
            )
            .await?
        {
            Response::Item { item } => Ok(item),
            other => Err(Error::plugin(format!(
                "unexpected restore action response: {other:?}"
            ))),
        }
    }
}
