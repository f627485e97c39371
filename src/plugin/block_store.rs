//! Block store proxy over the plugin transport

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::protocol::{PluginKind, Request, Response};
use super::PluginManager;
use crate::cloud::BlockStore;
use crate::{Error, Result};

/// [`BlockStore`] implementation that forwards every call to a named
/// plugin implementation
pub struct RemoteBlockStore {
    manager: Arc<PluginManager>,
    name: String,
}

impl RemoteBlockStore {
    pub(crate) fn new(manager: Arc<PluginManager>, name: &str) -> Self {
        Self {
            manager,
            name: name.to_string(),
        }
    }

    pub(crate) async fn do_init(&self, config: &BTreeMap<String, String>) -> Result<()> {
        match self
            .call(Request::Init {
                config: config.clone(),
            })
            .await?
        {
            Response::Empty => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn call(&self, request: Request) -> Result<Response> {
        self.manager
            .call(PluginKind::BlockStore, &self.name, request)
            .await
    }
}

fn unexpected(response: &Response) -> Error {
    Error::plugin(format!("unexpected block store response: {response:?}"))
}

#[async_trait]
impl BlockStore for RemoteBlockStore {
    async fn init(&self, config: &BTreeMap<String, String>) -> Result<()> {
        self.do_init(config).await
    }

    async fn create_volume_from_snapshot(
        &self,
        snapshot_id: &str,
        volume_type: &str,
        zone: &str,
        iops: Option<i64>,
    ) -> Result<String> {
        match self
            .call(Request::CreateVolumeFromSnapshot {
                snapshot_id: snapshot_id.to_string(),
                volume_type: volume_type.to_string(),
                zone: zone.to_string(),
                iops,
            })
            .await?
        {
            Response::VolumeId {
                volume_id: Some(id),
            } => Ok(id),
            Response::VolumeId { volume_id: None } => {
                Err(Error::block_store("provider returned no volume id"))
            }
            other => Err(unexpected(&other)),
        }
    }

    async fn get_volume_info(
        &self,
        volume_id: &str,
        zone: &str,
    ) -> Result<(String, Option<i64>)> {
        match self
            .call(Request::GetVolumeInfo {
                volume_id: volume_id.to_string(),
                zone: zone.to_string(),
            })
            .await?
        {
            Response::VolumeInfo { volume_type, iops } => Ok((volume_type, iops)),
            other => Err(unexpected(&other)),
        }
    }

    async fn is_volume_ready(&self, volume_id: &str, zone: &str) -> Result<bool> {
        match self
            .call(Request::IsVolumeReady {
                volume_id: volume_id.to_string(),
                zone: zone.to_string(),
            })
            .await?
        {
            Response::Bool { value } => Ok(value),
            other => Err(unexpected(&other)),
        }
    }

    async fn list_snapshots(&self, tag_filters: &BTreeMap<String, String>) -> Result<Vec<String>> {
        match self
            .call(Request::ListSnapshots {
                tag_filters: tag_filters.clone(),
            })
            .await?
        {
            Response::Keys { keys } => Ok(keys),
            other => Err(unexpected(&other)),
        }
    }

    async fn create_snapshot(
        &self,
        volume_id: &str,
        zone: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<String> {
        match self
            .call(Request::CreateSnapshot {
                volume_id: volume_id.to_string(),
                zone: zone.to_string(),
                tags: tags.clone(),
            })
            .await?
        {
            Response::SnapshotId { snapshot_id } => Ok(snapshot_id),
            other => Err(unexpected(&other)),
        }
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        match self
            .call(Request::DeleteSnapshot {
                snapshot_id: snapshot_id.to_string(),
            })
            .await?
        {
            Response::Empty => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn get_volume_id(&self, pv: &serde_json::Value) -> Result<Option<String>> {
        match self.call(Request::GetVolumeId { pv: pv.clone() }).await? {
            Response::VolumeId { volume_id } => Ok(volume_id),
            other => Err(unexpected(&other)),
        }
    }

    async fn set_volume_id(
        &self,
        pv: serde_json::Value,
        volume_id: &str,
    ) -> Result<serde_json::Value> {
        match self
            .call(Request::SetVolumeId {
                pv,
                volume_id: volume_id.to_string(),
            })
            .await?
        {
            Response::Item { item } => Ok(item),
            other => Err(unexpected(&other)),
        }
    }
}
