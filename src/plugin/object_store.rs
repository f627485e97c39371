//! Object store proxy over the plugin transport

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::protocol::{PluginKind, Request, Response};
use super::PluginManager;
use crate::cloud::ObjectStore;
use crate::{Error, Result};

/// [`ObjectStore`] implementation that forwards every call to a named
/// plugin implementation
pub struct RemoteObjectStore {
    manager: Arc<PluginManager>,
    name: String,
}

impl RemoteObjectStore {
    pub(crate) fn new(manager: Arc<PluginManager>, name: &str) -> Self {
        Self {
            manager,
            name: name.to_string(),
        }
    }

    pub(crate) async fn do_init(&self, config: &BTreeMap<String, String>) -> Result<()> {
        self.expect_empty(Request::Init {
            config: config.clone(),
        })
        .await
    }

    async fn call(&self, request: Request) -> Result<Response> {
        self.manager
            .call(PluginKind::ObjectStore, &self.name, request)
            .await
    }

    async fn expect_empty(&self, request: Request) -> Result<()> {
        match self.call(request).await? {
            Response::Empty => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(response: &Response) -> Error {
    Error::plugin(format!("unexpected object store response: {response:?}"))
}

#[async_trait]
impl ObjectStore for RemoteObjectStore {
    async fn init(&self, config: &BTreeMap<String, String>) -> Result<()> {
        self.do_init(config).await
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()> {
        self.expect_empty(Request::PutObject {
            bucket: bucket.to_string(),
            key: key.to_string(),
            body,
        })
        .await
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        match self
            .call(Request::GetObject {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
            .await?
        {
            Response::Bytes { data } => Ok(data),
            other => Err(unexpected(&other)),
        }
    }

    async fn list_common_prefixes(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: &str,
    ) -> Result<Vec<String>> {
        match self
            .call(Request::ListCommonPrefixes {
                bucket: bucket.to_string(),
                prefix: prefix.to_string(),
                delimiter: delimiter.to_string(),
            })
            .await?
        {
            Response::Keys { keys } => Ok(keys),
            other => Err(unexpected(&other)),
        }
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        match self
            .call(Request::ListObjects {
                bucket: bucket.to_string(),
                prefix: prefix.to_string(),
            })
            .await?
        {
            Response::Keys { keys } => Ok(keys),
            other => Err(unexpected(&other)),
        }
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.expect_empty(Request::DeleteObject {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
        .await
    }

    async fn create_signed_url(&self, bucket: &str, key: &str, ttl: Duration) -> Result<String> {
        match self
            .call(Request::CreateSignedUrl {
                bucket: bucket.to_string(),
                key: key.to_string(),
                ttl_seconds: ttl.as_secs(),
            })
            .await?
        {
            Response::Url { url } => Ok(url),
            other => Err(unexpected(&other)),
        }
    }
}
