//! Dynamic client access and item metadata helpers
//!
//! The pipelines handle arbitrary, runtime-discovered kinds, so every item
//! is a tagged JSON value: group-resource plus free-form body. This module
//! provides the trait the pipelines read and write items through, its
//! kube-backed implementation, and accessors for the metadata fields the
//! pipelines care about.

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, ListParams, PostParams};
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::Value;

#[cfg(test)]
use mockall::automock;

use crate::Result;

/// Reads and writes arbitrary objects by their discovered type
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DynamicClient: Send + Sync {
    /// List every instance of a resource, cluster-wide, optionally
    /// filtered by a label selector string
    async fn list(
        &self,
        ar: &ApiResource,
        namespaced: bool,
        label_selector: Option<String>,
    ) -> Result<Vec<Value>>;

    /// Fetch one object
    async fn get(&self, ar: &ApiResource, namespace: Option<String>, name: String)
        -> Result<Value>;

    /// Create an object from its JSON form
    async fn create(&self, ar: &ApiResource, namespace: Option<String>, obj: Value)
        -> Result<Value>;
}

/// [`DynamicClient`] backed by the API server
pub struct KubeDynamicClient {
    client: Client,
}

impl KubeDynamicClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, ar: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, ar),
            None => Api::all_with(self.client.clone(), ar),
        }
    }
}

#[async_trait]
impl DynamicClient for KubeDynamicClient {
    async fn list(
        &self,
        ar: &ApiResource,
        _namespaced: bool,
        label_selector: Option<String>,
    ) -> Result<Vec<Value>> {
        let api = self.api(ar, None);
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(&selector);
        }
        let list = api.list(&params).await?;
        let mut items = Vec::with_capacity(list.items.len());
        for obj in list.items {
            items.push(serde_json::to_value(obj)?);
        }
        Ok(items)
    }

    async fn get(
        &self,
        ar: &ApiResource,
        namespace: Option<String>,
        name: String,
    ) -> Result<Value> {
        let api = self.api(ar, namespace.as_deref());
        let obj = api.get(&name).await?;
        Ok(serde_json::to_value(obj)?)
    }

    async fn create(
        &self,
        ar: &ApiResource,
        namespace: Option<String>,
        obj: Value,
    ) -> Result<Value> {
        let api = self.api(ar, namespace.as_deref());
        let dynamic: DynamicObject = serde_json::from_value(obj)?;
        let created = api.create(&PostParams::default(), &dynamic).await?;
        Ok(serde_json::to_value(created)?)
    }
}

/// Object name from `metadata.name`
pub fn item_name(item: &Value) -> String {
    item.pointer("/metadata/name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Object namespace from `metadata.namespace`; empty for cluster-scoped
pub fn item_namespace(item: &Value) -> String {
    item.pointer("/metadata/namespace")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Object labels as a plain map
pub fn item_labels(item: &Value) -> BTreeMap<String, String> {
    string_map(item.pointer("/metadata/labels"))
}

/// Object annotations as a plain map
pub fn item_annotations(item: &Value) -> BTreeMap<String, String> {
    string_map(item.pointer("/metadata/annotations"))
}

/// Set one annotation, creating the map if absent
pub fn set_item_annotation(item: &mut Value, key: &str, value: &str) {
    if let Some(metadata) = item.get_mut("metadata").and_then(Value::as_object_mut) {
        let annotations = metadata
            .entry("annotations")
            .or_insert_with(|| Value::Object(Default::default()));
        if let Some(map) = annotations.as_object_mut() {
            map.insert(key.to_string(), Value::String(value.to_string()));
        }
    }
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    value
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}
