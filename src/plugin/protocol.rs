//! Plugin wire protocol
//!
//! Plugins are external executables spoken to over length-delimited JSON
//! frames on stdin/stdout. The host sends [`ClientFrame`]s; the plugin
//! answers with [`ServerFrame`]s. Responses are correlated by `id`; `Log`
//! frames are an unsolicited sidechannel routed into the host's log.
//!
//! Binary bodies travel base64-encoded so frames stay valid JSON.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The kinds of functionality a plugin can provide
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum PluginKind {
    /// Blob storage driver
    ObjectStore,
    /// Volume snapshot driver
    BlockStore,
    /// Mutates/expands items during backup
    BackupItemAction,
    /// Mutates items during restore
    RestoreItemAction,
}

impl std::fmt::Display for PluginKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ObjectStore => "objectStore",
            Self::BlockStore => "blockStore",
            Self::BackupItemAction => "backupItemAction",
            Self::RestoreItemAction => "restoreItemAction",
        };
        write!(f, "{s}")
    }
}

/// One implementation a plugin process advertises during handshake
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PluginDescriptor {
    /// What the implementation is
    pub kind: PluginKind,
    /// Registry name, e.g. `aws`
    pub name: String,
}

/// Host-to-plugin frame
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientFrame {
    /// A correlated method call
    #[serde(rename_all = "camelCase")]
    Request {
        /// Correlation id echoed in the response
        id: u64,
        /// Named implementation within the process the call addresses
        target: String,
        /// The call itself
        request: Request,
    },
}

/// Plugin-to-host frame
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerFrame {
    /// Answer to a [`ClientFrame::Request`] with the same id
    #[serde(rename_all = "camelCase")]
    Response {
        /// Correlation id
        id: u64,
        /// The outcome; errors are plain strings
        #[serde(flatten)]
        outcome: Outcome,
    },
    /// Unsolicited log line from the plugin
    #[serde(rename_all = "camelCase")]
    Log {
        /// `debug`, `info`, `warn`, or `error`
        level: String,
        /// Log message
        message: String,
    },
}

/// Success-or-error body of a response frame
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Outcome {
    /// The call succeeded
    Result(Response),
    /// The call failed
    Error(String),
}

/// Method calls the host can make
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
#[allow(missing_docs)] // field meanings follow the trait methods they proxy
pub enum Request {
    /// List the implementations this process provides
    Handshake,

    /// Initialize a store implementation with its provider config
    #[serde(rename_all = "camelCase")]
    Init { config: BTreeMap<String, String> },

    // --- object store ---
    #[serde(rename_all = "camelCase")]
    PutObject {
        bucket: String,
        key: String,
        #[serde(with = "base64_bytes")]
        body: Vec<u8>,
    },
    #[serde(rename_all = "camelCase")]
    GetObject { bucket: String, key: String },
    #[serde(rename_all = "camelCase")]
    ListCommonPrefixes {
        bucket: String,
        prefix: String,
        delimiter: String,
    },
    #[serde(rename_all = "camelCase")]
    ListObjects { bucket: String, prefix: String },
    #[serde(rename_all = "camelCase")]
    DeleteObject { bucket: String, key: String },
    #[serde(rename_all = "camelCase")]
    CreateSignedUrl {
        bucket: String,
        key: String,
        ttl_seconds: u64,
    },

    // --- block store ---
    #[serde(rename_all = "camelCase")]
    CreateVolumeFromSnapshot {
        snapshot_id: String,
        volume_type: String,
        zone: String,
        iops: Option<i64>,
    },
    #[serde(rename_all = "camelCase")]
    GetVolumeInfo { volume_id: String, zone: String },
    #[serde(rename_all = "camelCase")]
    IsVolumeReady { volume_id: String, zone: String },
    #[serde(rename_all = "camelCase")]
    ListSnapshots { tag_filters: BTreeMap<String, String> },
    #[serde(rename_all = "camelCase")]
    CreateSnapshot {
        volume_id: String,
        zone: String,
        tags: BTreeMap<String, String>,
    },
    #[serde(rename_all = "camelCase")]
    DeleteSnapshot { snapshot_id: String },
    #[serde(rename_all = "camelCase")]
    GetVolumeId { pv: serde_json::Value },
    #[serde(rename_all = "camelCase")]
    SetVolumeId {
        pv: serde_json::Value,
        volume_id: String,
    },

    // --- item actions ---
    AppliesTo,
    #[serde(rename_all = "camelCase")]
    ExecuteBackupAction {
        item: serde_json::Value,
        backup: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    ExecuteRestoreAction {
        item: serde_json::Value,
        restore: serde_json::Value,
    },
}

/// Successful results, one variant per result shape
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
#[allow(missing_docs)]
pub enum Response {
    Empty,
    #[serde(rename_all = "camelCase")]
    Handshake { plugins: Vec<PluginDescriptor> },
    #[serde(rename_all = "camelCase")]
    Bytes {
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    #[serde(rename_all = "camelCase")]
    Keys { keys: Vec<String> },
    #[serde(rename_all = "camelCase")]
    Url { url: String },
    #[serde(rename_all = "camelCase")]
    Bool { value: bool },
    #[serde(rename_all = "camelCase")]
    VolumeId { volume_id: Option<String> },
    #[serde(rename_all = "camelCase")]
    VolumeInfo {
        volume_type: String,
        iops: Option<i64>,
    },
    #[serde(rename_all = "camelCase")]
    SnapshotId { snapshot_id: String },
    #[serde(rename_all = "camelCase")]
    Item { item: serde_json::Value },
    #[serde(rename_all = "camelCase")]
    Selector { selector: ActionSelector },
    #[serde(rename_all = "camelCase")]
    BackupActionResult {
        item: serde_json::Value,
        additional_items: Vec<ResourceIdentifier>,
    },
}

/// Scope an item action applies to
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionSelector {
    /// Namespaces the action applies to; empty means all
    #[serde(default)]
    pub included_namespaces: Vec<String>,
    /// Namespaces the action never applies to
    #[serde(default)]
    pub excluded_namespaces: Vec<String>,
    /// Resources the action applies to; empty means all
    #[serde(default)]
    pub included_resources: Vec<String>,
    /// Resources the action never applies to
    #[serde(default)]
    pub excluded_resources: Vec<String>,
    /// Label selector restricting matching items
    #[serde(default)]
    pub label_selector: Option<String>,
}

/// An item an action asks the backup to additionally include
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceIdentifier {
    /// Canonical `resource.group` key
    pub group_resource: String,
    /// Namespace; empty for cluster-scoped items
    #[serde(default)]
    pub namespace: String,
    /// Object name
    pub name: String,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(bytes).serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
