//! Restore Custom Resource Definition
//!
//! A `Restore` re-applies a recorded backup to the cluster, optionally
//! filtered and with namespaces remapped. Restores are reconciled once and
//! are terminal.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a Restore
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "caravel.dev",
    version = "v1",
    kind = "Restore",
    plural = "restores",
    namespaced,
    status = "RestoreStatus",
    printcolumn = r#"{"name":"Backup","type":"string","jsonPath":".spec.backupName"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSpec {
    /// Name of the backup to restore from
    pub backup_name: String,

    /// Namespaces to restore; empty or `*` means all recorded namespaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included_namespaces: Vec<String>,

    /// Namespaces never restored
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_namespaces: Vec<String>,

    /// Resources to restore; empty or `*` means all recorded resources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included_resources: Vec<String>,

    /// Resources never restored
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_resources: Vec<String>,

    /// Mapping from recorded namespace to target namespace
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub namespace_mapping: BTreeMap<String, String>,

    /// Label selector applied to recorded items
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<String>,

    /// Whether persistent volumes are re-created from recorded snapshots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_pvs: Option<bool>,
}

impl RestoreSpec {
    /// Validate the spec, returning every problem found.
    pub fn validate(&self) -> Vec<String> {
        let mut errs = Vec::new();

        if self.backup_name.is_empty() {
            errs.push("backupName must not be empty".to_string());
        }
        for ns in self.excluded_namespaces.iter() {
            if ns == "*" {
                errs.push("excludedNamespaces cannot contain '*'".to_string());
            }
        }
        for r in self.excluded_resources.iter() {
            if r == "*" {
                errs.push("excludedResources cannot contain '*'".to_string());
            }
        }
        if let Some(sel) = &self.label_selector {
            if let Err(e) = crate::util::labels::LabelQuery::parse(sel) {
                errs.push(format!("invalid labelSelector: {e}"));
            }
        }

        errs
    }
}

/// Status for a Restore
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreStatus {
    /// Current phase of the restore lifecycle
    #[serde(default)]
    pub phase: RestorePhase,

    /// Problems found during validation; set with `FailedValidation`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation_errors: Vec<String>,

    /// Non-fatal findings, bucketed by scope
    #[serde(default, skip_serializing_if = "RestoreResult::is_empty")]
    pub warnings: RestoreResult,

    /// Failures, bucketed by scope
    #[serde(default, skip_serializing_if = "RestoreResult::is_empty")]
    pub errors: RestoreResult,
}

/// Phase of a Restore's lifecycle
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RestorePhase {
    /// Accepted but not yet picked up
    #[default]
    New,
    /// The restore pipeline is running
    InProgress,
    /// Finished; warnings and errors are recorded in status
    Completed,
    /// The spec failed validation; never retried
    FailedValidation,
}

impl RestorePhase {
    /// True for phases that are never reconciled again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::FailedValidation)
    }
}

impl std::fmt::Display for RestorePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "New",
            Self::InProgress => "InProgress",
            Self::Completed => "Completed",
            Self::FailedValidation => "FailedValidation",
        };
        write!(f, "{s}")
    }
}

/// Restore findings bucketed by cluster scope and namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreResult {
    /// Findings about the restore as a whole
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub caravel: Vec<String>,

    /// Findings about cluster-scoped items
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster: Vec<String>,

    /// Findings about namespaced items, keyed by namespace
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub namespaces: BTreeMap<String, Vec<String>>,
}

impl RestoreResult {
    /// True when nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.caravel.is_empty() && self.cluster.is_empty() && self.namespaces.is_empty()
    }

    /// Record a finding against a namespace, or the cluster bucket when
    /// the namespace is empty.
    pub fn add(&mut self, namespace: &str, msg: impl Into<String>) {
        if namespace.is_empty() {
            self.cluster.push(msg.into());
        } else {
            self.namespaces
                .entry(namespace.to_string())
                .or_default()
                .push(msg.into());
        }
    }

    /// Record a finding about the restore as a whole
    pub fn add_global(&mut self, msg: impl Into<String>) {
        self.caravel.push(msg.into());
    }

    /// Total number of findings across all buckets
    pub fn count(&self) -> usize {
        self.caravel.len()
            + self.cluster.len()
            + self.namespaces.values().map(Vec::len).sum::<usize>()
    }

    /// Merge another result set into this one
    pub fn merge(&mut self, other: RestoreResult) {
        self.caravel.extend(other.caravel);
        self.cluster.extend(other.cluster);
        for (ns, msgs) in other.namespaces {
            self.namespaces.entry(ns).or_default().extend(msgs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_requires_backup_name() {
        let errs = RestoreSpec::default().validate();
        assert!(errs.iter().any(|e| e.contains("backupName")));
    }

    #[test]
    fn result_buckets_by_namespace() {
        let mut r = RestoreResult::default();
        r.add("", "pv/pv-1 already exists");
        r.add("nginx-example", "deployment exists");
        r.add("nginx-example", "service exists");
        r.add_global("backup archive missing entry");

        assert_eq!(r.cluster.len(), 1);
        assert_eq!(r.namespaces["nginx-example"].len(), 2);
        assert_eq!(r.count(), 4);
        assert!(!r.is_empty());
    }

    #[test]
    fn result_merge_combines_buckets() {
        let mut a = RestoreResult::default();
        a.add("ns1", "one");
        let mut b = RestoreResult::default();
        b.add("ns1", "two");
        b.add("ns2", "three");
        a.merge(b);
        assert_eq!(a.namespaces["ns1"].len(), 2);
        assert_eq!(a.namespaces["ns2"].len(), 1);
    }
}
