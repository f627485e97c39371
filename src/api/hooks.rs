//! Backup hook specifications
//!
//! Hooks are user-declared commands executed inside pods before or after
//! their resources are backed up, scoped by resource, namespace, and label
//! selector.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Hook configuration for a backup
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupHooks {
    /// Hooks scoped to matching resources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceHookSpec>,
}

/// A named set of pre/post hooks applying to a filtered set of items
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceHookSpec {
    /// Hook name, used in logs and error messages
    pub name: String,

    /// Namespaces the hook applies to; empty means all
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included_namespaces: Vec<String>,

    /// Namespaces the hook never applies to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_namespaces: Vec<String>,

    /// Resources the hook applies to; empty means all
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included_resources: Vec<String>,

    /// Resources the hook never applies to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_resources: Vec<String>,

    /// Label selector restricting the items the hook applies to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<String>,

    /// Commands run before the item is backed up
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre: Vec<ExecHook>,

    /// Commands run after the item is backed up
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post: Vec<ExecHook>,

    /// Deprecated alias for `pre`, honored when `pre` is empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<ExecHook>,
}

impl ResourceHookSpec {
    /// Pre-hooks, falling back to the deprecated `hooks` field.
    pub fn pre_hooks(&self) -> &[ExecHook] {
        if self.pre.is_empty() {
            &self.hooks
        } else {
            &self.pre
        }
    }
}

/// A command executed inside a pod's container
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecHook {
    /// Container to exec in; defaults to the pod's first container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,

    /// Command and arguments
    pub command: Vec<String>,

    /// What a nonzero exit does to the item's backup
    #[serde(default)]
    pub on_error: HookErrorMode,

    /// Seconds to wait for the command before treating it as failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

/// Failure policy for an exec hook
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum HookErrorMode {
    /// Abort the item's backup (the backup continues with other items)
    #[default]
    Fail,
    /// Log the failure and keep going
    Continue,
}

impl std::fmt::Display for HookErrorMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fail => write!(f, "Fail"),
            Self::Continue => write!(f, "Continue"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pre_hooks_prefers_new_field() {
        let spec = ResourceHookSpec {
            name: "db".into(),
            pre: vec![ExecHook {
                command: vec!["/bin/flush".into()],
                ..Default::default()
            }],
            hooks: vec![ExecHook {
                command: vec!["/bin/legacy".into()],
                ..Default::default()
            }],
            ..Default::default()
        };
        assert_eq!(spec.pre_hooks()[0].command[0], "/bin/flush");
    }

    #[test]
    fn pre_hooks_falls_back_to_deprecated_field() {
        let spec = ResourceHookSpec {
            name: "db".into(),
            hooks: vec![ExecHook {
                command: vec!["/bin/legacy".into()],
                ..Default::default()
            }],
            ..Default::default()
        };
        assert_eq!(spec.pre_hooks()[0].command[0], "/bin/legacy");
    }

    #[test]
    fn on_error_defaults_to_fail() {
        let hook: ExecHook = serde_json::from_value(serde_json::json!({
            "command": ["/bin/true"]
        }))
        .unwrap();
        assert_eq!(hook.on_error, HookErrorMode::Fail);
    }
}
