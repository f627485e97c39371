//! Schedule Custom Resource Definition
//!
//! A `Schedule` produces Backups on a cron cadence. The backup template is
//! a full [`BackupSpec`]; emitted backups are named
//! `<schedule>-<yyyymmddhhmmss>` after the firing time.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::backup::BackupSpec;

/// Specification for a Schedule
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "caravel.dev",
    version = "v1",
    kind = "Schedule",
    plural = "schedules",
    namespaced,
    status = "ScheduleStatus",
    printcolumn = r#"{"name":"Cron","type":"string","jsonPath":".spec.schedule"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"LastBackup","type":"date","jsonPath":".status.lastBackup"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleSpec {
    /// Cron expression controlling when backups fire
    pub schedule: String,

    /// Backup spec stamped onto every emitted Backup
    #[serde(default)]
    pub template: BackupSpec,
}

impl ScheduleSpec {
    /// Validate the spec, returning every problem found.
    pub fn validate(&self) -> Vec<String> {
        let mut errs = Vec::new();

        if self.schedule.is_empty() {
            errs.push("schedule must not be empty".to_string());
        } else if let Err(e) = cron::Schedule::from_str(&normalize_cron(&self.schedule)) {
            errs.push(format!("invalid cron expression {:?}: {e}", self.schedule));
        }

        errs.extend(self.template.validate());
        errs
    }

    /// Next firing time strictly after `after`, if the expression parses.
    pub fn next_fire_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let parsed = cron::Schedule::from_str(&normalize_cron(&self.schedule)).ok()?;
        parsed.after(&after).next()
    }

    /// Name for the backup fired at `t`
    pub fn backup_name(&self, schedule_name: &str, t: DateTime<Utc>) -> String {
        format!("{}-{}", schedule_name, t.format("%Y%m%d%H%M%S"))
    }
}

// The cron crate wants a seconds field; user expressions follow the
// five-field convention, so prepend "0". Macros like @hourly pass through.
fn normalize_cron(expr: &str) -> String {
    let expr = expr.trim();
    if expr.starts_with('@') || expr.split_whitespace().count() >= 6 {
        expr.to_string()
    } else {
        format!("0 {expr}")
    }
}

/// Status for a Schedule
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleStatus {
    /// Current phase
    #[serde(default)]
    pub phase: SchedulePhase,

    /// Problems found during validation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation_errors: Vec<String>,

    /// When the schedule last emitted a backup
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_backup: Option<DateTime<Utc>>,
}

/// Phase of a Schedule
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum SchedulePhase {
    /// Accepted but not yet validated
    #[default]
    New,
    /// Validated and firing on cadence
    Enabled,
    /// The spec failed validation; re-validated on every sync pass so a
    /// fixed spec recovers
    FailedValidation,
}

impl std::fmt::Display for SchedulePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "New",
            Self::Enabled => "Enabled",
            Self::FailedValidation => "FailedValidation",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn validate_accepts_five_field_cron() {
        let spec = ScheduleSpec {
            schedule: "0 2 * * *".into(),
            template: BackupSpec::default(),
        };
        assert!(spec.validate().is_empty());
    }

    #[test]
    fn validate_accepts_macros() {
        let spec = ScheduleSpec {
            schedule: "@hourly".into(),
            template: BackupSpec::default(),
        };
        assert!(spec.validate().is_empty());
    }

    #[test]
    fn validate_rejects_garbage() {
        let spec = ScheduleSpec {
            schedule: "whenever".into(),
            template: BackupSpec::default(),
        };
        assert_eq!(spec.validate().len(), 1);
    }

    #[test]
    fn validate_includes_template_problems() {
        let spec = ScheduleSpec {
            schedule: "0 2 * * *".into(),
            template: BackupSpec {
                ttl: Some("sometime".into()),
                ..Default::default()
            },
        };
        assert_eq!(spec.validate().len(), 1);
    }

    #[test]
    fn next_fire_is_strictly_after() {
        let spec = ScheduleSpec {
            schedule: "*/1 * * * *".into(),
            template: BackupSpec::default(),
        };
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 30).unwrap();
        let next = spec.next_fire_after(t).unwrap();
        assert!(next > t);
        assert_eq!(next.format("%S").to_string(), "00");
    }

    #[test]
    fn backup_names_embed_the_firing_time() {
        let spec = ScheduleSpec {
            schedule: "0 2 * * *".into(),
            template: BackupSpec::default(),
        };
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 2, 0, 0).unwrap();
        assert_eq!(spec.backup_name("nightly", t), "nightly-20240501020000");
    }
}
