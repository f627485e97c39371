//! Schedule sync loop
//!
//! Periodically re-validates every Schedule and emits a Backup for each
//! one whose cron expression has fired since its last backup. Runs as an
//! interval loop rather than an event-driven controller: time, not object
//! churn, is what moves schedules forward.

use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::api::{Api, ListParams, ObjectMeta, PostParams};
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::{Backup, Schedule, SchedulePhase, ScheduleStatus};
use crate::controller::patch_status;
use crate::Result;

/// Label connecting an emitted Backup to its Schedule
pub const SCHEDULE_LABEL: &str = "caravel.dev/schedule-name";

/// Run the schedule sync loop until cancelled
pub async fn run(client: Client, namespace: String, period: Duration, token: CancellationToken) {
    info!(period_secs = period.as_secs(), "starting schedule sync");
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("schedule sync stopping");
                return;
            }
            _ = ticker.tick() => {
                if let Err(e) = sync_once(&client, &namespace, Utc::now()).await {
                    error!(error = %e, "schedule sync pass failed");
                }
            }
        }
    }
}

async fn sync_once(client: &Client, namespace: &str, now: DateTime<Utc>) -> Result<()> {
    let schedules: Api<Schedule> = Api::namespaced(client.clone(), namespace);

    for schedule in schedules.list(&ListParams::default()).await?.items {
        let name = schedule.name_any();
        if let Err(e) = sync_schedule(client, namespace, &schedule, now).await {
            warn!(schedule = %name, error = %e, "error syncing schedule");
        }
    }
    Ok(())
}

async fn sync_schedule(
    client: &Client,
    namespace: &str,
    schedule: &Schedule,
    now: DateTime<Utc>,
) -> Result<()> {
    let name = schedule.name_any();

    // Re-validate every pass so a corrected spec recovers on its own.
    let validation_errors = schedule.spec.validate();
    let current_phase = schedule
        .status
        .as_ref()
        .map(|s| s.phase)
        .unwrap_or(SchedulePhase::New);

    if !validation_errors.is_empty() {
        if current_phase != SchedulePhase::FailedValidation {
            warn!(schedule = %name, errors = ?validation_errors, "schedule failed validation");
            let status = ScheduleStatus {
                phase: SchedulePhase::FailedValidation,
                validation_errors,
                last_backup: schedule.status.as_ref().and_then(|s| s.last_backup),
            };
            patch_status::<Schedule, _>(client, namespace, &name, &status).await?;
        }
        return Ok(());
    }

    if current_phase != SchedulePhase::Enabled {
        let status = ScheduleStatus {
            phase: SchedulePhase::Enabled,
            validation_errors: Vec::new(),
            last_backup: schedule.status.as_ref().and_then(|s| s.last_backup),
        };
        patch_status::<Schedule, _>(client, namespace, &name, &status).await?;
    }

    let last = schedule
        .status
        .as_ref()
        .and_then(|s| s.last_backup)
        .or(schedule.metadata.creation_timestamp.as_ref().map(|t| t.0))
        .unwrap_or(now);

    let Some(due) = schedule.spec.next_fire_after(last) else {
        return Ok(());
    };
    if due > now {
        return Ok(());
    }

    let backup_name = schedule.spec.backup_name(&name, now);
    info!(schedule = %name, backup = %backup_name, "schedule fired, creating backup");

    let mut labels = std::collections::BTreeMap::new();
    labels.insert(SCHEDULE_LABEL.to_string(), name.clone());
    let backup = Backup {
        metadata: ObjectMeta {
            name: Some(backup_name),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: schedule.spec.template.clone(),
        status: None,
    };

    let backups: Api<Backup> = Api::namespaced(client.clone(), namespace);
    match backups.create(&PostParams::default(), &backup).await {
        Ok(_) => {}
        // Two sync passes racing on the same firing is harmless.
        Err(kube::Error::Api(ae)) if ae.code == 409 => {}
        Err(e) => return Err(e.into()),
    }

    let status = ScheduleStatus {
        phase: SchedulePhase::Enabled,
        validation_errors: Vec::new(),
        last_backup: Some(now),
    };
    patch_status::<Schedule, _>(client, namespace, &name, &status).await?;
    Ok(())
}
