//! Garbage collection loop
//!
//! Periodically finds expired backups and files a `DeleteBackupRequest`
//! for each, so every artifact teardown flows through the one deletion
//! path regardless of what triggered it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::api::{Api, ListParams, ObjectMeta, PostParams};
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::{Backup, BackupPhase, DeleteBackupRequest, DeleteBackupRequestSpec};
use crate::Result;

/// Run the garbage collection loop until cancelled
pub async fn run(client: Client, namespace: String, period: Duration, token: CancellationToken) {
    info!(period_secs = period.as_secs(), "starting garbage collection");
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("garbage collection stopping");
                return;
            }
            _ = ticker.tick() => {
                if let Err(e) = collect_once(&client, &namespace, Utc::now()).await {
                    error!(error = %e, "garbage collection pass failed");
                }
            }
        }
    }
}

/// Whether a backup is expired at `now`
pub fn is_expired(backup: &Backup, now: DateTime<Utc>) -> bool {
    backup
        .status
        .as_ref()
        .and_then(|s| s.expiration)
        .map(|exp| exp <= now)
        .unwrap_or(false)
}

async fn collect_once(client: &Client, namespace: &str, now: DateTime<Utc>) -> Result<()> {
    let backups: Api<Backup> = Api::namespaced(client.clone(), namespace);
    let requests: Api<DeleteBackupRequest> = Api::namespaced(client.clone(), namespace);

    for backup in backups.list(&ListParams::default()).await?.items {
        let name = backup.name_any();

        if !is_expired(&backup, now) {
            continue;
        }
        if backup.status.as_ref().map(|s| s.phase) == Some(BackupPhase::Deleting) {
            continue;
        }

        info!(backup = %name, "backup expired, requesting deletion");

        // One request per backup: a deterministic name makes repeat passes
        // collide on 409 instead of piling up requests.
        let request = DeleteBackupRequest {
            metadata: ObjectMeta {
                name: Some(format!("{name}-gc")),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: DeleteBackupRequestSpec { backup_name: name.clone() },
            status: None,
        };

        match requests.create(&PostParams::default(), &request).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 409 => {}
            Err(e) => warn!(backup = %name, error = %e, "failed to create deletion request"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{BackupSpec, BackupStatus};
    use chrono::TimeZone;

    fn backup_expiring_at(expiration: Option<DateTime<Utc>>) -> Backup {
        let mut backup = Backup::new("b1", BackupSpec::default());
        backup.status = Some(BackupStatus {
            expiration,
            ..Default::default()
        });
        backup
    }

    #[test]
    fn expired_exactly_at_ttl_boundary() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let backup = backup_expiring_at(Some(t));
        assert!(is_expired(&backup, t));
        assert!(is_expired(&backup, t + chrono::Duration::seconds(1)));
        assert!(!is_expired(&backup, t - chrono::Duration::seconds(1)));
    }

    #[test]
    fn no_expiration_never_expires() {
        let backup = backup_expiring_at(None);
        assert!(!is_expired(&backup, Utc::now()));
    }
}
