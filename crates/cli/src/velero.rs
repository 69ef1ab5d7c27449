//! Velero backups and restores, and the first sealed-secrets key backup.

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use kube::api::{Api, DynamicObject, ListParams, ObjectMeta, PostParams};
use kube::Client;
use serde_json::json;
use tracing::info;

use crate::constants::NAMESPACE_VELERO;
use crate::error::{Error, Result};
use crate::k8s::resources::{namespaced, velero_backup, velero_restore};

/// Create an empty-spec Backup named `name`.
///
/// # Errors
///
/// Returns an error if the Backup cannot be created.
pub async fn create_backup(client: &Client, name: &str) -> Result<()> {
    let backups = namespaced(client, NAMESPACE_VELERO, &velero_backup());
    let mut backup = DynamicObject::new(name, &velero_backup()).within(NAMESPACE_VELERO);
    backup.data = json!({ "spec": {} });

    backups.create(&PostParams::default(), &backup).await?;
    info!(backup = %name, "Created Velero Backup");
    Ok(())
}

fn start_timestamp(backup: &DynamicObject) -> Option<DateTime<Utc>> {
    backup
        .data
        .pointer("/status/startTimestamp")
        .and_then(|ts| ts.as_str())
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

/// The Backup with the most recent `status.startTimestamp`.
#[must_use]
pub fn latest_backup(backups: &[DynamicObject]) -> Option<&DynamicObject> {
    backups
        .iter()
        .filter_map(|backup| start_timestamp(backup).map(|ts| (ts, backup)))
        .max_by_key(|(ts, _)| *ts)
        .map(|(_, backup)| backup)
}

/// Restore the most recent Backup, persistent volumes included. Returns the Backup's name.
///
/// # Errors
///
/// Returns [`Error::StatePrecondition`] when there is no started Backup to restore.
pub async fn restore_latest_backup(client: &Client) -> Result<String> {
    let backups = namespaced(client, NAMESPACE_VELERO, &velero_backup());
    let list = backups.list(&ListParams::default()).await?;

    let name = latest_backup(&list.items)
        .and_then(|backup| backup.metadata.name.clone())
        .ok_or_else(|| {
            Error::precondition(format!("no Velero Backups found in namespace {NAMESPACE_VELERO}"))
        })?;
    info!(backup = %name, "Identified latest Velero Backup");

    let restores = namespaced(client, NAMESPACE_VELERO, &velero_restore());
    let mut restore = DynamicObject::new(&name, &velero_restore()).within(NAMESPACE_VELERO);
    restore.data = json!({
        "spec": {
            "backupName": name,
            "restorePVs": true
        }
    });
    restores.create(&PostParams::default(), &restore).await?;

    info!(restore = %name, "Created Velero Restore");
    Ok(name)
}

/// Run CronJob `namespace/name` once, right now.
///
/// # Errors
///
/// Returns an error if the CronJob is missing or the Job cannot be created.
pub async fn trigger_cron_job(client: &Client, namespace: &str, name: &str) -> Result<String> {
    let cron_jobs: Api<CronJob> = Api::namespaced(client.clone(), namespace);
    let cron_job = cron_jobs.get_opt(name).await?.ok_or_else(|| {
        Error::precondition(format!("CronJob {namespace}/{name} not found"))
    })?;

    let template = cron_job
        .spec
        .map(|spec| spec.job_template)
        .ok_or_else(|| Error::precondition(format!("CronJob {namespace}/{name} has no spec")))?;

    let job_name = format!("{name}-{}", Utc::now().timestamp());
    let job = Job {
        metadata: ObjectMeta {
            name: Some(job_name.clone()),
            namespace: Some(namespace.to_string()),
            labels: template.metadata.as_ref().and_then(|m| m.labels.clone()),
            annotations: Some([("cronjob.kubernetes.io/instantiate".to_string(), "manual".to_string())].into()),
            ..ObjectMeta::default()
        },
        spec: template.spec,
        ..Job::default()
    };

    let jobs: Api<Job> = Api::namespaced(client.clone(), namespace);
    jobs.create(&PostParams::default(), &job).await?;
    info!(cronjob = %name, job = %job_name, "Triggered CronJob");
    Ok(job_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backup(name: &str, started: Option<&str>) -> DynamicObject {
        let mut backup = DynamicObject::new(name, &velero_backup()).within(NAMESPACE_VELERO);
        backup.data = match started {
            Some(ts) => json!({ "status": { "startTimestamp": ts, "phase": "Completed" } }),
            None => json!({ "status": { "phase": "New" } }),
        };
        backup
    }

    #[test]
    fn test_latest_backup_by_start_time() {
        let backups = vec![
            backup("velero-daily-20250101000000", Some("2025-01-01T00:00:05Z")),
            backup("velero-daily-20250102000000", Some("2025-01-02T00:00:03Z")),
            backup("init", Some("2024-12-30T11:45:00Z")),
            backup("queued", None),
        ];
        let latest = latest_backup(&backups).unwrap();
        assert_eq!(latest.metadata.name.as_deref(), Some("velero-daily-20250102000000"));
    }

    #[test]
    fn test_no_started_backup() {
        assert!(latest_backup(&[backup("queued", None)]).is_none());
        assert!(latest_backup(&[]).is_none());
    }
}
