//! `cluster recover`: rebuild a lost main cluster from its backups.

use tracing::info;

use super::Bootstrapper;
use crate::error::{Error, Result};
use crate::k8s::connect;
use crate::session::{ClusterTarget, Session};
use crate::ui;
use crate::velero::restore_latest_backup;

/// Pull the sealed-secrets controller keys out of the backup bucket, bootstrap a new cluster
/// that decrypts the existing sealed secrets with them, then restore the latest Velero backup.
///
/// # Errors
///
/// Returns [`Error::Config`] without a `disasterRecovery` section, [`Error::Unsupported`] on
/// clouds without key backups, and [`Error::StatePrecondition`] when the bucket holds no keys.
pub async fn recover_cluster(session: &Session) -> Result<()> {
    if session.config.disaster_recovery().is_none() {
        return Err(Error::config(
            "cloud.disasterRecovery section is required to recover a cluster",
        ));
    }

    ui::print_section(&format!("Recovering cluster {}", session.cluster_name()));

    let keys_dir = session.paths.sealed_secrets_keys();
    let keys = session
        .cloud
        .provider()
        .download_sealed_secrets_backups(session, &keys_dir)
        .await?;
    if keys == 0 {
        return Err(Error::precondition(format!(
            "no sealed-secrets key backups found for cluster {}",
            session.cluster_name()
        )));
    }
    info!(keys, dir = %keys_dir.display(), "Downloaded sealed-secrets keys");

    let mut bootstrapper = Bootstrapper::new_or_resume(session, true)?;
    bootstrapper.run_to_completion().await?;

    let main = connect(&session.kubeconfig(ClusterTarget::Main)).await?;
    let backup = restore_latest_backup(&main).await?;

    ui::print_success(&format!(
        "Cluster {} recovered from backup {backup}",
        session.cluster_name()
    ));
    Ok(())
}
