//! `cluster delete`.

use std::path::Path;
use std::sync::Arc;

use kubeaid_cloud::CommandRunner;
use tracing::info;

use crate::argocd::connect_to;
use crate::capi::{delete_cluster, is_clusterctl_move_executed, ClusterRef, Clusterctl};
use crate::constants::{APP_CAPI_CLUSTER, CLUSTER_DELETE_GRACE_SECS, CLUSTER_DELETE_POLL};
use crate::error::{Error, Result};
use crate::k3d::K3d;
use crate::k8s::connect;
use crate::session::{ClusterTarget, Session};
use crate::state::{clear_pivot_marker, pivot_marker_present, retry_transient, RetryConfig};
use crate::ui;

/// Move the main cluster's Cluster API objects back into the management cluster if they were
/// pivoted, then delete the `Cluster` and wait until its infrastructure is gone.
///
/// # Errors
///
/// Returns [`Error::Unsupported`] for clouds Cluster API does not manage, and
/// [`Error::StatePrecondition`] when the `Cluster` cannot be found anywhere.
pub async fn delete_main_cluster(session: &Session) -> Result<()> {
    if !session.cloud_kind().uses_capi() {
        return Err(Error::Unsupported(format!(
            "deleting a {} main cluster",
            session.cloud_kind()
        )));
    }

    let outputs = &session.paths.outputs;
    let cluster = ClusterRef::new(session.cluster_name(), session.config.capi_namespace());
    let main_kubeconfig = session.kubeconfig(ClusterTarget::Main);
    let management_kubeconfig = session.kubeconfig(ClusterTarget::Management);

    ui::print_section(&format!("Deleting cluster {}", cluster.name));

    if is_clusterctl_move_executed(outputs, &main_kubeconfig, &cluster).await {
        let clusterctl = Clusterctl::new(Arc::clone(&session.runner));
        // Webhooks of the freshly moved controllers may not answer yet.
        retry_transient(&RetryConfig::default(), "clusterctl move back", || {
            clusterctl.move_objects(&main_kubeconfig, &management_kubeconfig, &cluster.namespace)
        })
        .await?;
        clear_pivot_marker(outputs)?;
        info!(cluster = %cluster.name, "Moved Cluster API objects back into the management cluster");
    }

    let management = connect(&management_kubeconfig).await?;
    if cluster.get(&management).await?.is_none() {
        if pivot_marker_present(outputs) {
            return Err(missing_cluster(&cluster));
        }
        // A fresh management cluster: let ArgoCD declare the Cluster again so it can be deleted.
        info!(cluster = %cluster.name, "Cluster not found, syncing capi-cluster into the management cluster");
        let mut argocd = connect_to(&management_kubeconfig).await?;
        argocd.sync(APP_CAPI_CLUSTER, &[]).await?;

        if cluster.get(&management).await?.is_none() {
            return Err(missing_cluster(&cluster));
        }
    }

    delete_cluster(
        &management,
        &cluster,
        CLUSTER_DELETE_GRACE_SECS,
        CLUSTER_DELETE_POLL,
    )
    .await?;

    ui::print_success(&format!("Deleted cluster {}", cluster.name));
    Ok(())
}

fn missing_cluster(cluster: &ClusterRef) -> Error {
    Error::precondition(format!(
        "Cluster {}/{} not found in the management cluster",
        cluster.namespace, cluster.name
    ))
}

/// Delete the local K3D management cluster from its rendered config.
///
/// # Errors
///
/// Returns [`Error::StatePrecondition`] if the cluster was never created from this directory.
pub async fn delete_management_cluster(runner: Arc<dyn CommandRunner>, k3d_config: &Path) -> Result<()> {
    K3d::new(runner).delete_cluster(k3d_config).await?;
    ui::print_success("Deleted the management cluster");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubeaid_cloud::{CommandOutput, MockCommandRunner};

    #[test]
    fn test_missing_cluster_names_the_object() {
        let err = missing_cluster(&ClusterRef::new("demo", "capi-cluster-acme"));
        assert!(matches!(err, Error::StatePrecondition(_)));
        assert!(err.to_string().contains("capi-cluster-acme/demo"));
    }

    #[tokio::test]
    async fn test_delete_management_cluster_uses_rendered_config() {
        let dir = tempfile::tempdir().unwrap();
        let config_file = dir.path().join("k3d.config.yaml");
        std::fs::write(&config_file, "apiVersion: k3d.io/v1alpha5\n").unwrap();

        let expected = config_file.display().to_string();
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(move |invocation| {
                invocation.program == "k3d"
                    && invocation.args == ["cluster", "delete", "--config", expected.as_str()]
            })
            .times(1)
            .returning(|_| {
                Ok(CommandOutput {
                    status: 0,
                    stdout: String::new(),
                    stderr: String::new(),
                })
            });

        delete_management_cluster(Arc::new(runner), &config_file)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_management_cluster_requires_config() {
        let dir = tempfile::tempdir().unwrap();
        let err = delete_management_cluster(
            Arc::new(MockCommandRunner::new()),
            &dir.path().join("k3d.config.yaml"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::StatePrecondition(_)));
    }
}
