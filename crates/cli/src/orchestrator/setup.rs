//! Installing the GitOps and Cluster API stack into a cluster.
//!
//! Management and main cluster go through the same sequence: sealed-secrets, ArgoCD, the
//! bootstrap Apps, then the Cluster API operator and infrastructure provider.

use std::path::Path;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::Client;
use tracing::{debug, info};

use crate::argocd::{install_and_setup, ArgoCd, SyncResource};
use crate::constants::{
    APP_CAPI_CLUSTER, APP_CERT_MANAGER, APP_CLUSTER_API, APP_ROOT, APP_SEALED_SECRETS,
    APP_SECRETS, CAPI_POLL, NAMESPACE_CROSSPLANE, NAMESPACE_OBMONDO, NAMESPACE_SEALED_SECRETS,
    RELEASE_NAME_SEALED_SECRETS,
};
use crate::error::Result;
use crate::k8s::{connect, ensure_namespace, ChartSource, HelmRelease};
use crate::sealed_secrets::restore_keys;
use crate::session::Session;
use crate::templates::TEMPLATE_VALUES_SEALED_SECRETS;
use crate::ui;

/// Apps synced right after ArgoCD comes up, in order.
const BOOTSTRAP_APPS: [&str; 4] = [APP_ROOT, APP_CERT_MANAGER, APP_SEALED_SECRETS, APP_SECRETS];

/// Install the sealed-secrets controller from the KubeAid clone.
///
/// With `restore_backed_up_keys` the recovered controller keys are put in place first, so the
/// controller starts with them.
///
/// # Errors
///
/// Returns an error if the key restore or the Helm install fails.
pub async fn install_sealed_secrets(
    session: &Session,
    kubeconfig: &Path,
    kubeaid_dir: &Path,
    cluster_dir: &Path,
    restore_backed_up_keys: bool,
) -> Result<()> {
    let client = connect(kubeconfig).await?;
    ensure_namespace(&client, NAMESPACE_SEALED_SECRETS).await?;

    if restore_backed_up_keys {
        restore_keys(&session.kubectl(kubeconfig), &session.paths.sealed_secrets_keys()).await?;
    }

    let values = std::fs::read_to_string(cluster_dir.join(TEMPLATE_VALUES_SEALED_SECRETS))?;
    session
        .helm(kubeconfig)
        .install(&HelmRelease {
            name: RELEASE_NAME_SEALED_SECRETS.to_string(),
            namespace: NAMESPACE_SEALED_SECRETS.to_string(),
            chart: ChartSource::Path(kubeaid_dir.join("argocd-helm-charts").join("sealed-secrets")),
            values: Some(values),
        })
        .await?;

    info!(kubeconfig = %kubeconfig.display(), "Installed sealed-secrets");
    Ok(())
}

/// Install sealed-secrets and ArgoCD, then sync the Apps everything else depends on.
///
/// # Errors
///
/// Returns an error if any install or sync fails.
pub async fn install_gitops(
    session: &Session,
    kubeconfig: &Path,
    kubeaid_dir: &Path,
    cluster_dir: &Path,
    restore_backed_up_keys: bool,
) -> Result<ArgoCd> {
    let client = connect(kubeconfig).await?;
    for namespace in [NAMESPACE_CROSSPLANE, NAMESPACE_OBMONDO] {
        ensure_namespace(&client, namespace).await?;
    }

    install_sealed_secrets(session, kubeconfig, kubeaid_dir, cluster_dir, restore_backed_up_keys)
        .await?;

    let mut argocd = install_and_setup(session, kubeconfig, kubeaid_dir, cluster_dir).await?;

    if session.cloud_kind().uses_capi() {
        ensure_namespace(&client, &session.config.capi_namespace()).await?;
    }

    sync_bootstrap_apps(&mut argocd).await?;
    Ok(argocd)
}

/// Sync [`BOOTSTRAP_APPS`] one after the other, stopping at the first failure.
async fn sync_bootstrap_apps(argocd: &mut ArgoCd) -> Result<()> {
    for app in BOOTSTRAP_APPS {
        argocd.sync(app, &[]).await?;
    }
    Ok(())
}

/// Sync the Cluster API operator, then only the infrastructure provider out of the
/// capi-cluster App, and wait for the provider to run.
///
/// # Errors
///
/// Returns an error if a sync fails or the pods cannot be listed.
pub async fn install_capi_stack(session: &Session, argocd: &mut ArgoCd, client: &Client) -> Result<()> {
    argocd.sync(APP_CLUSTER_API, &[]).await?;

    let provider = infrastructure_provider_resource(&session.infrastructure_provider_name());
    argocd.sync(APP_CAPI_CLUSTER, &[provider]).await?;

    wait_infrastructure_provider(client, &session.config.capi_namespace()).await
}

fn infrastructure_provider_resource(name: &str) -> SyncResource {
    SyncResource::new("operator.cluster.x-k8s.io", "InfrastructureProvider", name)
}

async fn wait_infrastructure_provider(client: &Client, namespace: &str) -> Result<()> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    loop {
        let list = pods.list(&ListParams::default()).await?;
        if first_pod_running(&list.items) {
            info!(namespace = %namespace, "Infrastructure provider is running");
            return Ok(());
        }
        debug!(namespace = %namespace, "Waiting for the infrastructure provider pod");
        tokio::time::sleep(CAPI_POLL).await;
    }
}

/// The infrastructure provider is the only workload in the CAPI namespace at this point.
fn first_pod_running(pods: &[Pod]) -> bool {
    pods.first()
        .and_then(|pod| pod.status.as_ref())
        .and_then(|status| status.phase.as_deref())
        == Some("Running")
}

/// Everything [`install_gitops`] and [`install_capi_stack`] do, in one go.
///
/// # Errors
///
/// Returns an error if any part of the setup fails.
pub async fn setup_cluster(
    session: &Session,
    kubeconfig: &Path,
    kubeaid_dir: &Path,
    cluster_dir: &Path,
    restore_backed_up_keys: bool,
) -> Result<ArgoCd> {
    let mut argocd =
        install_gitops(session, kubeconfig, kubeaid_dir, cluster_dir, restore_backed_up_keys)
            .await?;

    if session.cloud_kind().uses_capi() {
        let client = connect(kubeconfig).await?;
        install_capi_stack(session, &mut argocd, &client).await?;
    }

    ui::print_argocd_access(&kubeconfig.display().to_string());
    Ok(argocd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodStatus;

    fn pod(phase: &str) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..PodStatus::default()
            }),
            ..Pod::default()
        }
    }

    #[test]
    fn test_first_pod_running() {
        assert!(!first_pod_running(&[]));
        assert!(!first_pod_running(&[pod("Pending")]));
        assert!(first_pod_running(&[pod("Running"), pod("Pending")]));
    }

    mod bootstrap_apps {
        use super::*;
        use crate::argocd::SyncTiming;
        use serde_json::{json, Value};
        use std::time::Duration;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        fn app(name: &str, sync_status: &str) -> Value {
            json!({
                "metadata": { "name": name, "namespace": "argocd" },
                "status": { "sync": { "status": sync_status }, "resources": [] }
            })
        }

        async fn argocd(server: &MockServer) -> ArgoCd {
            Mock::given(method("POST"))
                .and(path("/api/v1/session"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token": "jwt" })))
                .mount(server)
                .await;
            ArgoCd::with_base_url(server.uri(), "hunter2")
                .await
                .unwrap()
                .with_timing(SyncTiming {
                    in_progress_retry: Duration::from_millis(5),
                    root_settle: Duration::from_millis(5),
                    poll: Duration::from_millis(5),
                })
        }

        /// Out of sync on the first read, synced afterwards.
        async fn mount_app(server: &MockServer, name: &str, sync: ResponseTemplate) {
            let app_path = format!("/api/v1/applications/{name}");
            Mock::given(method("GET"))
                .and(path(app_path.as_str()))
                .respond_with(ResponseTemplate::new(200).set_body_json(app(name, "OutOfSync")))
                .up_to_n_times(1)
                .mount(server)
                .await;
            Mock::given(method("GET"))
                .and(path(app_path.as_str()))
                .respond_with(ResponseTemplate::new(200).set_body_json(app(name, "Synced")))
                .mount(server)
                .await;
            Mock::given(method("POST"))
                .and(path(format!("{app_path}/sync").as_str()))
                .respond_with(sync)
                .mount(server)
                .await;
        }

        async fn synced_apps(server: &MockServer) -> Vec<String> {
            server
                .received_requests()
                .await
                .unwrap()
                .iter()
                .filter(|request| request.method.as_str() == "POST")
                .filter_map(|request| {
                    request
                        .url
                        .path()
                        .strip_prefix("/api/v1/applications/")
                        .and_then(|rest| rest.strip_suffix("/sync"))
                        .map(str::to_string)
                })
                .collect()
        }

        #[tokio::test]
        async fn test_apps_are_synced_in_dependency_order() {
            let server = MockServer::start().await;
            for name in ["root", "cert-manager", "sealed-secrets", "secrets"] {
                mount_app(&server, name, ResponseTemplate::new(200).set_body_json(json!({}))).await;
            }

            let mut argocd = argocd(&server).await;
            sync_bootstrap_apps(&mut argocd).await.unwrap();

            assert_eq!(
                synced_apps(&server).await,
                ["root", "cert-manager", "sealed-secrets", "secrets"]
            );
        }

        #[tokio::test]
        async fn test_rejected_sync_stops_later_apps() {
            let server = MockServer::start().await;
            mount_app(&server, "root", ResponseTemplate::new(200).set_body_json(json!({}))).await;
            mount_app(
                &server,
                "cert-manager",
                ResponseTemplate::new(400).set_body_json(json!({ "message": "application spec is invalid" })),
            )
            .await;
            for name in ["sealed-secrets", "secrets"] {
                mount_app(&server, name, ResponseTemplate::new(200).set_body_json(json!({}))).await;
            }

            let mut argocd = argocd(&server).await;
            assert!(sync_bootstrap_apps(&mut argocd).await.is_err());
            assert_eq!(synced_apps(&server).await, ["root", "cert-manager"]);
        }
    }

    #[test]
    fn test_infrastructure_provider_subset() {
        let resource = infrastructure_provider_resource("hetzner-acme");
        assert_eq!(resource.group, "operator.cluster.x-k8s.io");
        assert_eq!(resource.kind, "InfrastructureProvider");
        assert_eq!(resource.name, "hetzner-acme");
    }
}
