//! `cluster upgrade`: roll the main cluster onto a new Kubernetes version and OS image.

use std::path::Path;
use std::sync::Arc;

use kube::api::DynamicObject;
use kube::Client;
use tracing::info;

use super::checkout::{commit_message, Checkouts};
use crate::argocd::{connect_to, ArgoCd, SyncResource};
use crate::capi::{is_clusterctl_move_executed, ClusterRef, Clusterctl};
use crate::cloud::{InfrastructureRef, MachineImageUpdates};
use crate::config::validate::{validate_k8s_version, K8sVersion};
use crate::config::{CloudKind, Config};
use crate::constants::APP_CAPI_CLUSTER;
use crate::error::{Error, Result};
use crate::k8s::connect;
use crate::k8s::resources::{kubeadm_control_plane, machine_deployment, namespaced};
use crate::session::{ClusterTarget, Session};
use crate::templates::{set_yaml_path, update_yaml_file, TEMPLATE_VALUES_CAPI_CLUSTER};
use crate::ui;

/// What `cluster upgrade` was asked to change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    /// The cloud the subcommand was invoked for.
    pub cloud: CloudKind,
    pub new_k8s_version: String,
    pub images: MachineImageUpdates,
}

/// Upgrade the control plane, then every node group.
///
/// # Errors
///
/// Returns [`Error::Config`] when the request does not match the configured cluster, or the
/// first failing git, ArgoCD or Kubernetes operation.
pub async fn upgrade_cluster(session: &Session, request: &UpgradeRequest) -> Result<()> {
    let config = &session.config;
    let version = target_version(config, request)?;
    let provider = session.cloud.provider();

    ui::print_section(&format!("Upgrading {} to {version}", session.cluster_name()));

    let mut checkouts = Checkouts::prepare(session).await?;
    checkouts.config_repo.start_change(session).await?;
    let values_file = checkouts.cluster_dir(config).join(TEMPLATE_VALUES_CAPI_CLUSTER);
    update_yaml_file(&values_file, |document| {
        set_kubernetes_version(document, &version)?;
        provider.update_values_file(document, &request.images)
    })?;
    checkouts
        .config_repo
        .publish(
            config,
            &commit_message(session.cluster_name(), "updated values-capi-cluster.yaml"),
        )
        .await?;

    // The Cluster API objects live wherever the last clusterctl move left them.
    let cluster = ClusterRef::new(session.cluster_name(), config.capi_namespace());
    let main_kubeconfig = session.kubeconfig(ClusterTarget::Main);
    let kubeconfig =
        if is_clusterctl_move_executed(&session.paths.outputs, &main_kubeconfig, &cluster).await {
            main_kubeconfig
        } else {
            session.kubeconfig(ClusterTarget::Management)
        };
    info!(kubeconfig = %kubeconfig.display(), "Upgrading through");

    let client = connect(&kubeconfig).await?;
    let mut upgrader = Upgrader {
        session,
        argocd: connect_to(&kubeconfig).await?,
        clusterctl: Clusterctl::new(Arc::clone(&session.runner)),
        client,
        kubeconfig: &kubeconfig,
        namespace: config.capi_namespace(),
        images: &request.images,
    };

    upgrader.upgrade_control_plane().await?;
    for node_group in node_group_names(config) {
        upgrader.upgrade_node_group(&node_group).await?;
    }

    ui::print_success(&format!("Cluster {} upgraded to {version}", session.cluster_name()));
    Ok(())
}

/// The normalized version to upgrade to, once the request is known to fit the cluster.
fn target_version(config: &Config, request: &UpgradeRequest) -> Result<String> {
    if request.cloud != config.cloud {
        return Err(Error::config(format!(
            "cannot run the {} upgrade on a {} cluster",
            request.cloud, config.cloud
        )));
    }
    validate_k8s_version(&request.new_k8s_version, config.latest_stable_k8s_version)?;
    Ok(K8sVersion::parse(&request.new_k8s_version)?.to_string())
}

struct Upgrader<'a> {
    session: &'a Session,
    argocd: ArgoCd,
    clusterctl: Clusterctl,
    client: Client,
    kubeconfig: &'a Path,
    namespace: String,
    images: &'a MachineImageUpdates,
}

impl Upgrader<'_> {
    async fn upgrade_control_plane(&mut self) -> Result<()> {
        let name = format!("{}-control-plane", self.session.cluster_name());
        let control_plane = namespaced(&self.client, &self.namespace, &kubeadm_control_plane())
            .get(&name)
            .await?;
        let template = infrastructure_ref(&control_plane, "/spec/machineTemplate/infrastructureRef")?;

        self.session
            .cloud
            .provider()
            .update_machine_template(&self.client, &self.namespace, &template, self.images)
            .await?;

        self.argocd
            .sync(
                APP_CAPI_CLUSTER,
                &[SyncResource::new(
                    "controlplane.cluster.x-k8s.io",
                    "KubeadmControlPlane",
                    &name,
                )],
            )
            .await?;

        self.clusterctl
            .rollout_restart(self.kubeconfig, &format!("kubeadmcontrolplane/{name}"), &self.namespace)
            .await?;
        info!(control_plane = %name, "Upgraded control plane");
        Ok(())
    }

    async fn upgrade_node_group(&mut self, node_group: &str) -> Result<()> {
        let name = format!("{}-{node_group}", self.session.cluster_name());
        let deployment = namespaced(&self.client, &self.namespace, &machine_deployment())
            .get(&name)
            .await?;
        let template = infrastructure_ref(&deployment, "/spec/template/spec/infrastructureRef")?;

        self.session
            .cloud
            .provider()
            .update_machine_template(&self.client, &self.namespace, &template, self.images)
            .await?;

        self.argocd
            .sync(
                APP_CAPI_CLUSTER,
                &[
                    SyncResource::new("bootstrap.cluster.x-k8s.io", "KubeadmConfigTemplate", &name),
                    SyncResource::new("cluster.x-k8s.io", "MachineDeployment", &name),
                ],
            )
            .await?;

        self.clusterctl
            .rollout_restart(self.kubeconfig, &format!("machinedeployment/{name}"), &self.namespace)
            .await?;
        info!(node_group = %name, "Upgraded node group");
        Ok(())
    }
}

fn set_kubernetes_version(document: &mut serde_yaml::Value, version: &str) -> Result<()> {
    set_yaml_path(
        document,
        &["global", "kubernetes", "version"],
        serde_yaml::Value::from(version),
    )
}

/// The machine template `object` points at through the reference at `pointer`.
fn infrastructure_ref(object: &DynamicObject, pointer: &str) -> Result<InfrastructureRef> {
    let reference = object.data.pointer(pointer);
    let field = |key: &str| {
        reference
            .and_then(|r| r.get(key))
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
    };

    match (field("kind"), field("name")) {
        (Some(kind), Some(name)) => Ok(InfrastructureRef { kind, name }),
        _ => Err(Error::precondition(format!(
            "{} has no infrastructure reference at {pointer}",
            object.metadata.name.as_deref().unwrap_or_default()
        ))),
    }
}

/// Names of the node groups Cluster API runs as MachineDeployments.
fn node_group_names(config: &Config) -> Vec<String> {
    let cloud = &config.general.cloud;
    let mut names = Vec::new();
    if let Some(aws) = cloud.aws.as_ref() {
        names.extend(aws.node_groups.iter().map(|ng| ng.autoscaling.node_group.name.clone()));
    }
    if let Some(azure) = cloud.azure.as_ref() {
        names.extend(azure.node_groups.iter().map(|ng| ng.autoscaling.node_group.name.clone()));
    }
    if let Some(hetzner) = cloud.hetzner.as_ref() {
        let groups = &hetzner.node_groups;
        names.extend(groups.hcloud.iter().map(|ng| ng.autoscaling.node_group.name.clone()));
        names.extend(groups.bare_metal.iter().map(|ng| ng.node_group.name.clone()));
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;
    use serde_json::json;

    fn object(name: &str, data: serde_json::Value) -> DynamicObject {
        DynamicObject {
            types: None,
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            data,
        }
    }

    #[test]
    fn test_control_plane_infrastructure_ref() {
        let kcp = object(
            "demo-control-plane",
            json!({"spec": {"machineTemplate": {"infrastructureRef": {
                "kind": "AWSMachineTemplate",
                "name": "demo-control-plane-v2"
            }}}}),
        );
        let reference = infrastructure_ref(&kcp, "/spec/machineTemplate/infrastructureRef").unwrap();
        assert_eq!(
            reference,
            InfrastructureRef {
                kind: "AWSMachineTemplate".to_string(),
                name: "demo-control-plane-v2".to_string(),
            }
        );
    }

    #[test]
    fn test_missing_infrastructure_ref() {
        let md = object("demo-workers", json!({"spec": {"template": {"spec": {}}}}));
        let err = infrastructure_ref(&md, "/spec/template/spec/infrastructureRef").unwrap_err();
        assert!(matches!(err, Error::StatePrecondition(_)));
        assert!(err.to_string().contains("demo-workers"));
    }

    fn aws_request(version: &str) -> UpgradeRequest {
        UpgradeRequest {
            cloud: CloudKind::Aws,
            new_k8s_version: version.to_string(),
            images: MachineImageUpdates::default(),
        }
    }

    fn aws_config() -> Config {
        crate::config::test_config(
            r"
forkURLs:
  kubeaid:
    version: 19.0.0
  kubeaidConfig:
    url: https://github.com/example/kubeaid-config
cluster:
  name: demo
  k8sVersion: v1.31.2
cloud:
  aws:
    region: eu-west-1
    sshKeyName: kubeaid
    controlPlane:
      replicas: 3
      instanceType: t4g.medium
      ami:
        id: ami-0123
",
            "",
        )
    }

    #[test]
    fn test_target_version_normalizes_supported_version() {
        assert_eq!(
            target_version(&aws_config(), &aws_request("1.32.4")).unwrap(),
            "v1.32.4"
        );
    }

    #[test]
    fn test_target_version_rejects_versions_out_of_range() {
        let config = aws_config();
        for version in ["v1.29.9", "v1.33.2", "v1.40.0"] {
            let err = target_version(&config, &aws_request(version)).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{version} accepted");
        }
    }

    #[test]
    fn test_target_version_rejects_other_cloud() {
        let request = UpgradeRequest {
            cloud: CloudKind::Hetzner,
            ..aws_request("v1.31.4")
        };
        let err = target_version(&aws_config(), &request).unwrap_err();
        assert!(err.to_string().contains("hetzner upgrade on a aws cluster"));
    }

    #[test]
    fn test_set_kubernetes_version_keeps_other_values() {
        let mut document: serde_yaml::Value = serde_yaml::from_str(
            "global:\n  clusterName: demo\n  kubernetes:\n    version: v1.30.4\n",
        )
        .unwrap();
        set_kubernetes_version(&mut document, "v1.31.2").unwrap();

        assert_eq!(document["global"]["kubernetes"]["version"], "v1.31.2");
        assert_eq!(document["global"]["clusterName"], "demo");
    }
}
