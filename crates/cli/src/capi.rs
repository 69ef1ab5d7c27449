//! Waiting on Cluster API: provisioning, node readiness, kubeconfig hand-out and pivot detection.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Node, Taint};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::Client;
use kubeaid_cloud::{run_checked, CommandRunner, Invocation};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::constants::{
    LABEL_CONTROL_PLANE, TAINT_CAPI_NODE_UNINITIALIZED, TAINT_CLOUD_PROVIDER_UNINITIALIZED,
};
use crate::error::{Error, Result};
use crate::k8s::resources::{capi_cluster, condition_is_true, namespaced};
use crate::k8s::{connect, is_not_found, secret_value, write_kubeconfig};
use crate::state::pivot_marker_present;
use crate::templates::ApiEndpoint;

const PHASE_PROVISIONED: &str = "Provisioned";
const CONDITION_READY: &str = "Ready";

/// Identifies the `Cluster` resource of the main cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterRef {
    pub name: String,
    pub namespace: String,
}

impl ClusterRef {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// The `Cluster` resource, `None` when absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails for any reason other than absence.
    pub async fn get(&self, client: &Client) -> Result<Option<DynamicObject>> {
        let clusters = namespaced(client, &self.namespace, &capi_cluster());
        Ok(clusters.get_opt(&self.name).await?)
    }

    fn kubeconfig_secret(&self) -> String {
        format!("{}-kubeconfig", self.name)
    }
}

/// `status.phase == Provisioned` with a true `Ready` condition.
#[must_use]
pub fn is_provisioned(cluster: &DynamicObject) -> bool {
    let phase = cluster
        .data
        .pointer("/status/phase")
        .and_then(|phase| phase.as_str());
    phase == Some(PHASE_PROVISIONED) && condition_is_true(cluster, CONDITION_READY)
}

fn is_control_plane(node: &Node) -> bool {
    node.metadata
        .labels
        .as_ref()
        .is_some_and(|labels| labels.contains_key(LABEL_CONTROL_PLANE))
}

fn is_uninitialized(taint: &Taint) -> bool {
    taint.key == TAINT_CLOUD_PROVIDER_UNINITIALIZED || taint.key == TAINT_CAPI_NODE_UNINITIALIZED
}

/// Worker nodes that carry neither uninitialized taint.
#[must_use]
pub fn initialized_workers(nodes: &[Node]) -> usize {
    nodes
        .iter()
        .filter(|node| !is_control_plane(node))
        .filter(|node| {
            !node
                .spec
                .as_ref()
                .and_then(|spec| spec.taints.as_ref())
                .is_some_and(|taints| taints.iter().any(is_uninitialized))
        })
        .count()
}

/// Poll the management cluster until the main cluster is provisioned.
///
/// # Errors
///
/// Returns [`Error::StatePrecondition`] if the `Cluster` resource does not exist, or the API error.
pub async fn wait_provisioned(client: &Client, cluster: &ClusterRef, poll: Duration) -> Result<()> {
    loop {
        let object = cluster.get(client).await?.ok_or_else(|| {
            Error::precondition(format!(
                "Cluster {}/{} not found in the management cluster",
                cluster.namespace, cluster.name
            ))
        })?;

        if is_provisioned(&object) {
            info!(cluster = %cluster.name, "Main cluster has been provisioned");
            return Ok(());
        }

        info!(cluster = %cluster.name, "Waiting for the main cluster to be provisioned");
        tokio::time::sleep(poll).await;
    }
}

/// Poll until the main cluster's API server answers and at least one worker node is initialized.
///
/// # Errors
///
/// Never gives up on its own; only a cancelled caller ends the wait.
pub async fn wait_ready(client: &Client, poll: Duration) -> Result<()> {
    let nodes: Api<Node> = Api::all(client.clone());
    loop {
        info!(
            "Waiting for the provisioned cluster's API server to be reachable and at least 1 worker node to be initialized"
        );

        match nodes.list(&ListParams::default()).await {
            Ok(list) => {
                let ready = initialized_workers(&list.items);
                if ready > 0 {
                    info!(workers = ready, "Main cluster is ready");
                    return Ok(());
                }
            }
            Err(e) => debug!(error = %e, "Listing nodes failed"),
        }

        tokio::time::sleep(poll).await;
    }
}

/// Copy the kubeconfig Cluster API generated for the main cluster to `destination`.
///
/// Cluster API creates the Secret shortly after the cluster is provisioned, so its absence is
/// waited out.
///
/// # Errors
///
/// Returns an error if the Secret cannot be read or the file cannot be written.
pub async fn save_kubeconfig(
    client: &Client,
    cluster: &ClusterRef,
    destination: &Path,
    poll: Duration,
) -> Result<()> {
    let secret = cluster.kubeconfig_secret();
    let kubeconfig = loop {
        match secret_value(client, &cluster.namespace, &secret, "value").await {
            Ok(Some(kubeconfig)) => break kubeconfig,
            Ok(None) => debug!(secret = %secret, "Kubeconfig Secret not created yet"),
            Err(e) if e.is_transient() => debug!(error = %e, "Reading kubeconfig Secret failed"),
            Err(e) => return Err(e),
        }
        tokio::time::sleep(poll).await;
    };

    write_kubeconfig(destination, &kubeconfig)
}

/// Whether `clusterctl move` moved the `Cluster` into the main cluster.
///
/// The marker written at pivot time is authoritative. Without it the main cluster is queried.
pub async fn is_clusterctl_move_executed(
    outputs_dir: &Path,
    main_kubeconfig: &Path,
    cluster: &ClusterRef,
) -> bool {
    if pivot_marker_present(outputs_dir) {
        return true;
    }
    if !main_kubeconfig.is_file() {
        return false;
    }

    let Ok(client) = connect(main_kubeconfig).await else {
        return false;
    };
    match cluster.get(&client).await {
        Ok(found) => found.is_some(),
        Err(e) => {
            debug!(error = %e, "Main cluster not reachable, assuming no pivot happened");
            false
        }
    }
}

/// API endpoint of the main cluster, read from whichever cluster holds its `Cluster` resource.
pub async fn control_plane_endpoint(
    kubeconfigs: &[&Path],
    cluster: &ClusterRef,
) -> Option<ApiEndpoint> {
    for kubeconfig in kubeconfigs {
        let Ok(client) = connect(kubeconfig).await else {
            continue;
        };
        let Ok(Some(object)) = cluster.get(&client).await else {
            continue;
        };
        let Some(endpoint) = endpoint_of(&object) else {
            debug!(kubeconfig = %kubeconfig.display(), "Cluster has no control plane endpoint yet");
            continue;
        };
        return Some(endpoint);
    }
    None
}

/// `spec.controlPlaneEndpoint` of a `Cluster`, unless it is still blank.
fn endpoint_of(cluster: &DynamicObject) -> Option<ApiEndpoint> {
    let endpoint = cluster.data.pointer("/spec/controlPlaneEndpoint")?;
    let host = endpoint.get("host")?.as_str()?;
    let port = u16::try_from(endpoint.get("port")?.as_u64()?).ok()?;
    if host.is_empty() || port == 0 {
        return None;
    }
    Some(ApiEndpoint {
        host: host.to_string(),
        port,
    })
}

/// Drop `NoSchedule` taints from control-plane nodes so workloads fit on a cluster without
/// node groups.
///
/// # Errors
///
/// Returns an error if nodes cannot be listed or patched.
pub async fn remove_control_plane_no_schedule_taints(client: &Client) -> Result<()> {
    let nodes: Api<Node> = Api::all(client.clone());
    let list = nodes
        .list(&ListParams::default().labels(LABEL_CONTROL_PLANE))
        .await?;

    for node in list.items {
        let Some(name) = node.metadata.name.clone() else {
            continue;
        };
        let taints = node.spec.and_then(|spec| spec.taints).unwrap_or_default();
        let kept: Vec<Taint> = taints
            .iter()
            .filter(|taint| taint.effect != "NoSchedule")
            .cloned()
            .collect();
        if kept.len() == taints.len() {
            continue;
        }

        let patch = json!({ "spec": { "taints": kept } });
        nodes
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        info!(node = %name, "Removed NoSchedule taints from master node");
    }
    Ok(())
}

/// Unpause the `Cluster` and delete it with a grace period, then wait until it is gone.
///
/// # Errors
///
/// Returns an error if the `Cluster` cannot be patched or deleted.
pub async fn delete_cluster(
    client: &Client,
    cluster: &ClusterRef,
    grace_period_secs: u32,
    poll: Duration,
) -> Result<()> {
    let clusters = namespaced(client, &cluster.namespace, &capi_cluster());

    let Some(object) = clusters.get_opt(&cluster.name).await? else {
        info!(cluster = %cluster.name, "Cluster already deleted");
        return Ok(());
    };

    let paused = object
        .data
        .pointer("/spec/paused")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);
    if paused {
        let patch = json!({ "spec": { "paused": false } });
        clusters
            .patch(&cluster.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        info!(cluster = %cluster.name, "Unpaused Cluster");
    }

    let params = DeleteParams {
        grace_period_seconds: Some(grace_period_secs),
        ..DeleteParams::default()
    };
    match clusters.delete(&cluster.name, &params).await {
        Ok(_) => info!(cluster = %cluster.name, "Deleting Cluster"),
        Err(e) if is_not_found(&e) => return Ok(()),
        Err(e) => return Err(e.into()),
    }

    loop {
        tokio::time::sleep(poll).await;
        match clusters.get_opt(&cluster.name).await {
            Ok(None) => break,
            Ok(Some(_)) => info!(cluster = %cluster.name, "Waiting for the Cluster to be deleted"),
            Err(e) => warn!(cluster = %cluster.name, error = %e, "Failed checking Cluster deletion"),
        }
    }

    info!(cluster = %cluster.name, "Deleted Cluster");
    Ok(())
}

/// `clusterctl` bound to the command runner.
#[derive(Clone)]
pub struct Clusterctl {
    runner: Arc<dyn CommandRunner>,
}

impl Clusterctl {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Move the Cluster API objects in `namespace` from one cluster to another.
    ///
    /// # Errors
    ///
    /// Returns an error if `clusterctl move` fails.
    pub async fn move_objects(&self, from: &Path, to: &Path, namespace: &str) -> Result<()> {
        let invocation = Invocation::new("clusterctl").args([
            "move".to_string(),
            "--kubeconfig".into(),
            from.display().to_string(),
            "--to-kubeconfig".into(),
            to.display().to_string(),
            "--namespace".into(),
            namespace.into(),
        ]);
        run_checked(self.runner.as_ref(), invocation).await?;
        info!(from = %from.display(), to = %to.display(), namespace = %namespace, "Moved Cluster API objects");
        Ok(())
    }

    /// `clusterctl alpha rollout restart <resource>`.
    ///
    /// # Errors
    ///
    /// Returns an error if the rollout cannot be triggered.
    pub async fn rollout_restart(&self, kubeconfig: &Path, resource: &str, namespace: &str) -> Result<()> {
        let invocation = Invocation::new("clusterctl").args([
            "alpha".to_string(),
            "rollout".into(),
            "restart".into(),
            resource.into(),
            "--kubeconfig".into(),
            kubeconfig.display().to_string(),
            "--namespace".into(),
            namespace.into(),
        ]);
        run_checked(self.runner.as_ref(), invocation).await?;
        info!(resource = %resource, "Triggered rollout");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::NodeSpec;
    use kube::api::ObjectMeta;
    use kubeaid_cloud::{CommandOutput, MockCommandRunner};

    fn cluster_object(data: serde_json::Value) -> DynamicObject {
        DynamicObject {
            types: None,
            metadata: ObjectMeta {
                name: Some("demo".into()),
                ..ObjectMeta::default()
            },
            data,
        }
    }

    #[test]
    fn test_endpoint_of_provisioned_cluster() {
        let cluster = cluster_object(serde_json::json!({"spec": {"controlPlaneEndpoint": {
            "host": "demo-apiserver-123.eu-west-1.elb.amazonaws.com",
            "port": 6443
        }}}));
        assert_eq!(
            endpoint_of(&cluster),
            Some(ApiEndpoint {
                host: "demo-apiserver-123.eu-west-1.elb.amazonaws.com".into(),
                port: 6443,
            })
        );
    }

    #[test]
    fn test_endpoint_of_unprovisioned_cluster_is_unknown() {
        let missing = cluster_object(serde_json::json!({"spec": {}}));
        let blank = cluster_object(serde_json::json!({"spec": {"controlPlaneEndpoint": {
            "host": "",
            "port": 0
        }}}));
        assert_eq!(endpoint_of(&missing), None);
        assert_eq!(endpoint_of(&blank), None);
    }

    fn node(name: &str, control_plane: bool, taints: &[&str]) -> Node {
        let labels = control_plane.then(|| [(LABEL_CONTROL_PLANE.to_string(), String::new())].into());
        Node {
            metadata: ObjectMeta {
                name: Some(name.into()),
                labels,
                ..ObjectMeta::default()
            },
            spec: Some(NodeSpec {
                taints: Some(
                    taints
                        .iter()
                        .map(|key| Taint {
                            key: (*key).to_string(),
                            effect: "NoSchedule".into(),
                            ..Taint::default()
                        })
                        .collect(),
                ),
                ..NodeSpec::default()
            }),
            ..Node::default()
        }
    }

    #[test]
    fn test_only_initialized_workers_count() {
        let nodes = vec![
            node("master-0", true, &[]),
            node("worker-0", false, &[TAINT_CLOUD_PROVIDER_UNINITIALIZED]),
            node("worker-1", false, &[TAINT_CAPI_NODE_UNINITIALIZED]),
        ];
        assert_eq!(initialized_workers(&nodes), 0);

        let nodes = vec![
            node("master-0", true, &[]),
            node("worker-0", false, &["dedicated"]),
        ];
        assert_eq!(initialized_workers(&nodes), 1);
    }

    #[test]
    fn test_provisioned_needs_phase_and_ready() {
        let mut cluster = DynamicObject::new("kubeaid-demo", &capi_cluster());
        cluster.data = json!({
            "status": {
                "phase": "Provisioning",
                "conditions": [{ "type": "Ready", "status": "True" }]
            }
        });
        assert!(!is_provisioned(&cluster));

        cluster.data = json!({
            "status": {
                "phase": "Provisioned",
                "conditions": [{ "type": "Ready", "status": "False" }]
            }
        });
        assert!(!is_provisioned(&cluster));

        cluster.data = json!({
            "status": {
                "phase": "Provisioned",
                "conditions": [{ "type": "Ready", "status": "True" }]
            }
        });
        assert!(is_provisioned(&cluster));
    }

    #[tokio::test]
    async fn test_marker_short_circuits_main_cluster_query() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = ClusterRef::new("kubeaid-demo", "capi-cluster");
        let main = dir.path().join("main.yaml");

        assert!(!is_clusterctl_move_executed(dir.path(), &main, &cluster).await);

        crate::state::write_pivot_marker(dir.path(), "kubeaid-demo").unwrap();
        assert!(is_clusterctl_move_executed(dir.path(), &main, &cluster).await);
    }

    #[tokio::test]
    async fn test_move_targets_capi_namespace() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|i| {
                i.program == "clusterctl"
                    && i.args[0] == "move"
                    && i.args.windows(2).any(|w| w[0] == "--namespace" && w[1] == "capi-cluster-acme")
                    && i.args.windows(2).any(|w| w[0] == "--to-kubeconfig" && w[1] == "main.yaml")
            })
            .times(1)
            .returning(|_| {
                Ok(CommandOutput {
                    status: 0,
                    stdout: String::new(),
                    stderr: String::new(),
                })
            });

        Clusterctl::new(Arc::new(runner))
            .move_objects(Path::new("host.yaml"), Path::new("main.yaml"), "capi-cluster-acme")
            .await
            .unwrap();
    }
}
