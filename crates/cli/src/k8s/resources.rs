//! Custom resources the workflows read and mutate through [`DynamicObject`].

use kube::api::{Api, DynamicObject};
use kube::discovery::ApiResource;
use kube::Client;

fn api_resource(group: &str, version: &str, kind: &str, plural: &str) -> ApiResource {
    let api_version = if group.is_empty() {
        version.to_string()
    } else {
        format!("{group}/{version}")
    };
    ApiResource {
        group: group.to_string(),
        version: version.to_string(),
        api_version,
        kind: kind.to_string(),
        plural: plural.to_string(),
    }
}

// ============================================================================
// Cluster API
// ============================================================================

#[must_use]
pub fn capi_cluster() -> ApiResource {
    api_resource("cluster.x-k8s.io", "v1beta1", "Cluster", "clusters")
}

#[must_use]
pub fn machine_deployment() -> ApiResource {
    api_resource(
        "cluster.x-k8s.io",
        "v1beta1",
        "MachineDeployment",
        "machinedeployments",
    )
}

#[must_use]
pub fn kubeadm_control_plane() -> ApiResource {
    api_resource(
        "controlplane.cluster.x-k8s.io",
        "v1beta1",
        "KubeadmControlPlane",
        "kubeadmcontrolplanes",
    )
}

/// Infrastructure provider resources, keyed by the `kind` a `*Ref` names.
///
/// Returns `None` for kinds the upgrade workflow does not know how to mutate.
#[must_use]
pub fn machine_template(kind: &str) -> Option<ApiResource> {
    let (group, version, plural) = match kind {
        "AWSMachineTemplate" => (
            "infrastructure.cluster.x-k8s.io",
            "v1beta2",
            "awsmachinetemplates",
        ),
        "AzureMachineTemplate" => (
            "infrastructure.cluster.x-k8s.io",
            "v1beta1",
            "azuremachinetemplates",
        ),
        "HCloudMachineTemplate" => (
            "infrastructure.cluster.x-k8s.io",
            "v1beta1",
            "hcloudmachinetemplates",
        ),
        "HetznerBareMetalMachineTemplate" => (
            "infrastructure.cluster.x-k8s.io",
            "v1beta1",
            "hetznerbaremetalmachinetemplates",
        ),
        _ => return None,
    };
    Some(api_resource(group, version, kind, plural))
}

#[must_use]
pub fn hetzner_cluster() -> ApiResource {
    api_resource(
        "infrastructure.cluster.x-k8s.io",
        "v1beta1",
        "HetznerCluster",
        "hetznerclusters",
    )
}

#[must_use]
pub fn hetzner_bare_metal_host() -> ApiResource {
    api_resource(
        "infrastructure.cluster.x-k8s.io",
        "v1beta1",
        "HetznerBareMetalHost",
        "hetznerbaremetalhosts",
    )
}

#[must_use]
pub fn hetzner_bare_metal_machine() -> ApiResource {
    api_resource(
        "infrastructure.cluster.x-k8s.io",
        "v1beta1",
        "HetznerBareMetalMachine",
        "hetznerbaremetalmachines",
    )
}

// ============================================================================
// Velero
// ============================================================================

#[must_use]
pub fn velero_backup() -> ApiResource {
    api_resource("velero.io", "v1", "Backup", "backups")
}

#[must_use]
pub fn velero_restore() -> ApiResource {
    api_resource("velero.io", "v1", "Restore", "restores")
}

// ============================================================================
// Crossplane claims
// ============================================================================

#[must_use]
pub fn workload_identity_infrastructure() -> ApiResource {
    api_resource(
        "azure.kubeaid.org",
        "v1alpha1",
        "WorkloadIdentityInfrastructure",
        "workloadidentityinfrastructures",
    )
}

#[must_use]
pub fn disaster_recovery_infrastructure() -> ApiResource {
    api_resource(
        "azure.kubeaid.org",
        "v1alpha1",
        "DisasterRecoveryInfrastructure",
        "disasterrecoveryinfrastructures",
    )
}

// ============================================================================
// Helpers
// ============================================================================

/// Namespaced dynamic API for `resource`.
#[must_use]
pub fn namespaced(client: &Client, namespace: &str, resource: &ApiResource) -> Api<DynamicObject> {
    Api::namespaced_with(client.clone(), namespace, resource)
}

/// The `status.conditions[type=<kind>].status == "True"` check CAPI and Crossplane share.
#[must_use]
pub fn condition_is_true(object: &DynamicObject, kind: &str) -> bool {
    object
        .data
        .pointer("/status/conditions")
        .and_then(|conditions| conditions.as_array())
        .is_some_and(|conditions| {
            conditions.iter().any(|condition| {
                condition.get("type").and_then(|t| t.as_str()) == Some(kind)
                    && condition.get("status").and_then(|s| s.as_str()) == Some("True")
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_api_versions() {
        assert_eq!(capi_cluster().api_version, "cluster.x-k8s.io/v1beta1");
        assert_eq!(velero_backup().api_version, "velero.io/v1");
        assert_eq!(
            machine_template("AWSMachineTemplate").unwrap().api_version,
            "infrastructure.cluster.x-k8s.io/v1beta2"
        );
        assert!(machine_template("DockerMachineTemplate").is_none());
    }

    #[test]
    fn test_condition_is_true() {
        let mut object = DynamicObject::new("foo", &capi_cluster());
        object.data = json!({
            "status": {
                "phase": "Provisioned",
                "conditions": [
                    { "type": "ControlPlaneReady", "status": "False" },
                    { "type": "Ready", "status": "True" }
                ]
            }
        });
        assert!(condition_is_true(&object, "Ready"));
        assert!(!condition_is_true(&object, "ControlPlaneReady"));
        assert!(!condition_is_true(&object, "InfrastructureReady"));
    }
}
