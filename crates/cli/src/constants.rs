//! Names, paths and defaults shared across workflows.

use std::time::Duration;

/// Where remote repositories are cloned.
pub const TEMP_DIRECTORY: &str = "/tmp/kubeaid-core";

// ============================================================================
// Environment variables
// ============================================================================

pub const ENV_SSH_AUTH_SOCK: &str = "SSH_AUTH_SOCK";
pub const ENV_AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
pub const ENV_AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
pub const ENV_AWS_SESSION_TOKEN: &str = "AWS_SESSION_TOKEN";
pub const ENV_AWS_PROFILE: &str = "AWS_PROFILE";
pub const ENV_KUBECONFIG: &str = "KUBECONFIG";

// ============================================================================
// CLI defaults
// ============================================================================

pub const DEFAULT_MANAGEMENT_CLUSTER_NAME: &str = "kubeaid-bootstrapper";
pub const DEFAULT_CONFIGS_DIRECTORY: &str = "outputs/configs";

// ============================================================================
// Outputs
// ============================================================================

pub const OUTPUTS_DIRECTORY: &str = "outputs";
pub const OUTPUT_LOG_FILE: &str = ".log";
pub const OUTPUT_K3D_CONFIG: &str = "k3d.config.yaml";
pub const OUTPUT_MANAGEMENT_HOST_KUBECONFIG: &str = "kubeconfigs/clusters/management/host.yaml";
pub const OUTPUT_MANAGEMENT_CONTAINER_KUBECONFIG: &str =
    "kubeconfigs/clusters/management/container.yaml";
pub const OUTPUT_MAIN_KUBECONFIG: &str = "kubeconfigs/clusters/main.yaml";
pub const OUTPUT_JWKS_DOCUMENT: &str = "workload-identity/openid-provider/jwks.json";
pub const OUTPUT_BOOTSTRAP_STATE: &str = "bootstrap-state.json";
pub const OUTPUT_CLUSTERCTL_MOVE_MARKER: &str = "clusterctl-move.done";
pub const OUTPUT_SEALED_SECRETS_KEYS: &str = "sealed-secrets-keys";

// ============================================================================
// ArgoCD
// ============================================================================

pub const RELEASE_NAME_ARGOCD: &str = "argocd";
pub const ARGOCD_PROJECT_KUBEAID: &str = "kubeaid";
pub const ARGOCD_ROLE_KUBEAID_AGENT: &str = "kubeaid-agent";
pub const ARGOCD_PROJECT_ROLE_SECRET: &str = "argocd-project-role-kubeaid-agent";
pub const ARGOCD_LABEL_MANAGED_BY: &str = "kubeaid.io/managed-by";
pub const ARGOCD_INITIAL_ADMIN_SECRET: &str = "argocd-initial-admin-secret";
pub const ARGOCD_SERVER_SELECTOR: &str = "app.kubernetes.io/name=argocd-server";
pub const ARGOCD_SERVER_PORT: u16 = 8080;

pub const APP_ROOT: &str = "root";
pub const APP_CERT_MANAGER: &str = "cert-manager";
pub const APP_SEALED_SECRETS: &str = "sealed-secrets";
pub const APP_SECRETS: &str = "secrets";
pub const APP_CLUSTER_API: &str = "cluster-api";
pub const APP_CAPI_CLUSTER: &str = "capi-cluster";
pub const APP_CLUSTER_AUTOSCALER: &str = "cluster-autoscaler";
pub const APP_VELERO: &str = "velero";
pub const APP_KUBE2IAM: &str = "kube2iam";
pub const APP_K8S_CONFIGS: &str = "k8s-configs";
pub const APP_KUBE_PROMETHEUS: &str = "kube-prometheus";
pub const APP_EXTERNAL_SNAPSHOTTER: &str = "external-snapshotter";
pub const APP_INFRASTRUCTURE: &str = "infrastructure";
pub const APPS_CROSSPLANE: [&str; 3] = [
    "crossplane",
    "crossplane-providers-and-functions",
    "crossplane-compositions",
];

/// URL of the AppProject CRD installed ahead of the argo-cd chart.
pub const ARGOCD_APPPROJECT_CRD_URL: &str =
    "https://raw.githubusercontent.com/argoproj/argo-cd/refs/heads/master/manifests/crds/appproject-crd.yaml";

// ============================================================================
// Sealed secrets
// ============================================================================

pub const RELEASE_NAME_SEALED_SECRETS: &str = "sealed-secrets";
pub const SEALED_SECRETS_CONTROLLER: &str = "sealed-secrets-controller";
pub const CRONJOB_BACKUP_SEALED_SECRETS: &str = "backup-sealed-secrets";

// ============================================================================
// Azure
// ============================================================================

pub const BLOB_CONTAINER_OIDC_PROVIDER: &str = "oidc-provider";
pub const BLOB_OPENID_CONFIGURATION: &str = ".well-known/openid-configuration";
pub const BLOB_JWKS_DOCUMENT: &str = "openid/v1/jwks";
pub const UAMI_CAPI: &str = "capi";
pub const UAMI_VELERO: &str = "velero";

// ============================================================================
// Hetzner
// ============================================================================

/// Subnet the VSwitch occupies inside the CAPI created HCloud network.
pub const HETZNER_VSWITCH_SUBNET_CIDR: &str = "10.0.1.0/24";
pub const HETZNER_VSWITCH_GATEWAY_IP: &str = "10.0.1.1";

// ============================================================================
// Namespaces and service accounts
// ============================================================================

pub const NAMESPACE_ARGOCD: &str = "argocd";
pub const NAMESPACE_VELERO: &str = "velero";
pub const NAMESPACE_SEALED_SECRETS: &str = "sealed-secrets";
pub const NAMESPACE_CROSSPLANE: &str = "crossplane";
pub const NAMESPACE_OBMONDO: &str = "obmondo";
pub const NAMESPACE_CILIUM: &str = "cilium";
pub const NAMESPACE_CILIUM_TEST: &str = "cilium-test";

pub const SERVICE_ACCOUNT_CAPZ: &str = "capz-manager";
pub const SERVICE_ACCOUNT_ASO: &str = "azureserviceoperator-default";
pub const SERVICE_ACCOUNT_VELERO: &str = "velero";

// ============================================================================
// Cluster API
// ============================================================================

pub const LABEL_CONTROL_PLANE: &str = "node-role.kubernetes.io/control-plane";
pub const LABEL_CAPI_CONTROL_PLANE: &str = "cluster.x-k8s.io/control-plane";
pub const TAINT_CLOUD_PROVIDER_UNINITIALIZED: &str = "node.cloudprovider.kubernetes.io/uninitialized";
pub const TAINT_CAPI_NODE_UNINITIALIZED: &str = "node.cluster.x-k8s.io/uninitialized";
pub const ANNOTATION_HETZNER_BARE_METAL_HOST: &str =
    "infrastructure.cluster.x-k8s.io/HetznerBareMetalHost";

// ============================================================================
// Git
// ============================================================================

pub const GIT_AUTHOR_NAME: &str = "KubeAid Bootstrap Script";
pub const GIT_AUTHOR_EMAIL: &str = "info@obmondo.com";

// ============================================================================
// Misc
// ============================================================================

pub const REPO_URL_OBMONDO_KUBEAID: &str = "https://github.com/Obmondo/KubeAid";
pub const KUBEAID_LATEST_RELEASE_URL: &str =
    "https://api.github.com/repos/Obmondo/KubeAid/releases/latest";
pub const K8S_STABLE_VERSION_URL: &str = "https://cdn.dl.k8s.io/release/stable.txt";
pub const MIN_K8S_VERSION: &str = "v1.30.0";
pub const GZIP_SUFFIX: &str = ".gz";

// ============================================================================
// Timing
// ============================================================================

pub const ARGOCD_IN_PROGRESS_RETRY: Duration = Duration::from_secs(10);
pub const ARGOCD_ROOT_SETTLE: Duration = Duration::from_secs(10);
pub const ARGOCD_SYNC_POLL: Duration = Duration::from_secs(15);
pub const CAPI_POLL: Duration = Duration::from_secs(60);
pub const KUBECONFIG_SECRET_POLL: Duration = Duration::from_secs(2);
pub const MACHINE_TEMPLATE_DELETE_POLL: Duration = Duration::from_secs(2);
pub const MACHINE_TEMPLATE_DELETE_TIMEOUT: Duration = Duration::from_secs(300);
pub const GIT_MERGE_POLL: Duration = Duration::from_secs(10);
pub const CLUSTER_DELETE_POLL: Duration = Duration::from_secs(120);
pub const CLUSTER_DELETE_GRACE_SECS: u32 = 600;
pub const HELM_TIMEOUT: &str = "10m";
pub const CROSSPLANE_POLL: Duration = Duration::from_secs(20);
pub const HETZNER_POLL: Duration = Duration::from_secs(5);
