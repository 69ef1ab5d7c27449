//! Schema of the general config document (`general.yaml`).

use std::collections::BTreeMap;
use std::path::PathBuf;

use k8s_openapi::api::core::v1::Taint;
use serde::{Deserialize, Serialize};

use crate::constants::REPO_URL_OBMONDO_KUBEAID;

// ============================================================================
// Defaults
// ============================================================================

fn default_true() -> bool {
    true
}

fn default_ssh_username() -> String {
    "git".to_string()
}

fn default_kubeaid_url() -> String {
    REPO_URL_OBMONDO_KUBEAID.to_string()
}

fn default_kube_prometheus_version() -> String {
    "v0.15.0".to_string()
}

fn default_load_balancer_scheme() -> String {
    "internet-facing".to_string()
}

fn default_load_balancer_type() -> String {
    "Public".to_string()
}

fn default_hcloud_image() -> String {
    "ubuntu-24.04".to_string()
}

fn default_install_image_path() -> String {
    "/root/.oldroot/nfs/images/Ubuntu-2404-noble-amd64-base.tar.gz".to_string()
}

fn default_vg0_size() -> String {
    "25G".to_string()
}

fn default_vg0_root_volume_size() -> String {
    "10G".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_api_server_port() -> u16 {
    6443
}

// ============================================================================
// Root
// ============================================================================

/// The non-secret half of the cluster definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneralConfig {
    #[serde(default)]
    pub git: GitConfig,

    #[serde(rename = "forkURLs")]
    pub forks: ForksConfig,

    pub cluster: ClusterConfig,

    pub cloud: CloudConfig,

    #[serde(default)]
    pub kube_prometheus: KubePrometheusConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obmondo: Option<ObmondoConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitConfig {
    /// Custom CA bundle for the git server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle_path: Option<PathBuf>,

    #[serde(skip)]
    pub ca_bundle: Option<String>,

    #[serde(default = "default_ssh_username")]
    pub ssh_username: String,

    /// SSH private key used for git operations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_file_path: Option<PathBuf>,

    #[serde(skip)]
    pub private_key: Option<String>,

    #[serde(default, rename = "useSSHAgent")]
    pub use_ssh_agent: bool,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            ca_bundle_path: None,
            ca_bundle: None,
            ssh_username: default_ssh_username(),
            private_key_file_path: None,
            private_key: None,
            use_ssh_agent: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForksConfig {
    #[serde(default)]
    pub kubeaid: KubeAidForkConfig,
    pub kubeaid_config: KubeAidConfigForkConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KubeAidForkConfig {
    #[serde(default = "default_kubeaid_url")]
    pub url: String,

    /// KubeAid tag. Blank means the latest release.
    #[serde(default)]
    pub version: String,
}

impl Default for KubeAidForkConfig {
    fn default() -> Self {
        Self {
            url: default_kubeaid_url(),
            version: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KubeAidConfigForkConfig {
    pub url: String,

    /// Directory under `k8s/` holding the cluster. Defaults to the cluster name.
    #[serde(default)]
    pub directory: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    pub name: String,

    pub k8s_version: String,

    #[serde(default = "default_true")]
    pub enable_audit_logging: bool,

    #[serde(default)]
    pub api_server: ApiServerConfig,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_users: Vec<UserConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiServerConfig {
    #[serde(default)]
    pub extra_args: BTreeMap<String, String>,

    #[serde(default)]
    pub extra_volumes: Vec<HostPathMount>,

    #[serde(default)]
    pub files: Vec<FileConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostPathMount {
    pub name: String,
    pub host_path: String,
    pub mount_path: String,
    pub path_type: String,

    #[serde(default = "default_true")]
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileConfig {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserConfig {
    pub name: String,
    pub ssh_public_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubePrometheusConfig {
    #[serde(default = "default_kube_prometheus_version")]
    pub version: String,

    #[serde(default, rename = "grafanaURL", skip_serializing_if = "Option::is_none")]
    pub grafana_url: Option<String>,
}

impl Default for KubePrometheusConfig {
    fn default() -> Self {
        Self {
            version: default_kube_prometheus_version(),
            grafana_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObmondoConfig {
    #[serde(rename = "customerID")]
    pub customer_id: String,

    #[serde(default)]
    pub monitoring: bool,
}

// ============================================================================
// Node groups
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeGroup {
    pub name: String,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub taints: Vec<Taint>,
}

/// A node group the cluster autoscaler may resize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoScalableNodeGroup {
    #[serde(flatten)]
    pub node_group: NodeGroup,

    pub min_size: u32,
    pub max_size: u32,

    /// Hydrated from the cloud API, for scale-from-zero.
    #[serde(default, skip_deserializing)]
    pub cpu: u32,

    /// Hydrated from the cloud API, in GiB.
    #[serde(default, skip_deserializing)]
    pub memory: u32,
}

// ============================================================================
// Cloud
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws: Option<AwsConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzureConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hetzner: Option<HetznerConfig>,

    #[serde(default, rename = "bare-metal", skip_serializing_if = "Option::is_none")]
    pub bare_metal: Option<BareMetalConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disaster_recovery: Option<DisasterRecoveryConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisasterRecoveryConfig {
    pub velero_backups_bucket_name: String,
    pub sealed_secrets_backups_bucket_name: String,
}

/// Paths of an SSH key pair and, once hydrated, the keys themselves.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshKeyPairConfig {
    pub private_key_file_path: PathBuf,
    pub public_key_file_path: PathBuf,

    #[serde(skip)]
    pub private_key: String,

    #[serde(skip)]
    pub public_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshPrivateKeyConfig {
    pub private_key_file_path: PathBuf,

    #[serde(skip)]
    pub private_key: String,
}

// ---------------------------------------------------------------------------- AWS

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsConfig {
    pub region: String,

    pub ssh_key_name: String,

    #[serde(default, rename = "vpcID", skip_serializing_if = "Option::is_none")]
    pub vpc_id: Option<String>,

    #[serde(default = "default_true")]
    pub bastion_enabled: bool,

    pub control_plane: AwsControlPlane,

    #[serde(default)]
    pub node_groups: Vec<AwsNodeGroup>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsControlPlane {
    #[serde(default = "default_load_balancer_scheme")]
    pub load_balancer_scheme: String,
    pub replicas: u32,
    pub instance_type: String,
    pub ami: AmiConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsNodeGroup {
    #[serde(flatten)]
    pub autoscaling: AutoScalableNodeGroup,

    pub ami: AmiConfig,
    pub instance_type: String,
    pub root_volume_size: u32,
    pub ssh_key_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmiConfig {
    pub id: String,
}

// ---------------------------------------------------------------------------- Azure

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureConfig {
    #[serde(rename = "tenantID")]
    pub tenant_id: String,

    #[serde(rename = "subscriptionID")]
    pub subscription_id: String,

    pub aad_application: AadApplication,

    pub location: String,

    pub storage_account: String,

    pub workload_identity: WorkloadIdentity,

    pub ssh_public_key: String,

    pub canonical_ubuntu_image: CanonicalUbuntuImage,

    /// Provision identities and backup storage through Crossplane claims.
    #[serde(default)]
    pub use_crossplane: bool,

    pub control_plane: AzureControlPlane,

    #[serde(default)]
    pub node_groups: Vec<AzureNodeGroup>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AadApplication {
    #[serde(rename = "principalID")]
    pub principal_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadIdentity {
    #[serde(rename = "openIDProviderSSHKeyPair")]
    pub openid_provider_ssh_key_pair: SshKeyPairConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalUbuntuImage {
    pub offer: String,
    pub sku: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureControlPlane {
    #[serde(default = "default_load_balancer_type")]
    pub load_balancer_type: String,

    #[serde(rename = "diskSizeGB")]
    pub disk_size_gb: u32,

    pub vm_size: String,

    pub replicas: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureNodeGroup {
    #[serde(flatten)]
    pub autoscaling: AutoScalableNodeGroup,

    pub vm_size: String,

    #[serde(rename = "diskSizeGB")]
    pub disk_size_gb: u32,
}

// ---------------------------------------------------------------------------- Hetzner

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HetznerMode {
    /// Everything in HCloud.
    #[default]
    Hcloud,
    /// Everything on Hetzner dedicated servers.
    BareMetal,
    /// Control plane in HCloud, node groups in HCloud and on dedicated servers.
    Hybrid,
}

impl HetznerMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hcloud => "hcloud",
            Self::BareMetal => "bare-metal",
            Self::Hybrid => "hybrid",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HetznerConfig {
    #[serde(default)]
    pub mode: HetznerMode,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vswitch: Option<VSwitchConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hcloud: Option<HetznerHCloudConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bare_metal: Option<HetznerBareMetalConfig>,

    pub control_plane: HetznerControlPlane,

    #[serde(default)]
    pub node_groups: HetznerNodeGroups,
}

impl HetznerConfig {
    #[must_use]
    pub fn using_hcloud(&self) -> bool {
        matches!(self.mode, HetznerMode::Hcloud | HetznerMode::Hybrid)
    }

    #[must_use]
    pub fn using_bare_metal(&self) -> bool {
        matches!(self.mode, HetznerMode::BareMetal | HetznerMode::Hybrid)
    }

    #[must_use]
    pub fn control_plane_in_hcloud(&self) -> bool {
        self.using_hcloud()
    }

    #[must_use]
    pub fn control_plane_in_bare_metal(&self) -> bool {
        self.mode == HetznerMode::BareMetal
    }

    /// The control plane sits behind a Robot failover IP.
    #[must_use]
    pub fn control_plane_failover_ip(&self) -> Option<&str> {
        self.control_plane
            .bare_metal
            .as_ref()
            .filter(|cp| self.control_plane_in_bare_metal() && cp.endpoint.is_failover_ip)
            .map(|cp| cp.endpoint.host.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VSwitchConfig {
    #[serde(rename = "vlanID")]
    pub vlan_id: u32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HetznerHCloudConfig {
    pub zone: String,

    #[serde(default = "default_hcloud_image")]
    pub image_name: String,

    pub ssh_key_pair_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HetznerBareMetalConfig {
    #[serde(default)]
    pub wipe_disks: bool,

    #[serde(default)]
    pub install_image: InstallImageConfig,

    pub ssh_key_pair: HetznerBareMetalSshKeyPair,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_layout_setup_commands: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ceph: Option<CephConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallImageConfig {
    #[serde(default = "default_install_image_path")]
    pub image_path: String,

    #[serde(default)]
    pub vg0: Vg0Config,
}

impl Default for InstallImageConfig {
    fn default() -> Self {
        Self {
            image_path: default_install_image_path(),
            vg0: Vg0Config::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vg0Config {
    #[serde(default = "default_vg0_size")]
    pub size: String,

    #[serde(default = "default_vg0_root_volume_size")]
    pub root_volume_size: String,
}

impl Default for Vg0Config {
    fn default() -> Self {
        Self {
            size: default_vg0_size(),
            root_volume_size: default_vg0_root_volume_size(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HetznerBareMetalSshKeyPair {
    pub name: String,

    #[serde(flatten)]
    pub key_pair: SshKeyPairConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CephConfig {
    pub device_filter: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HetznerControlPlane {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hcloud: Option<HCloudControlPlane>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bare_metal: Option<HetznerBareMetalControlPlane>,

    pub regions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HCloudControlPlane {
    pub machine_type: String,
    pub replicas: u32,
    pub load_balancer: HCloudLoadBalancer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HCloudLoadBalancer {
    pub enabled: bool,
    pub region: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HetznerBareMetalControlPlane {
    pub endpoint: HetznerBareMetalEndpoint,

    pub bare_metal_hosts: Vec<HetznerBareMetalHost>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_layout_setup_commands: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HetznerBareMetalEndpoint {
    #[serde(default, rename = "isFailoverIP")]
    pub is_failover_ip: bool,
    pub host: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HetznerNodeGroups {
    #[serde(default)]
    pub hcloud: Vec<HCloudNodeGroup>,

    #[serde(default)]
    pub bare_metal: Vec<HetznerBareMetalNodeGroup>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HCloudNodeGroup {
    #[serde(flatten)]
    pub autoscaling: AutoScalableNodeGroup,

    pub machine_type: String,

    /// Hydrated from the HCloud server type.
    #[serde(default, skip_deserializing)]
    pub root_volume_size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HetznerBareMetalNodeGroup {
    #[serde(flatten)]
    pub node_group: NodeGroup,

    pub bare_metal_hosts: Vec<HetznerBareMetalHost>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_layout_setup_commands: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HetznerBareMetalHost {
    #[serde(rename = "serverID")]
    pub server_id: String,
    pub wwns: Vec<String>,
}

// ---------------------------------------------------------------------------- Bare metal

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BareMetalConfig {
    #[serde(default)]
    pub ssh: BareMetalSshConfig,

    pub control_plane: BareMetalControlPlane,

    #[serde(default)]
    pub node_groups: Vec<BareMetalNodeGroup>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BareMetalSshConfig {
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<SshPrivateKeyConfig>,
}

impl Default for BareMetalSshConfig {
    fn default() -> Self {
        Self {
            port: default_ssh_port(),
            private_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BareMetalControlPlane {
    pub endpoint: BareMetalEndpoint,
    pub hosts: Vec<BareMetalHost>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BareMetalEndpoint {
    pub host: String,

    #[serde(default = "default_api_server_port")]
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BareMetalNodeGroup {
    #[serde(flatten)]
    pub node_group: NodeGroup,

    pub hosts: Vec<BareMetalHost>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BareMetalHost {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh: Option<BareMetalSshConfig>,
}

impl BareMetalHost {
    /// Address used to reach the host; the private one wins.
    #[must_use]
    pub fn address(&self) -> Option<&str> {
        self.private_address
            .as_deref()
            .or(self.public_address.as_deref())
    }
}

// ---------------------------------------------------------------------------- Local

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalConfig {}
