//! Validation of the parsed, hydrated configuration.

use std::fmt;
use std::net::IpAddr;
use std::sync::LazyLock;

use k8s_openapi::api::core::v1::Taint;
use regex::Regex;
use tracing::info;

use super::model::{AutoScalableNodeGroup, BareMetalHost, GeneralConfig, NodeGroup};
use super::secrets::SecretsConfig;
use super::ssh::validate_public_key;
use super::CloudKind;
use crate::constants::MIN_K8S_VERSION;
use crate::error::{Error, Result};

/// Label key domains Cluster API propagates from Machines to Nodes.
pub const NODE_GROUP_LABEL_DOMAINS: [&str; 3] = [
    "node.cluster.x-k8s.io/",
    "node-role.kubernetes.io/",
    "node-restriction.kubernetes.io/",
];

const TAINT_EFFECTS: [&str; 3] = ["NoSchedule", "PreferNoSchedule", "NoExecute"];

static QUALIFIED_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9]$").unwrap_or_else(|_| unreachable!())
});

static DNS_SUBDOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .unwrap_or_else(|_| unreachable!())
});

// ============================================================================
// Kubernetes versions
// ============================================================================

/// A `vMAJOR.MINOR.PATCH` Kubernetes release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct K8sVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl K8sVersion {
    /// Parse `v1.31.2` (the leading `v` is optional, build metadata and pre-release suffixes
    /// are ignored).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the string is not a semantic version.
    pub fn parse(version: &str) -> Result<Self> {
        let invalid = || Error::config(format!("{version:?} is not a semantic version"));

        let trimmed = version.trim();
        let core = trimmed.strip_prefix('v').unwrap_or(trimmed);
        let core = core.split(['-', '+']).next().unwrap_or_default();

        let mut parts = core.split('.').map(str::parse::<u32>);
        let (Some(Ok(major)), Some(Ok(minor)), Some(Ok(patch)), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };

        Ok(Self {
            major,
            minor,
            patch,
        })
    }
}

impl fmt::Display for K8sVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Check `version` lies within [`MIN_K8S_VERSION`, `latest_stable`].
///
/// # Errors
///
/// Returns [`Error::Config`] when out of range or unparsable.
pub fn validate_k8s_version(version: &str, latest_stable: K8sVersion) -> Result<()> {
    let parsed = K8sVersion::parse(version)?;
    let least_supported = K8sVersion::parse(MIN_K8S_VERSION)?;

    if parsed < least_supported {
        return Err(Error::config(format!(
            "Kubernetes {parsed} is not supported, the minimum is {least_supported}"
        )));
    }
    if parsed > latest_stable {
        return Err(Error::config(format!(
            "Kubernetes {parsed} is newer than the latest stable release {latest_stable}"
        )));
    }
    Ok(())
}

// ============================================================================
// Labels and taints
// ============================================================================

fn validate_qualified_name(key: &str) -> std::result::Result<(), String> {
    let (prefix, name) = match key.rsplit_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };

    if let Some(prefix) = prefix {
        if prefix.is_empty() || prefix.len() > 253 || !DNS_SUBDOMAIN.is_match(prefix) {
            return Err(format!("prefix of {key:?} must be a DNS subdomain"));
        }
    }
    if name.is_empty() || name.len() > 63 || !QUALIFIED_NAME.is_match(name) {
        return Err(format!("{key:?} is not a valid qualified name"));
    }
    Ok(())
}

fn validate_label_value(value: &str) -> std::result::Result<(), String> {
    if value.is_empty() {
        return Ok(());
    }
    if value.len() > 63 || !QUALIFIED_NAME.is_match(value) {
        return Err(format!("{value:?} is not a valid label value"));
    }
    Ok(())
}

/// Validate node group labels and taints, against the Kubernetes syntax and the Cluster API
/// propagation domains.
///
/// # Errors
///
/// Returns [`Error::Config`] naming the node group and the offending key.
pub fn validate_node_group(node_group: &NodeGroup) -> Result<()> {
    let fail = |reason: String| {
        Error::config(format!("node group {}: {reason}", node_group.name))
    };

    if node_group.name.trim().is_empty() {
        return Err(Error::config("node group name must not be blank"));
    }

    for (key, value) in &node_group.labels {
        validate_qualified_name(key).map_err(fail)?;
        validate_label_value(value).map_err(fail)?;

        if !NODE_GROUP_LABEL_DOMAINS
            .iter()
            .any(|domain| key.starts_with(domain))
        {
            return Err(fail(format!(
                "label key {key:?} must belong to one of the domains {NODE_GROUP_LABEL_DOMAINS:?}"
            )));
        }
    }

    for taint in &node_group.taints {
        validate_taint(taint).map_err(fail)?;
    }
    Ok(())
}

fn validate_taint(taint: &Taint) -> std::result::Result<(), String> {
    validate_qualified_name(&taint.key)?;
    if let Some(value) = &taint.value {
        validate_label_value(value)?;
    }
    if !TAINT_EFFECTS.contains(&taint.effect.as_str()) {
        return Err(format!(
            "taint {:?} has effect {:?}, expected one of {TAINT_EFFECTS:?}",
            taint.key, taint.effect
        ));
    }
    Ok(())
}

/// # Errors
///
/// Returns [`Error::Config`] when labels, taints or sizes are invalid.
pub fn validate_autoscalable_node_group(node_group: &AutoScalableNodeGroup) -> Result<()> {
    validate_node_group(&node_group.node_group)?;

    if node_group.min_size > node_group.max_size {
        return Err(Error::config(format!(
            "node group {}: minSize ({}) must be <= maxSize ({})",
            node_group.node_group.name, node_group.min_size, node_group.max_size
        )));
    }
    Ok(())
}

// ============================================================================
// Whole config
// ============================================================================

fn require(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::config(format!("{field} must not be blank")));
    }
    Ok(())
}

fn require_some<'a, T>(value: Option<&'a T>, what: &str) -> Result<&'a T> {
    value.ok_or_else(|| Error::config(format!("{what} not provided")))
}

/// Validate the general and secrets documents after defaults and hydration.
///
/// # Errors
///
/// Returns the first [`Error::Config`] found.
pub fn validate(
    general: &GeneralConfig,
    secrets: &SecretsConfig,
    cloud: CloudKind,
    latest_stable: K8sVersion,
) -> Result<()> {
    let cluster = &general.cluster;

    require(&cluster.name, "cluster.name")?;
    if cluster.name.contains('.') {
        return Err(Error::config(
            "cluster name cannot contain dots, maybe use hyphens instead",
        ));
    }
    if cluster.name != cluster.name.to_lowercase() {
        return Err(Error::config("cluster name must be lowercase"));
    }

    require(&general.forks.kubeaid.url, "forkURLs.kubeaid.url")?;
    require(&general.forks.kubeaid_config.url, "forkURLs.kubeaidConfig.url")?;
    require(&general.git.ssh_username, "git.sshUsername")?;

    if let Some(obmondo) = &general.obmondo {
        require(&obmondo.customer_id, "obmondo.customerID")?;
    }

    if let Some(dr) = &general.cloud.disaster_recovery {
        require(
            &dr.velero_backups_bucket_name,
            "cloud.disasterRecovery.veleroBackupsBucketName",
        )?;
        require(
            &dr.sealed_secrets_backups_bucket_name,
            "cloud.disasterRecovery.sealedSecretsBackupsBucketName",
        )?;
    }

    validate_k8s_version(&cluster.k8s_version, latest_stable)?;

    for user in &cluster.additional_users {
        if user.name == "ubuntu" {
            return Err(Error::config("additional user name cannot be ubuntu"));
        }
        validate_public_key(&user.ssh_public_key, &format!("of additional user {}", user.name))?;
    }

    match cloud {
        CloudKind::Aws => validate_aws(general, secrets),
        CloudKind::Azure => validate_azure(general, secrets),
        CloudKind::Hetzner => validate_hetzner(general, secrets),
        CloudKind::BareMetal => validate_bare_metal(general),
        CloudKind::Local => Ok(()),
    }?;

    info!(cluster = %cluster.name, cloud = %cloud, "Config validated");
    Ok(())
}

fn validate_aws(general: &GeneralConfig, secrets: &SecretsConfig) -> Result<()> {
    let credentials = require_some(secrets.aws.as_ref(), "AWS credentials")?;
    require(&credentials.access_key_id, "aws.accessKeyID")?;
    require(&credentials.secret_access_key, "aws.secretAccessKey")?;

    let aws = require_some(general.cloud.aws.as_ref(), "cloud.aws")?;
    require(&aws.region, "cloud.aws.region")?;
    require(&aws.ssh_key_name, "cloud.aws.sshKeyName")?;
    require(&aws.control_plane.instance_type, "cloud.aws.controlPlane.instanceType")?;
    require(&aws.control_plane.ami.id, "cloud.aws.controlPlane.ami.id")?;
    if aws.control_plane.replicas == 0 {
        return Err(Error::config("cloud.aws.controlPlane.replicas must be > 0"));
    }

    for node_group in &aws.node_groups {
        validate_autoscalable_node_group(&node_group.autoscaling)?;
        require(&node_group.ami.id, "node group ami.id")?;
        require(&node_group.instance_type, "node group instanceType")?;
    }
    Ok(())
}

fn validate_azure(general: &GeneralConfig, secrets: &SecretsConfig) -> Result<()> {
    let credentials = require_some(secrets.azure.as_ref(), "Azure credentials")?;
    require(&credentials.client_id, "azure.clientID")?;
    require(&credentials.client_secret, "azure.clientSecret")?;

    let azure = require_some(general.cloud.azure.as_ref(), "cloud.azure")?;
    require(&azure.tenant_id, "cloud.azure.tenantID")?;
    require(&azure.subscription_id, "cloud.azure.subscriptionID")?;
    require(&azure.location, "cloud.azure.location")?;
    require(&azure.storage_account, "cloud.azure.storageAccount")?;
    require(&azure.aad_application.principal_id, "cloud.azure.aadApplication.principalID")?;
    validate_public_key(&azure.ssh_public_key, "cloud.azure.sshPublicKey")?;

    let control_plane = &azure.control_plane;
    if control_plane.disk_size_gb <= 100 {
        return Err(Error::config(
            "cloud.azure.controlPlane.diskSizeGB must be greater than 100",
        ));
    }
    if control_plane.replicas == 0 {
        return Err(Error::config("cloud.azure.controlPlane.replicas must be > 0"));
    }
    require(&control_plane.vm_size, "cloud.azure.controlPlane.vmSize")?;

    for node_group in &azure.node_groups {
        validate_autoscalable_node_group(&node_group.autoscaling)?;
        require(&node_group.vm_size, "node group vmSize")?;
    }
    Ok(())
}

fn validate_hetzner(general: &GeneralConfig, secrets: &SecretsConfig) -> Result<()> {
    let credentials = require_some(secrets.hetzner.as_ref(), "Hetzner credentials")?;
    require(&credentials.api_token, "hetzner.apiToken")?;

    let hetzner = require_some(general.cloud.hetzner.as_ref(), "cloud.hetzner")?;

    if hetzner.control_plane.regions.is_empty() {
        return Err(Error::config("cloud.hetzner.controlPlane.regions must not be empty"));
    }

    if hetzner.using_bare_metal() {
        let vswitch = require_some(hetzner.vswitch.as_ref(), "VSwitch details")?;
        require(&vswitch.name, "cloud.hetzner.vswitch.name")?;
    }

    if hetzner.using_hcloud() {
        let hcloud = require_some(hetzner.hcloud.as_ref(), "HCloud specific details")?;
        require(&hcloud.zone, "cloud.hetzner.hcloud.zone")?;
        require(&hcloud.ssh_key_pair_name, "cloud.hetzner.hcloud.sshKeyPairName")?;

        if hetzner.control_plane_in_hcloud() {
            let control_plane = require_some(
                hetzner.control_plane.hcloud.as_ref(),
                "HCloud specific control-plane details",
            )?;
            require(&control_plane.machine_type, "cloud.hetzner.controlPlane.hcloud.machineType")?;
        }

        for node_group in &hetzner.node_groups.hcloud {
            validate_autoscalable_node_group(&node_group.autoscaling)?;
        }
    }

    if hetzner.using_bare_metal() {
        let robot = credentials.robot.as_ref();
        require_some(robot, "Hetzner Robot user and password")?;
        let bare_metal = require_some(
            hetzner.bare_metal.as_ref(),
            "Hetzner bare metal specific details",
        )?;
        require(&bare_metal.ssh_key_pair.name, "cloud.hetzner.bareMetal.sshKeyPair.name")?;

        if hetzner.control_plane_in_bare_metal() {
            let control_plane = require_some(
                hetzner.control_plane.bare_metal.as_ref(),
                "Hetzner bare metal specific control-plane details",
            )?;
            if control_plane.bare_metal_hosts.is_empty() {
                return Err(Error::config(
                    "cloud.hetzner.controlPlane.bareMetal.bareMetalHosts must not be empty",
                ));
            }
            control_plane
                .endpoint
                .host
                .parse::<IpAddr>()
                .map_err(|_| {
                    Error::config(format!(
                        "control-plane endpoint {:?} must be an IP address",
                        control_plane.endpoint.host
                    ))
                })?;
        }

        for node_group in &hetzner.node_groups.bare_metal {
            validate_node_group(&node_group.node_group)?;
            if node_group.bare_metal_hosts.is_empty() {
                return Err(Error::config(format!(
                    "node group {} has no bare metal hosts",
                    node_group.node_group.name
                )));
            }
        }
    }
    Ok(())
}

fn validate_bare_metal_host(host: &BareMetalHost) -> Result<()> {
    if let Some(private) = &host.private_address {
        private.parse::<IpAddr>().map_err(|_| {
            Error::config(format!(
                "invalid private IP address {private:?} provided for a bare metal host"
            ))
        })?;
        return Ok(());
    }
    if host.public_address.as_deref().is_some_and(|a| !a.trim().is_empty()) {
        return Ok(());
    }
    Err(Error::config(
        "neither public nor private address provided for a bare metal host",
    ))
}

fn validate_bare_metal(general: &GeneralConfig) -> Result<()> {
    let bare_metal = require_some(general.cloud.bare_metal.as_ref(), "cloud.bare-metal")?;
    require(
        &bare_metal.control_plane.endpoint.host,
        "cloud.bare-metal.controlPlane.endpoint.host",
    )?;
    if bare_metal.control_plane.hosts.is_empty() {
        return Err(Error::config("cloud.bare-metal.controlPlane.hosts must not be empty"));
    }

    for host in &bare_metal.control_plane.hosts {
        validate_bare_metal_host(host)?;
    }
    for node_group in &bare_metal.node_groups {
        validate_node_group(&node_group.node_group)?;
        for host in &node_group.hosts {
            validate_bare_metal_host(host)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn node_group(labels: &[(&str, &str)], taints: Vec<Taint>) -> NodeGroup {
        NodeGroup {
            name: "workers".to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect::<BTreeMap<_, _>>(),
            taints,
        }
    }

    fn taint(key: &str, effect: &str) -> Taint {
        Taint {
            key: key.to_string(),
            value: Some("true".to_string()),
            effect: effect.to_string(),
            time_added: None,
        }
    }

    #[test]
    fn test_label_outside_capi_domains_rejected() {
        let group = node_group(&[("custom.example.com/foo", "bar")], Vec::new());
        let err = validate_node_group(&group).unwrap_err();
        assert!(err.to_string().contains("custom.example.com/foo"));
    }

    #[test]
    fn test_labels_in_capi_domains_accepted() {
        let group = node_group(
            &[
                ("node-role.kubernetes.io/worker", ""),
                ("node-restriction.kubernetes.io/gpu", "true"),
                ("node.cluster.x-k8s.io/pool", "a"),
            ],
            Vec::new(),
        );
        assert!(validate_node_group(&group).is_ok());
    }

    #[test]
    fn test_invalid_label_syntax_rejected() {
        let group = node_group(&[("node-role.kubernetes.io/-bad", "x")], Vec::new());
        assert!(validate_node_group(&group).is_err());

        let group = node_group(&[("node-role.kubernetes.io/ok", "not valid!")], Vec::new());
        assert!(validate_node_group(&group).is_err());
    }

    #[test]
    fn test_taint_effects() {
        let group = node_group(&[], vec![taint("dedicated", "NoSchedule")]);
        assert!(validate_node_group(&group).is_ok());

        let group = node_group(&[], vec![taint("dedicated", "Sometimes")]);
        assert!(validate_node_group(&group).is_err());
    }

    #[test]
    fn test_min_size_above_max_size_rejected() {
        let group = AutoScalableNodeGroup {
            node_group: node_group(&[], Vec::new()),
            min_size: 3,
            max_size: 1,
            cpu: 0,
            memory: 0,
        };
        assert!(validate_autoscalable_node_group(&group).is_err());
    }

    #[test]
    fn test_k8s_version_parse() {
        let v = K8sVersion::parse("v1.31.2").unwrap();
        assert_eq!((v.major, v.minor, v.patch), (1, 31, 2));
        assert_eq!(K8sVersion::parse("1.30.0").unwrap().to_string(), "v1.30.0");
        assert_eq!(K8sVersion::parse("v1.32.0-rc.1").unwrap().patch, 0);
        assert!(K8sVersion::parse("v1.31").is_err());
        assert!(K8sVersion::parse("latest").is_err());
    }

    #[test]
    fn test_k8s_version_bounds() {
        let stable = K8sVersion::parse("v1.33.1").unwrap();

        assert!(validate_k8s_version("v1.29.9", stable).is_err());
        assert!(validate_k8s_version("v1.30.0", stable).is_ok());
        assert!(validate_k8s_version("v1.31.4", stable).is_ok());
        assert!(validate_k8s_version("v1.33.1", stable).is_ok());
        assert!(validate_k8s_version("v1.33.2", stable).is_err());
    }
}
