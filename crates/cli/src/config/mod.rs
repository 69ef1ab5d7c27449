//! Cluster configuration: schema, parsing, hydration and validation.

pub mod audit;
pub mod generate;
pub mod model;
pub mod parser;
pub mod secrets;
pub mod ssh;
pub mod validate;

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use model::*;
pub use parser::{ConfigParser, GENERAL_CONFIG_FILE, SECRETS_CONFIG_FILE};
pub use secrets::SecretsConfig;
pub use validate::K8sVersion;

use crate::error::{Error, Result};

/// The cloud a cluster runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CloudKind {
    Aws,
    Azure,
    Hetzner,
    BareMetal,
    Local,
}

impl CloudKind {
    /// The first cloud section present wins.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when no cloud section is set.
    pub fn detect(cloud: &CloudConfig) -> Result<Self> {
        if cloud.aws.is_some() {
            Ok(Self::Aws)
        } else if cloud.azure.is_some() {
            Ok(Self::Azure)
        } else if cloud.hetzner.is_some() {
            Ok(Self::Hetzner)
        } else if cloud.bare_metal.is_some() {
            Ok(Self::BareMetal)
        } else if cloud.local.is_some() {
            Ok(Self::Local)
        } else {
            Err(Error::config(
                "no cloud provider configured, set one of cloud.aws, cloud.azure, cloud.hetzner, cloud.bare-metal or cloud.local",
            ))
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aws => "aws",
            Self::Azure => "azure",
            Self::Hetzner => "hetzner",
            Self::BareMetal => "bare-metal",
            Self::Local => "local",
        }
    }

    /// Whether the main cluster is provisioned by Cluster API from the management cluster.
    #[must_use]
    pub fn uses_capi(self) -> bool {
        matches!(self, Self::Aws | Self::Azure | Self::Hetzner)
    }
}

impl fmt::Display for CloudKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed, hydrated and validated configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub general: GeneralConfig,
    pub secrets: SecretsConfig,
    pub cloud: CloudKind,
    pub configs_dir: PathBuf,
    /// Newest Kubernetes release, looked up while parsing.
    pub latest_stable_k8s_version: K8sVersion,
}

impl Config {
    #[must_use]
    pub fn cluster_name(&self) -> &str {
        &self.general.cluster.name
    }

    /// Directory of this cluster under `k8s/` in the KubeAid config repository.
    #[must_use]
    pub fn cluster_directory(&self) -> &str {
        &self.general.forks.kubeaid_config.directory
    }

    #[must_use]
    pub fn customer_id(&self) -> Option<&str> {
        self.general
            .obmondo
            .as_ref()
            .map(|obmondo| obmondo.customer_id.as_str())
            .filter(|id| !id.is_empty())
    }

    /// Namespace the Cluster API resources of the main cluster live in.
    #[must_use]
    pub fn capi_namespace(&self) -> String {
        match self.customer_id() {
            Some(id) => format!("capi-cluster-{id}"),
            None => "capi-cluster".to_string(),
        }
    }

    #[must_use]
    pub fn disaster_recovery(&self) -> Option<&DisasterRecoveryConfig> {
        self.general.cloud.disaster_recovery.as_ref()
    }

    #[must_use]
    pub fn obmondo_monitoring(&self) -> bool {
        self.general
            .obmondo
            .as_ref()
            .is_some_and(|obmondo| obmondo.monitoring)
    }

    fn section<'a, T>(&self, section: Option<&'a T>, name: &str) -> Result<&'a T> {
        section.ok_or_else(|| Error::config(format!("cloud.{name} section is missing")))
    }

    /// # Errors
    /// Returns [`Error::Config`] when the section is absent.
    pub fn aws(&self) -> Result<&AwsConfig> {
        self.section(self.general.cloud.aws.as_ref(), "aws")
    }

    /// # Errors
    /// Returns [`Error::Config`] when the section is absent.
    pub fn azure(&self) -> Result<&AzureConfig> {
        self.section(self.general.cloud.azure.as_ref(), "azure")
    }

    /// # Errors
    /// Returns [`Error::Config`] when the section is absent.
    pub fn hetzner(&self) -> Result<&HetznerConfig> {
        self.section(self.general.cloud.hetzner.as_ref(), "hetzner")
    }

    /// # Errors
    /// Returns [`Error::Config`] when the section is absent.
    pub fn bare_metal(&self) -> Result<&BareMetalConfig> {
        self.section(self.general.cloud.bare_metal.as_ref(), "bare-metal")
    }

    /// Whether the main cluster has no worker node groups at all.
    #[must_use]
    pub fn has_no_node_groups(&self) -> bool {
        let cloud = &self.general.cloud;
        let count = cloud.aws.as_ref().map_or(0, |c| c.node_groups.len())
            + cloud.azure.as_ref().map_or(0, |c| c.node_groups.len())
            + cloud.hetzner.as_ref().map_or(0, |c| {
                c.node_groups.hcloud.len() + c.node_groups.bare_metal.len()
            })
            + cloud.bare_metal.as_ref().map_or(0, |c| c.node_groups.len());
        count == 0
    }
}

/// Unvalidated config straight from the two YAML documents.
#[cfg(test)]
pub(crate) fn test_config(general: &str, secrets: &str) -> Config {
    let general: GeneralConfig = serde_yaml::from_str(general).unwrap();
    let secrets: SecretsConfig = if secrets.trim().is_empty() {
        SecretsConfig::default()
    } else {
        serde_yaml::from_str(secrets).unwrap()
    };
    let cloud = CloudKind::detect(&general.cloud).unwrap();
    Config {
        general,
        secrets,
        cloud,
        configs_dir: PathBuf::from("outputs/configs"),
        latest_stable_k8s_version: K8sVersion {
            major: 1,
            minor: 33,
            patch: 1,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_first_cloud_wins() {
        let cloud = CloudConfig {
            local: Some(LocalConfig {}),
            ..CloudConfig::default()
        };
        assert_eq!(CloudKind::detect(&cloud).unwrap(), CloudKind::Local);
        assert!(CloudKind::detect(&CloudConfig::default()).is_err());
    }

    #[test]
    fn test_capi_clouds() {
        assert!(CloudKind::Aws.uses_capi());
        assert!(CloudKind::Hetzner.uses_capi());
        assert!(!CloudKind::Local.uses_capi());
        assert!(!CloudKind::BareMetal.uses_capi());
    }
}
