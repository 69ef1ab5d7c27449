//! Everything a workflow needs, bundled once per invocation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use kubeaid_cloud::CommandRunner;
use tracing::debug;

use crate::cloud::Cloud;
use crate::config::{CloudKind, Config};
use crate::constants::{
    DEFAULT_MANAGEMENT_CLUSTER_NAME, OUTPUTS_DIRECTORY, OUTPUT_JWKS_DOCUMENT, OUTPUT_K3D_CONFIG,
    OUTPUT_LOG_FILE, OUTPUT_MAIN_KUBECONFIG, OUTPUT_MANAGEMENT_CONTAINER_KUBECONFIG,
    OUTPUT_MANAGEMENT_HOST_KUBECONFIG, OUTPUT_SEALED_SECRETS_KEYS, TEMP_DIRECTORY,
};
use crate::error::{Error, Result};
use crate::git::{Git, GitAuth};
use crate::k8s::{Helm, Kubectl};

/// Global CLI flags shared by every workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flags {
    pub debug: bool,
    pub configs_dir: PathBuf,
    pub management_cluster_name: String,
    pub skip_pr_workflow: bool,
    pub skip_monitoring_setup: bool,
    pub skip_kube_prometheus_build: bool,
    pub skip_clusterctl_move: bool,
}

impl Default for Flags {
    fn default() -> Self {
        Self {
            debug: false,
            configs_dir: PathBuf::from(crate::constants::DEFAULT_CONFIGS_DIRECTORY),
            management_cluster_name: DEFAULT_MANAGEMENT_CLUSTER_NAME.to_string(),
            skip_pr_workflow: false,
            skip_monitoring_setup: false,
            skip_kube_prometheus_build: false,
            skip_clusterctl_move: false,
        }
    }
}

/// Which of the two clusters an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterTarget {
    /// The local K3D cluster running the Cluster API controllers.
    Management,
    /// The cluster being provisioned.
    Main,
}

impl ClusterTarget {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Management => "management",
            Self::Main => "main",
        }
    }
}

impl std::fmt::Display for ClusterTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Locations of generated files and scratch checkouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub outputs: PathBuf,
    pub temp: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self::new(OUTPUTS_DIRECTORY, TEMP_DIRECTORY)
    }
}

impl Paths {
    pub fn new(outputs: impl Into<PathBuf>, temp: impl Into<PathBuf>) -> Self {
        Self {
            outputs: outputs.into(),
            temp: temp.into(),
        }
    }

    #[must_use]
    pub fn k3d_config(&self) -> PathBuf {
        self.outputs.join(OUTPUT_K3D_CONFIG)
    }

    #[must_use]
    pub fn management_host_kubeconfig(&self) -> PathBuf {
        self.outputs.join(OUTPUT_MANAGEMENT_HOST_KUBECONFIG)
    }

    #[must_use]
    pub fn management_container_kubeconfig(&self) -> PathBuf {
        self.outputs.join(OUTPUT_MANAGEMENT_CONTAINER_KUBECONFIG)
    }

    #[must_use]
    pub fn main_kubeconfig(&self) -> PathBuf {
        self.outputs.join(OUTPUT_MAIN_KUBECONFIG)
    }

    #[must_use]
    pub fn jwks_document(&self) -> PathBuf {
        self.outputs.join(OUTPUT_JWKS_DOCUMENT)
    }

    #[must_use]
    pub fn sealed_secrets_keys(&self) -> PathBuf {
        self.outputs.join(OUTPUT_SEALED_SECRETS_KEYS)
    }

    #[must_use]
    pub fn log_file(&self) -> PathBuf {
        self.outputs.join(OUTPUT_LOG_FILE)
    }

    #[must_use]
    pub fn kubeconfig(&self, target: ClusterTarget) -> PathBuf {
        match target {
            ClusterTarget::Management => self.management_host_kubeconfig(),
            ClusterTarget::Main => self.main_kubeconfig(),
        }
    }
}

/// Parsed config, flags, the cloud adapter and process plumbing for one invocation.
///
/// Read-only once built.
pub struct Session {
    pub flags: Flags,
    pub config: Config,
    pub paths: Paths,
    pub cloud: Cloud,
    pub git_auth: GitAuth,
    pub runner: Arc<dyn CommandRunner>,
}

impl Session {
    /// Build the cloud adapter and hydrate node group sizes from its API.
    ///
    /// # Errors
    ///
    /// Returns configuration errors from the adapter and remote errors from the VM size lookups.
    pub async fn new(
        flags: Flags,
        mut config: Config,
        paths: Paths,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        let cloud = Cloud::from_config(&config, Arc::clone(&runner))?;
        cloud.provider().hydrate_vm_specs(&mut config).await?;

        let git_auth = GitAuth::detect(&config);

        Ok(Self {
            flags,
            config,
            paths,
            cloud,
            git_auth,
            runner,
        })
    }

    #[must_use]
    pub fn cluster_name(&self) -> &str {
        self.config.cluster_name()
    }

    #[must_use]
    pub fn cloud_kind(&self) -> CloudKind {
        self.config.cloud
    }

    /// Kubeconfig of `target` usable from where this process runs.
    #[must_use]
    pub fn kubeconfig(&self, target: ClusterTarget) -> PathBuf {
        match target {
            ClusterTarget::Management => crate::k3d::management_kubeconfig(&self.paths),
            ClusterTarget::Main => self.paths.main_kubeconfig(),
        }
    }

    #[must_use]
    pub fn kubectl(&self, kubeconfig: &Path) -> Kubectl {
        Kubectl::new(Arc::clone(&self.runner), kubeconfig)
    }

    #[must_use]
    pub fn helm(&self, kubeconfig: &Path) -> Helm {
        Helm::new(Arc::clone(&self.runner), kubeconfig)
    }

    /// The `git` CLI authenticated for the KubeAid config repository.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the SSH askpass helper cannot be written.
    pub fn git(&self) -> Result<Git> {
        Git::new(
            Arc::clone(&self.runner),
            self.git_auth.clone(),
            self.config.general.git.ca_bundle_path.clone(),
            &self.paths.temp,
        )
    }

    /// Name of the Cluster API infrastructure provider component.
    #[must_use]
    pub fn infrastructure_provider_name(&self) -> String {
        match self.config.customer_id() {
            Some(id) => format!("{}-{id}", self.cloud_kind()),
            None => self.cloud_kind().to_string(),
        }
    }
}

/// Executables every workflow shells out to.
const COMMON_EXECUTABLES: &[&str] = &["git", "kubectl", "helm", "k3d", "kubeseal"];

/// Executables the workflows on `cloud` need.
#[must_use]
pub fn required_executables(cloud: CloudKind) -> Vec<&'static str> {
    let mut executables = COMMON_EXECUTABLES.to_vec();
    match cloud {
        CloudKind::Aws => executables.extend(["clusterctl", "aws", "clusterawsadm"]),
        CloudKind::Azure => executables.extend(["clusterctl", "az", "azwi"]),
        CloudKind::Hetzner => executables.push("clusterctl"),
        CloudKind::BareMetal => executables.push("kubeone"),
        CloudKind::Local => {}
    }
    executables
}

/// Fail with the names of every executable missing from `PATH`.
///
/// # Errors
///
/// Returns [`Error::Config`] listing the missing executables.
pub fn ensure_executables(executables: &[&str]) -> Result<()> {
    let missing: Vec<&str> = executables
        .iter()
        .copied()
        .filter(|name| which::which(name).is_err())
        .collect();

    if missing.is_empty() {
        debug!(?executables, "All required executables found");
        return Ok(());
    }

    Err(Error::config(format!(
        "required executables not found in PATH: {}",
        missing.join(", ")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_layout() {
        let paths = Paths::new("/work/outputs", "/tmp/kubeaid-core");
        assert_eq!(
            paths.kubeconfig(ClusterTarget::Main),
            PathBuf::from("/work/outputs/kubeconfigs/clusters/main.yaml")
        );
        assert_eq!(
            paths.kubeconfig(ClusterTarget::Management),
            PathBuf::from("/work/outputs/kubeconfigs/clusters/management/host.yaml")
        );
        assert_eq!(paths.k3d_config(), PathBuf::from("/work/outputs/k3d.config.yaml"));
    }

    #[test]
    fn test_required_executables_per_cloud() {
        assert!(required_executables(CloudKind::Aws).contains(&"clusterawsadm"));
        assert!(required_executables(CloudKind::Azure).contains(&"azwi"));
        assert!(required_executables(CloudKind::BareMetal).contains(&"kubeone"));
        assert!(!required_executables(CloudKind::Local).contains(&"clusterctl"));
    }

    #[test]
    fn test_missing_executables_are_named() {
        let err = ensure_executables(&["sh", "definitely-not-installed-kubeaid"]).unwrap_err();
        assert!(err.to_string().contains("definitely-not-installed-kubeaid"));
        assert!(!err.to_string().contains("sh,"));
    }
}
