//! The local K3D management cluster.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use handlebars::Handlebars;
use kubeaid_cloud::azure::service_account_issuer_url;
use kubeaid_cloud::{run_checked, CommandRunner, Invocation};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{CloudKind, Config};
use crate::constants::{BLOB_CONTAINER_OIDC_PROVIDER, LABEL_CONTROL_PLANE};
use crate::error::{Error, Result};
use crate::k8s::{write_kubeconfig, Kubectl};
use crate::session::Paths;

const K3D_CONFIG_TEMPLATE: &str = include_str!("../templates/k3d/k3d.config.yaml.hbs");

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct K3dConfigValues {
    name: String,
    k3s_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    workload_identity: Option<WorkloadIdentityValues>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WorkloadIdentityValues {
    #[serde(rename = "serviceAccountIssuerURL")]
    service_account_issuer_url: String,
    ssh_public_key_file_path: String,
    ssh_private_key_file_path: String,
}

#[derive(Deserialize)]
struct ListedCluster {
    name: String,
}

fn absolute(path: &Path) -> Result<String> {
    Ok(std::path::absolute(path)?.display().to_string())
}

/// The K3D cluster config for management cluster `name`.
///
/// On Azure the API server signs service account tokens with the OpenID provider key pair, so
/// workload identity federation trusts tokens minted by the management cluster too.
///
/// # Errors
///
/// Returns an error if the Azure issuer URL is invalid or the template fails to render.
pub fn render_config(config: &Config, name: &str) -> Result<String> {
    let workload_identity = if config.cloud == CloudKind::Azure {
        let azure = config.azure()?;
        let keys = &azure.workload_identity.openid_provider_ssh_key_pair;
        Some(WorkloadIdentityValues {
            service_account_issuer_url: service_account_issuer_url(
                &azure.storage_account,
                BLOB_CONTAINER_OIDC_PROVIDER,
            )?
            .to_string(),
            ssh_public_key_file_path: absolute(&keys.public_key_file_path)?,
            ssh_private_key_file_path: absolute(&keys.private_key_file_path)?,
        })
    } else {
        None
    };

    let values = K3dConfigValues {
        name: name.to_string(),
        k3s_version: format!("{}-k3s1", config.general.cluster.k8s_version),
        workload_identity,
    };

    let mut handlebars = Handlebars::new();
    handlebars.register_escape_fn(handlebars::no_escape);
    handlebars
        .render_template(K3D_CONFIG_TEMPLATE, &values)
        .map_err(Error::Template)
}

/// Point a kubeconfig at the server container instead of the host port.
///
/// # Errors
///
/// Returns an error if `kubeconfig` is not a kubeconfig document.
pub fn container_kubeconfig(kubeconfig: &str, name: &str) -> Result<String> {
    let mut document: serde_yaml::Value = serde_yaml::from_str(kubeconfig)?;
    let server = serde_yaml::Value::from(format!("https://k3d-{name}-server-0:6443"));

    let clusters = document
        .get_mut("clusters")
        .and_then(serde_yaml::Value::as_sequence_mut)
        .ok_or_else(|| Error::precondition("K3D kubeconfig lists no clusters"))?;
    for cluster in clusters {
        if let Some(entry) = cluster
            .get_mut("cluster")
            .and_then(serde_yaml::Value::as_mapping_mut)
        {
            entry.insert("server".into(), server.clone());
        }
    }

    Ok(serde_yaml::to_string(&document)?)
}

/// `k3d` bound to the command runner.
#[derive(Clone)]
pub struct K3d {
    runner: Arc<dyn CommandRunner>,
}

impl K3d {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let invocation = Invocation::new("k3d").args(args.iter().copied());
        Ok(run_checked(self.runner.as_ref(), invocation).await?)
    }

    /// # Errors
    ///
    /// Returns an error if `k3d cluster list` fails or prints something other than JSON.
    pub async fn cluster_exists(&self, name: &str) -> Result<bool> {
        let output = self.run(&["cluster", "list", "-o", "json"]).await?;
        let clusters: Vec<ListedCluster> = serde_json::from_str(&output)?;
        Ok(clusters.iter().any(|cluster| cluster.name == name))
    }

    /// Create management cluster `name` unless it exists, and write both of its kubeconfigs.
    ///
    /// # Errors
    ///
    /// Returns an error if the cluster cannot be created or its kubeconfig cannot be written.
    pub async fn create_cluster(&self, config: &Config, paths: &Paths, name: &str) -> Result<()> {
        let config_file = paths.k3d_config();
        if let Some(parent) = config_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&config_file, render_config(config, name)?)?;

        if self.cluster_exists(name).await? {
            info!(cluster = %name, "Skipped creating the K3D management cluster");
        } else {
            info!(cluster = %name, "Creating the K3D management cluster");
            self.run(&["cluster", "create", "--config", &config_file.display().to_string()])
                .await?;
        }

        let kubeconfig = self.run(&["kubeconfig", "get", name]).await?;
        write_kubeconfig(&paths.management_host_kubeconfig(), &kubeconfig)?;
        write_kubeconfig(
            &paths.management_container_kubeconfig(),
            &container_kubeconfig(&kubeconfig, name)?,
        )?;
        Ok(())
    }

    /// Delete the cluster described by the rendered config at `config_file`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StatePrecondition`] if the config was never rendered, or the `k3d` error.
    pub async fn delete_cluster(&self, config_file: &Path) -> Result<()> {
        if !config_file.is_file() {
            return Err(Error::precondition(format!(
                "K3D config {} not found",
                config_file.display()
            )));
        }
        info!("Deleting the K3D management cluster");
        self.run(&["cluster", "delete", "--config", &config_file.display().to_string()])
            .await?;
        Ok(())
    }
}

/// Give K3S masters the empty `node-role.kubernetes.io/control-plane` label vanilla Kubernetes
/// uses, which the capi-cluster chart schedules on.
///
/// # Errors
///
/// Returns an error if the nodes cannot be listed or relabeled.
pub async fn relabel_masters(kubectl: &Kubectl) -> Result<()> {
    let selector = format!("{LABEL_CONTROL_PLANE}=true");
    let nodes = kubectl
        .exec(&["get", "nodes", "-l", &selector, "-o", "name"])
        .await?;

    for node in nodes.lines().map(str::trim).filter(|line| !line.is_empty()) {
        kubectl.label(node, &format!("{LABEL_CONTROL_PLANE}-")).await?;
        kubectl.label(node, &format!("{LABEL_CONTROL_PLANE}=")).await?;
        info!(node = %node, "Relabeled master node");
    }
    Ok(())
}

/// Whether this process runs inside a Docker container.
#[must_use]
pub fn is_containerized() -> bool {
    Path::new("/.dockerenv").exists()
}

/// The management kubeconfig usable from where this process runs.
#[must_use]
pub fn management_kubeconfig(paths: &Paths) -> PathBuf {
    if is_containerized() {
        paths.management_container_kubeconfig()
    } else {
        paths.management_host_kubeconfig()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GeneralConfig, SecretsConfig};
    use kubeaid_cloud::{CommandOutput, MockCommandRunner};

    fn local_config() -> Config {
        let general: GeneralConfig = serde_yaml::from_str(
            r"
forkURLs:
  kubeaid:
    url: https://github.com/Obmondo/KubeAid
    version: 17.0.0
  kubeaidConfig:
    url: https://gitea.example.com/acme/kubeaid-config
cluster:
  name: smoke
  k8sVersion: v1.30.0
cloud:
  local: {}
",
        )
        .unwrap();
        Config {
            general,
            secrets: SecretsConfig::default(),
            cloud: CloudKind::Local,
            configs_dir: PathBuf::from("outputs/configs"),
            latest_stable_k8s_version: crate::config::validate::K8sVersion {
                major: 1,
                minor: 33,
                patch: 1,
            },
        }
    }

    #[test]
    fn test_render_local_config() {
        let rendered = render_config(&local_config(), "smoke-mgmt").unwrap();
        let document: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(document["metadata"]["name"], "smoke-mgmt");
        assert_eq!(document["image"], "rancher/k3s:v1.30.0-k3s1");
        assert!(document.get("volumes").is_none());
    }

    #[test]
    fn test_container_kubeconfig_points_at_server_container() {
        let host = r"
apiVersion: v1
kind: Config
clusters:
  - name: k3d-kubeaid-bootstrapper
    cluster:
      certificate-authority-data: LS0t
      server: https://0.0.0.0:41235
contexts: []
users: []
";
        let container = container_kubeconfig(host, "kubeaid-bootstrapper").unwrap();
        let document: serde_yaml::Value = serde_yaml::from_str(&container).unwrap();
        assert_eq!(
            document["clusters"][0]["cluster"]["server"],
            "https://k3d-kubeaid-bootstrapper-server-0:6443"
        );
        assert_eq!(document["clusters"][0]["cluster"]["certificate-authority-data"], "LS0t");
    }

    #[tokio::test]
    async fn test_cluster_exists_parses_listing() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|i| i.program == "k3d" && i.args == ["cluster", "list", "-o", "json"])
            .returning(|_| {
                Ok(CommandOutput {
                    status: 0,
                    stdout: r#"[{"name":"kubeaid-bootstrapper","serversRunning":1}]"#.into(),
                    stderr: String::new(),
                })
            });

        let k3d = K3d::new(Arc::new(runner));
        assert!(k3d.cluster_exists("kubeaid-bootstrapper").await.unwrap());
        assert!(!k3d.cluster_exists("smoke-mgmt").await.unwrap());
    }

    #[tokio::test]
    async fn test_relabel_masters() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|i| i.args.contains(&"get".to_string()))
            .returning(|_| {
                Ok(CommandOutput {
                    status: 0,
                    stdout: "node/k3d-smoke-mgmt-server-0\n".into(),
                    stderr: String::new(),
                })
            });
        runner
            .expect_run()
            .withf(|i| i.args.contains(&"label".to_string()))
            .times(2)
            .returning(|_| {
                Ok(CommandOutput {
                    status: 0,
                    stdout: String::new(),
                    stderr: String::new(),
                })
            });

        let kubectl = Kubectl::new(Arc::new(runner), Path::new("host.yaml"));
        relabel_masters(&kubectl).await.unwrap();
    }
}
