//! Rendering of the embedded KubeAid config catalog into a cluster directory.
//!
//! Rendering and sealing are separate phases: [`Renderer::render_all`] writes every selected
//! template as plain YAML (secret templates as plain `Secret` documents), and the caller seals
//! the secret files afterwards with [`crate::sealed_secrets::Sealer`].

use std::path::{Path, PathBuf};

use handlebars::{handlebars_helper, Handlebars};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::{CloudKind, Config, DisasterRecoveryConfig, GeneralConfig, SecretsConfig};
use crate::error::{Error, Result};
use crate::git::RepoLocation;
use crate::session::Flags;

macro_rules! catalog {
    ($($path:literal),* $(,)?) => {
        &[$(($path, include_str!(concat!("../templates/kubeaid-config/", $path, ".hbs")))),*]
    };
}

/// Every template, keyed by its path below the cluster directory.
const CATALOG: &[(&str, &str)] = catalog![
    "kubeaid-bootstrap-script.general.yaml",
    "argocd-apps/Chart.yaml",
    "argocd-apps/templates/root.yaml",
    "argocd-apps/templates/argocd.yaml",
    "argocd-apps/values-argocd.yaml",
    "argocd-apps/templates/cert-manager.yaml",
    "argocd-apps/values-cert-manager.yaml",
    "argocd-apps/templates/sealed-secrets.yaml",
    "argocd-apps/values-sealed-secrets.yaml",
    "argocd-apps/templates/secrets.yaml",
    "argocd-apps/templates/cilium.yaml",
    "argocd-apps/values-cilium.yaml",
    "argocd-apps/templates/cluster-api.yaml",
    "argocd-apps/values-cluster-api.yaml",
    "argocd-apps/templates/capi-cluster.yaml",
    "argocd-apps/values-capi-cluster.yaml",
    "argocd-apps/templates/cluster-autoscaler.yaml",
    "argocd-apps/values-cluster-autoscaler.yaml",
    "argocd-apps/templates/external-snapshotter.yaml",
    "argocd-apps/templates/ccm-aws.yaml",
    "argocd-apps/values-ccm-aws.yaml",
    "argocd-apps/templates/kube2iam.yaml",
    "argocd-apps/values-kube2iam.yaml",
    "argocd-apps/templates/velero.yaml",
    "argocd-apps/values-velero.yaml",
    "argocd-apps/templates/k8s-configs.yaml",
    "k8s-configs/sealed-secrets.namespace.yaml",
    "k8s-configs/velero.namespace.yaml",
    "k8s-configs/argocd-tls-certs-cm.configmap.yaml",
    "argocd-apps/templates/ccm-azure.yaml",
    "argocd-apps/values-ccm-azure.yaml",
    "argocd-apps/templates/azuredisk-csi-driver.yaml",
    "argocd-apps/values-azuredisk-csi-driver.yaml",
    "argocd-apps/templates/azure-workload-identity-webhook.yaml",
    "argocd-apps/values-azure-workload-identity-webhook.yaml",
    "argocd-apps/templates/crossplane.yaml",
    "argocd-apps/values-crossplane.yaml",
    "argocd-apps/templates/crossplane-providers-and-functions.yaml",
    "argocd-apps/templates/crossplane-compositions.yaml",
    "argocd-apps/templates/infrastructure.yaml",
    "infrastructure/workload-identity.yaml",
    "infrastructure/disaster-recovery.yaml",
    "argocd-apps/templates/ccm-hetzner.yaml",
    "argocd-apps/values-ccm-hetzner.yaml",
    "argocd-apps/templates/hcloud-csi-driver.yaml",
    "argocd-apps/values-hcloud-csi-driver.yaml",
    "argocd-apps/templates/hetzner-robot.yaml",
    "argocd-apps/values-hetzner-robot.yaml",
    "argocd-apps/templates/kube-prometheus.yaml",
    "cluster-vars.jsonnet",
    "kubeone/kubeone-cluster.yaml",
    "sealed-secrets/argocd/kubeaid-config.yaml",
    "sealed-secrets/capi-cluster/cloud-credentials.yaml",
    "sealed-secrets/capi-cluster/service-account-issuer-keys.yaml",
    "sealed-secrets/capi-cluster/hetzner-bare-metal-ssh-keypair.yaml",
    "sealed-secrets/kube-system/cloud-credentials.yaml",
    "sealed-secrets/sealed-secrets/backup-sealed-secrets-pod-env.yaml",
    "sealed-secrets/hetzner-robot/hetzner-robot-credentials.yaml",
];

/// Shared ArgoCD Application skeleton for KubeAid charts.
const APP_PARTIAL: &str = include_str!("../templates/kubeaid-config/_app.yaml.hbs");

pub const TEMPLATE_VALUES_CILIUM: &str = "argocd-apps/values-cilium.yaml";
pub const TEMPLATE_VALUES_CAPI_CLUSTER: &str = "argocd-apps/values-capi-cluster.yaml";
pub const TEMPLATE_VALUES_ARGOCD: &str = "argocd-apps/values-argocd.yaml";
pub const TEMPLATE_VALUES_SEALED_SECRETS: &str = "argocd-apps/values-sealed-secrets.yaml";
pub const TEMPLATE_KUBE_PROMETHEUS_VARS: &str = "cluster-vars.jsonnet";
pub const TEMPLATE_KUBEONE_CLUSTER: &str = "kubeone/kubeone-cluster.yaml";

const COMMON: &[&str] = &[
    "kubeaid-bootstrap-script.general.yaml",
    "argocd-apps/Chart.yaml",
    "argocd-apps/templates/root.yaml",
    "argocd-apps/templates/argocd.yaml",
    TEMPLATE_VALUES_ARGOCD,
    "argocd-apps/templates/cert-manager.yaml",
    "argocd-apps/values-cert-manager.yaml",
    "argocd-apps/templates/sealed-secrets.yaml",
    TEMPLATE_VALUES_SEALED_SECRETS,
    "argocd-apps/templates/secrets.yaml",
];

const COMMON_SECRET: &[&str] = &["sealed-secrets/argocd/kubeaid-config.yaml"];

const CAPI_COMMON: &[&str] = &[
    "argocd-apps/templates/cilium.yaml",
    TEMPLATE_VALUES_CILIUM,
    "argocd-apps/templates/cluster-api.yaml",
    "argocd-apps/values-cluster-api.yaml",
    "argocd-apps/templates/capi-cluster.yaml",
    TEMPLATE_VALUES_CAPI_CLUSTER,
    "argocd-apps/templates/cluster-autoscaler.yaml",
    "argocd-apps/values-cluster-autoscaler.yaml",
    "argocd-apps/templates/external-snapshotter.yaml",
];

const CAPI_COMMON_SECRET: &[&str] = &["sealed-secrets/capi-cluster/cloud-credentials.yaml"];

const AWS: &[&str] = &["argocd-apps/templates/ccm-aws.yaml", "argocd-apps/values-ccm-aws.yaml"];

const AWS_DISASTER_RECOVERY: &[&str] = &[
    "argocd-apps/templates/kube2iam.yaml",
    "argocd-apps/values-kube2iam.yaml",
    "argocd-apps/templates/velero.yaml",
    "argocd-apps/values-velero.yaml",
    "argocd-apps/templates/k8s-configs.yaml",
    "k8s-configs/sealed-secrets.namespace.yaml",
    "k8s-configs/velero.namespace.yaml",
];

const AZURE: &[&str] = &[
    "argocd-apps/templates/ccm-azure.yaml",
    "argocd-apps/values-ccm-azure.yaml",
    "argocd-apps/templates/azuredisk-csi-driver.yaml",
    "argocd-apps/values-azuredisk-csi-driver.yaml",
    "argocd-apps/templates/azure-workload-identity-webhook.yaml",
    "argocd-apps/values-azure-workload-identity-webhook.yaml",
];

const AZURE_SECRET: &[&str] = &["sealed-secrets/capi-cluster/service-account-issuer-keys.yaml"];

const AZURE_CROSSPLANE: &[&str] = &[
    "argocd-apps/templates/crossplane.yaml",
    "argocd-apps/values-crossplane.yaml",
    "argocd-apps/templates/crossplane-providers-and-functions.yaml",
    "argocd-apps/templates/crossplane-compositions.yaml",
    "argocd-apps/templates/infrastructure.yaml",
    "infrastructure/workload-identity.yaml",
];

const AZURE_CROSSPLANE_DISASTER_RECOVERY: &[&str] = &["infrastructure/disaster-recovery.yaml"];

const AZURE_DISASTER_RECOVERY: &[&str] =
    &["argocd-apps/templates/velero.yaml", "argocd-apps/values-velero.yaml"];

const AZURE_DISASTER_RECOVERY_SECRET: &[&str] =
    &["sealed-secrets/sealed-secrets/backup-sealed-secrets-pod-env.yaml"];

const HCLOUD: &[&str] = &[
    "argocd-apps/templates/ccm-hetzner.yaml",
    "argocd-apps/values-ccm-hetzner.yaml",
    "argocd-apps/templates/hcloud-csi-driver.yaml",
    "argocd-apps/values-hcloud-csi-driver.yaml",
];

const HCLOUD_SECRET: &[&str] = &["sealed-secrets/kube-system/cloud-credentials.yaml"];

const HETZNER_BARE_METAL_SECRET: &[&str] =
    &["sealed-secrets/capi-cluster/hetzner-bare-metal-ssh-keypair.yaml"];

const HETZNER_FAILOVER: &[&str] = &[
    "argocd-apps/templates/hetzner-robot.yaml",
    "argocd-apps/values-hetzner-robot.yaml",
];

const HETZNER_FAILOVER_SECRET: &[&str] =
    &["sealed-secrets/hetzner-robot/hetzner-robot-credentials.yaml"];

const CA_BUNDLE: &[&str] = &[
    "argocd-apps/templates/k8s-configs.yaml",
    "k8s-configs/argocd-tls-certs-cm.configmap.yaml",
];

const MONITORING: &[&str] = &["argocd-apps/templates/kube-prometheus.yaml", TEMPLATE_KUBE_PROMETHEUS_VARS];

/// Templates to render for one cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateSelection {
    pub non_secret: Vec<&'static str>,
    pub secret: Vec<&'static str>,
}

impl TemplateSelection {
    fn add(list: &mut Vec<&'static str>, names: &[&'static str]) {
        for name in names {
            if !list.contains(name) {
                list.push(name);
            }
        }
    }
}

/// Which templates a cluster needs. A pure function of the config and flags.
#[must_use]
pub fn select_templates(config: &Config, flags: &Flags) -> TemplateSelection {
    let mut selection = TemplateSelection::default();
    let non_secret = &mut selection.non_secret;
    let secret = &mut selection.secret;

    TemplateSelection::add(non_secret, COMMON);
    TemplateSelection::add(secret, COMMON_SECRET);

    if config.cloud.uses_capi() {
        TemplateSelection::add(non_secret, CAPI_COMMON);
        TemplateSelection::add(secret, CAPI_COMMON_SECRET);
    }

    if config.general.git.ca_bundle.is_some() {
        TemplateSelection::add(non_secret, CA_BUNDLE);
    }

    let disaster_recovery = config.disaster_recovery().is_some();
    match config.cloud {
        CloudKind::Aws => {
            TemplateSelection::add(non_secret, AWS);
            if disaster_recovery {
                TemplateSelection::add(non_secret, AWS_DISASTER_RECOVERY);
            }
        }
        CloudKind::Azure => {
            TemplateSelection::add(non_secret, AZURE);
            TemplateSelection::add(secret, AZURE_SECRET);
            let crossplane = config
                .general
                .cloud
                .azure
                .as_ref()
                .is_some_and(|azure| azure.use_crossplane);
            if crossplane {
                TemplateSelection::add(non_secret, AZURE_CROSSPLANE);
            }
            if disaster_recovery {
                TemplateSelection::add(non_secret, AZURE_DISASTER_RECOVERY);
                TemplateSelection::add(secret, AZURE_DISASTER_RECOVERY_SECRET);
                if crossplane {
                    TemplateSelection::add(non_secret, AZURE_CROSSPLANE_DISASTER_RECOVERY);
                }
            }
        }
        CloudKind::Hetzner => {
            if let Some(hetzner) = config.general.cloud.hetzner.as_ref() {
                if hetzner.using_hcloud() {
                    TemplateSelection::add(non_secret, HCLOUD);
                    TemplateSelection::add(secret, HCLOUD_SECRET);
                }
                if hetzner.using_bare_metal() {
                    TemplateSelection::add(secret, HETZNER_BARE_METAL_SECRET);
                }
                if hetzner.control_plane_failover_ip().is_some() {
                    TemplateSelection::add(non_secret, HETZNER_FAILOVER);
                    TemplateSelection::add(secret, HETZNER_FAILOVER_SECRET);
                }
            }
        }
        CloudKind::BareMetal => TemplateSelection::add(non_secret, &[TEMPLATE_KUBEONE_CLUSTER]),
        CloudKind::Local => {}
    }

    if !flags.skip_monitoring_setup && !flags.skip_kube_prometheus_build {
        TemplateSelection::add(non_secret, MONITORING);
    }

    selection
}

/// Values a cloud adapter contributes to rendering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudTemplateValues {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aws_account_id: Option<String>,
    #[serde(rename = "awsB64EncodedCredentials", skip_serializing_if = "Option::is_none")]
    pub aws_b64_encoded_credentials: Option<String>,
    #[serde(rename = "capiUAMIClientID", skip_serializing_if = "Option::is_none")]
    pub capi_uami_client_id: Option<String>,
    #[serde(rename = "veleroUAMIClientID", skip_serializing_if = "Option::is_none")]
    pub velero_uami_client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub azure_storage_account_access_key: Option<String>,
    #[serde(rename = "serviceAccountIssuerURL", skip_serializing_if = "Option::is_none")]
    pub service_account_issuer_url: Option<String>,
}

/// Host and port of a provisioned cluster's API server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiEndpoint {
    pub host: String,
    pub port: u16,
}

/// Key material the config model keeps out of serialization.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct KeyMaterial {
    #[serde(skip_serializing_if = "Option::is_none")]
    git_private_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ca_bundle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    service_account_issuer_private_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    service_account_issuer_public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hetzner_ssh_private_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hetzner_ssh_public_key: Option<String>,
}

impl KeyMaterial {
    fn from_config(config: &Config) -> Self {
        let general = &config.general;
        let azure_keys = general
            .cloud
            .azure
            .as_ref()
            .map(|azure| &azure.workload_identity.openid_provider_ssh_key_pair);
        let hetzner_keys = general
            .cloud
            .hetzner
            .as_ref()
            .and_then(|hetzner| hetzner.bare_metal.as_ref())
            .map(|bare_metal| &bare_metal.ssh_key_pair.key_pair);

        Self {
            git_private_key: general.git.private_key.clone(),
            ca_bundle: general.git.ca_bundle.clone(),
            service_account_issuer_private_key: azure_keys.map(|k| k.private_key.clone()),
            service_account_issuer_public_key: azure_keys.map(|k| k.public_key.clone()),
            hetzner_ssh_private_key: hetzner_keys.map(|k| k.private_key.clone()),
            hetzner_ssh_public_key: hetzner_keys.map(|k| k.public_key.clone()),
        }
    }
}

/// Everything the templates can reference.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateValues {
    general_config_contents: String,
    cluster_name: String,
    cluster_directory: String,
    cloud: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    hetzner_mode: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    customer_id: Option<String>,
    customer_git_server_hostname: String,
    kubeaid_url: String,
    kubeaid_version: String,
    kubeaid_config_url: String,
    capi_cluster_namespace: String,
    infrastructure_provider: String,
    general: GeneralConfig,
    secrets: SecretsConfig,
    keys: KeyMaterial,
    #[serde(flatten)]
    cloud_values: CloudTemplateValues,
    #[serde(skip_serializing_if = "Option::is_none")]
    control_plane_endpoint: Option<ApiEndpoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    disaster_recovery: Option<DisasterRecoveryConfig>,
    obmondo_monitoring: bool,
}

impl TemplateValues {
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the KubeAid config URL cannot be parsed.
    pub fn new(
        config: &Config,
        general_config_contents: String,
        cloud_values: CloudTemplateValues,
        control_plane_endpoint: Option<ApiEndpoint>,
    ) -> Result<Self> {
        let general = &config.general;
        let location = RepoLocation::parse(&general.forks.kubeaid_config.url)?;

        let infrastructure_provider = match config.customer_id() {
            Some(id) => format!("{}-{id}", config.cloud),
            None => config.cloud.to_string(),
        };

        Ok(Self {
            general_config_contents,
            cluster_name: config.cluster_name().to_string(),
            cluster_directory: config.cluster_directory().to_string(),
            cloud: config.cloud.as_str(),
            hetzner_mode: general.cloud.hetzner.as_ref().map(|h| h.mode.as_str()),
            customer_id: config.customer_id().map(str::to_string),
            customer_git_server_hostname: location.host,
            kubeaid_url: general.forks.kubeaid.url.clone(),
            kubeaid_version: general.forks.kubeaid.version.clone(),
            kubeaid_config_url: general.forks.kubeaid_config.url.clone(),
            capi_cluster_namespace: config.capi_namespace(),
            infrastructure_provider,
            general: general.clone(),
            secrets: config.secrets.clone(),
            keys: KeyMaterial::from_config(config),
            cloud_values,
            control_plane_endpoint,
            disaster_recovery: config.disaster_recovery().cloned(),
            obmondo_monitoring: config.obmondo_monitoring(),
        })
    }
}

handlebars_helper!(json: |value: Value| {
    serde_json::to_string(&value).unwrap_or_else(|_| "null".to_string())
});

handlebars_helper!(b64: |text: str| {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(text)
});

handlebars_helper!(indent: |width: u64, text: Value| {
    let padding = " ".repeat(usize::try_from(width).unwrap_or(0));
    text.as_str()
        .unwrap_or_default()
        .lines()
        .map(|line| if line.is_empty() { String::new() } else { format!("{padding}{line}") })
        .collect::<Vec<_>>()
        .join("\n")
});

handlebars_helper!(trim_v: |version: str| version.trim_start_matches('v').to_string());

/// The catalog, compiled once.
pub struct Renderer {
    handlebars: Handlebars<'static>,
}

impl Renderer {
    /// # Errors
    ///
    /// Returns [`Error::Config`] if an embedded template does not compile.
    pub fn new() -> Result<Self> {
        let mut handlebars = Handlebars::new();
        handlebars.register_escape_fn(handlebars::no_escape);
        handlebars.register_helper("json", Box::new(json));
        handlebars.register_helper("b64", Box::new(b64));
        handlebars.register_helper("indent", Box::new(indent));
        handlebars.register_helper("trim_v", Box::new(trim_v));

        handlebars
            .register_partial("app", APP_PARTIAL)
            .map_err(|e| Error::config(format!("invalid embedded template _app.yaml: {e}")))?;
        for (name, source) in CATALOG {
            handlebars
                .register_template_string(name, *source)
                .map_err(|e| Error::config(format!("invalid embedded template {name}: {e}")))?;
        }

        Ok(Self { handlebars })
    }

    /// # Errors
    ///
    /// Returns a template error if rendering fails.
    pub fn render(&self, name: &str, values: &TemplateValues) -> Result<String> {
        Ok(self.handlebars.render(name, values)?)
    }

    /// Render `names` below `cluster_dir`. Returns the written files.
    ///
    /// # Errors
    ///
    /// Returns an error if rendering or writing fails.
    pub fn render_all(
        &self,
        names: &[&str],
        values: &TemplateValues,
        cluster_dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        let mut written = Vec::with_capacity(names.len());
        for name in names {
            let destination = cluster_dir.join(destination(name, &values.cluster_name));
            let content = self.render(name, values)?;

            if let Some(parent) = destination.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&destination, content)?;
            debug!(path = %destination.display(), "Created file in KubeAid config fork");
            written.push(destination);
        }

        info!(count = written.len(), dir = %cluster_dir.display(), "Rendered KubeAid config files");
        Ok(written)
    }
}

/// Path of a rendered template below the cluster directory.
fn destination(name: &str, cluster_name: &str) -> String {
    if name == TEMPLATE_KUBE_PROMETHEUS_VARS {
        format!("{cluster_name}-vars.jsonnet")
    } else {
        name.to_string()
    }
}

/// Load a YAML file, let `edit` change it and write it back.
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed, edited or written.
pub fn update_yaml_file<F>(path: &Path, edit: F) -> Result<()>
where
    F: FnOnce(&mut serde_yaml::Value) -> Result<()>,
{
    let content = std::fs::read_to_string(path)?;
    let mut document: serde_yaml::Value = serde_yaml::from_str(&content)?;
    edit(&mut document)?;
    std::fs::write(path, serde_yaml::to_string(&document)?)?;
    debug!(path = %path.display(), "Updated YAML file");
    Ok(())
}

/// Set the value at `keys`, creating intermediate mappings.
///
/// # Errors
///
/// Returns [`Error::Config`] when a non-mapping sits on the path.
pub fn set_yaml_path(
    document: &mut serde_yaml::Value,
    keys: &[&str],
    value: serde_yaml::Value,
) -> Result<()> {
    let Some((last, parents)) = keys.split_last() else {
        *document = value;
        return Ok(());
    };

    let mut current = document;
    for key in parents {
        if current.is_null() {
            *current = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
        }
        let mapping = current
            .as_mapping_mut()
            .ok_or_else(|| Error::config(format!("expected a mapping above {key}")))?;
        current = mapping
            .entry(serde_yaml::Value::from(*key))
            .or_insert(serde_yaml::Value::Null);
    }

    if current.is_null() {
        *current = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
    }
    current
        .as_mapping_mut()
        .ok_or_else(|| Error::config(format!("expected a mapping above {last}")))?
        .insert(serde_yaml::Value::from(*last), value);
    Ok(())
}

/// Point Cilium at a recovered cluster's API server.
///
/// # Errors
///
/// Returns an error if the Cilium values file cannot be updated.
pub fn set_cilium_endpoint(cluster_dir: &Path, endpoint: &ApiEndpoint) -> Result<()> {
    update_yaml_file(&cluster_dir.join(TEMPLATE_VALUES_CILIUM), |document| {
        set_yaml_path(
            document,
            &["cilium", "k8sServiceHost"],
            serde_yaml::Value::from(endpoint.host.clone()),
        )?;
        set_yaml_path(
            document,
            &["cilium", "k8sServicePort"],
            serde_yaml::Value::from(endpoint.port),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> Config {
        let general: GeneralConfig = serde_yaml::from_str(
            r"
forkURLs:
  kubeaid:
    url: https://github.com/Obmondo/KubeAid
    version: 17.0.0
  kubeaidConfig:
    url: https://gitea.example.com/acme/kubeaid-config
    directory: smoke
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

    fn aws_config(disaster_recovery: bool) -> Config {
        let mut config = local_config();
        config.general.cloud.local = None;
        config.general.cloud.aws = Some(
            serde_yaml::from_str(
                r"
region: eu-west-1
sshKeyName: kubeaid
controlPlane:
  replicas: 3
  instanceType: t4g.medium
  ami:
    id: ami-0123
nodeGroups:
  - name: primary
    minSize: 1
    maxSize: 3
    instanceType: t4g.medium
    rootVolumeSize: 35
    sshKeyName: kubeaid
    ami:
      id: ami-0123
",
            )
            .unwrap(),
        );
        if disaster_recovery {
            config.general.cloud.disaster_recovery = Some(DisasterRecoveryConfig {
                velero_backups_bucket_name: "smoke-velero".into(),
                sealed_secrets_backups_bucket_name: "smoke-sealed-secrets".into(),
            });
        }
        config.cloud = CloudKind::Aws;
        config
    }

    #[test]
    fn test_every_selectable_template_is_embedded() {
        let names: Vec<&str> = CATALOG.iter().map(|(name, _)| *name).collect();
        let lists: &[&[&str]] = &[
            COMMON,
            COMMON_SECRET,
            CAPI_COMMON,
            CAPI_COMMON_SECRET,
            AWS,
            AWS_DISASTER_RECOVERY,
            AZURE,
            AZURE_SECRET,
            AZURE_CROSSPLANE,
            AZURE_CROSSPLANE_DISASTER_RECOVERY,
            AZURE_DISASTER_RECOVERY,
            AZURE_DISASTER_RECOVERY_SECRET,
            HCLOUD,
            HCLOUD_SECRET,
            HETZNER_BARE_METAL_SECRET,
            HETZNER_FAILOVER,
            HETZNER_FAILOVER_SECRET,
            CA_BUNDLE,
            MONITORING,
        ];
        for name in lists.iter().flat_map(|list| list.iter()) {
            assert!(names.contains(name), "{name} is not embedded");
        }
        Renderer::new().unwrap();
    }

    #[test]
    fn test_local_selection_has_no_capi() {
        let selection = select_templates(&local_config(), &Flags::default());
        assert!(selection.non_secret.contains(&"argocd-apps/templates/root.yaml"));
        assert!(!selection.non_secret.contains(&TEMPLATE_VALUES_CAPI_CLUSTER));
        assert_eq!(selection.secret, COMMON_SECRET);
    }

    #[test]
    fn test_aws_disaster_recovery_selection() {
        let without = select_templates(&aws_config(false), &Flags::default());
        assert!(!without.non_secret.contains(&"argocd-apps/templates/velero.yaml"));

        let with = select_templates(&aws_config(true), &Flags::default());
        assert!(with.non_secret.contains(&"argocd-apps/templates/velero.yaml"));
        assert!(with.non_secret.contains(&"argocd-apps/templates/ccm-aws.yaml"));
        assert!(with
            .secret
            .contains(&"sealed-secrets/capi-cluster/cloud-credentials.yaml"));
    }

    #[test]
    fn test_skipping_kube_prometheus_build_drops_monitoring() {
        let flags = Flags {
            skip_kube_prometheus_build: true,
            ..Flags::default()
        };
        let selection = select_templates(&local_config(), &flags);
        assert!(!selection.non_secret.contains(&TEMPLATE_KUBE_PROMETHEUS_VARS));
        assert!(!selection
            .non_secret
            .contains(&"argocd-apps/templates/kube-prometheus.yaml"));

        let selection = select_templates(&local_config(), &Flags::default());
        assert!(selection.non_secret.contains(&TEMPLATE_KUBE_PROMETHEUS_VARS));
    }

    #[test]
    fn test_ca_bundle_adds_k8s_configs_once() {
        let mut config = aws_config(true);
        config.general.git.ca_bundle = Some("-----BEGIN CERTIFICATE-----".into());
        let selection = select_templates(&config, &Flags::default());
        let count = selection
            .non_secret
            .iter()
            .filter(|name| **name == "argocd-apps/templates/k8s-configs.yaml")
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_render_all_writes_below_cluster_dir() {
        let config = local_config();
        let values = TemplateValues::new(
            &config,
            "cluster:\n  name: smoke\n".into(),
            CloudTemplateValues::default(),
            None,
        )
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let selection = select_templates(&config, &Flags::default());

        let renderer = Renderer::new().unwrap();
        let written = renderer
            .render_all(&selection.non_secret, &values, dir.path())
            .unwrap();
        assert!(written.contains(&dir.path().join("smoke-vars.jsonnet")));

        let root = std::fs::read_to_string(dir.path().join("argocd-apps/templates/root.yaml")).unwrap();
        let root: serde_yaml::Value = serde_yaml::from_str(&root).unwrap();
        assert_eq!(root["spec"]["source"]["path"], "k8s/smoke/argocd-apps");

        let app = std::fs::read_to_string(dir.path().join("argocd-apps/templates/cert-manager.yaml"))
            .unwrap();
        let app: serde_yaml::Value = serde_yaml::from_str(&app).unwrap();
        assert_eq!(app["spec"]["sources"][0]["targetRevision"], "17.0.0");
        assert_eq!(
            app["spec"]["sources"][0]["helm"]["valueFiles"][0],
            "$values/k8s/smoke/argocd-apps/values-cert-manager.yaml"
        );

        let secret = renderer
            .render("sealed-secrets/argocd/kubeaid-config.yaml", &values)
            .unwrap();
        let secret: serde_yaml::Value = serde_yaml::from_str(&secret).unwrap();
        assert_eq!(secret["kind"], "Secret");
        assert_eq!(secret["stringData"]["url"], "https://gitea.example.com/acme/kubeaid-config");
    }

    #[test]
    fn test_aws_capi_values_are_valid_yaml() {
        let config = aws_config(true);
        let values = TemplateValues::new(
            &config,
            String::new(),
            CloudTemplateValues {
                aws_account_id: Some("123456789012".into()),
                aws_b64_encoded_credentials: Some("W2RlZmF1bHRd".into()),
                ..CloudTemplateValues::default()
            },
            None,
        )
        .unwrap();

        let renderer = Renderer::new().unwrap();
        let rendered = renderer.render(TEMPLATE_VALUES_CAPI_CLUSTER, &values).unwrap();
        let document: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(document["aws"]["controlPlane"]["ami"]["id"], "ami-0123");
        assert_eq!(document["global"]["kubernetes"]["version"], "v1.30.0");

        let credentials = renderer
            .render("sealed-secrets/capi-cluster/cloud-credentials.yaml", &values)
            .unwrap();
        let credentials: serde_yaml::Value = serde_yaml::from_str(&credentials).unwrap();
        assert_eq!(credentials["metadata"]["namespace"], "capi-cluster");
        assert_eq!(
            credentials["stringData"]["AWS_B64ENCODED_CREDENTIALS"],
            "W2RlZmF1bHRd"
        );
    }

    #[test]
    fn test_set_cilium_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(TEMPLATE_VALUES_CILIUM);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "cilium:\n  kubeProxyReplacement: true\n").unwrap();

        set_cilium_endpoint(
            dir.path(),
            &ApiEndpoint {
                host: "10.0.0.10".into(),
                port: 6443,
            },
        )
        .unwrap();

        let document: serde_yaml::Value =
            serde_yaml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(document["cilium"]["k8sServiceHost"], "10.0.0.10");
        assert_eq!(document["cilium"]["k8sServicePort"], 6443);
        assert_eq!(document["cilium"]["kubeProxyReplacement"], true);
    }
}
