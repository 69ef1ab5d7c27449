//! Reading, defaulting and hydrating the two config documents.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info, warn};

use super::audit::hydrate_audit_logging;
use super::model::GeneralConfig;
use super::secrets::{AwsCredentials, SecretsConfig};
use super::ssh::{hydrate_key_pair, hydrate_private_key};
use super::validate::{validate, K8sVersion};
use super::{CloudKind, Config};
use crate::constants::{
    ENV_AWS_ACCESS_KEY_ID, ENV_AWS_PROFILE, ENV_AWS_SECRET_ACCESS_KEY, ENV_AWS_SESSION_TOKEN,
    K8S_STABLE_VERSION_URL, KUBEAID_LATEST_RELEASE_URL,
};
use crate::error::{Error, Result};

pub const GENERAL_CONFIG_FILE: &str = "general.yaml";
pub const SECRETS_CONFIG_FILE: &str = "secrets.yaml";

const USER_AGENT: &str = concat!("kubeaid-cli/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Deserialize)]
struct GitHubRelease {
    tag_name: String,
}

/// Turns a configs directory into a validated [`Config`].
#[derive(Debug, Clone)]
pub struct ConfigParser {
    http: reqwest::Client,
    stable_version_url: String,
    latest_release_url: String,
}

impl Default for ConfigParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigParser {
    #[must_use]
    pub fn new() -> Self {
        Self::with_urls(K8S_STABLE_VERSION_URL, KUBEAID_LATEST_RELEASE_URL)
    }

    /// Parser that looks up the stable Kubernetes version and the latest KubeAid release at
    /// custom URLs.
    #[must_use]
    pub fn with_urls(stable_version_url: &str, latest_release_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            stable_version_url: stable_version_url.to_string(),
            latest_release_url: latest_release_url.to_string(),
        }
    }

    /// Parse `general.yaml` and `secrets.yaml` under `configs_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for unreadable, malformed or invalid documents, and HTTP
    /// errors when the remote version lookups fail.
    pub async fn parse(&self, configs_dir: &Path) -> Result<Config> {
        let (mut general, mut secrets) = read_documents(configs_dir)?;

        apply_cluster_defaults(&mut general);
        let cloud = CloudKind::detect(&general.cloud)?;
        debug!(cloud = %cloud, "Detected cloud provider");

        hydrate(&mut general, &mut secrets, cloud)?;

        if general.forks.kubeaid.version.trim().is_empty() {
            general.forks.kubeaid.version = self.latest_kubeaid_version().await?;
            info!(version = %general.forks.kubeaid.version, "Using latest KubeAid release");
        }

        let latest_stable = self.latest_stable_k8s_version().await?;
        validate(&general, &secrets, cloud, latest_stable)?;

        Ok(Config {
            general,
            secrets,
            cloud,
            configs_dir: configs_dir.to_path_buf(),
            latest_stable_k8s_version: latest_stable,
        })
    }

    async fn latest_stable_k8s_version(&self) -> Result<K8sVersion> {
        let body = self
            .http
            .get(&self.stable_version_url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        K8sVersion::parse(&body)
    }

    async fn latest_kubeaid_version(&self) -> Result<String> {
        let release: GitHubRelease = self
            .http
            .get(&self.latest_release_url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(release.tag_name)
    }
}

fn read_document<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::config(format!("failed reading {}: {e}", path.display())))?;
    serde_yaml::from_str(&content)
        .map_err(|e| Error::config(format!("failed parsing {}: {e}", path.display())))
}

/// Deserialize both documents without hydration or validation.
///
/// # Errors
///
/// Returns [`Error::Config`] when a file is missing or malformed.
pub fn read_documents(configs_dir: &Path) -> Result<(GeneralConfig, SecretsConfig)> {
    let general = read_document(&configs_dir.join(GENERAL_CONFIG_FILE))?;
    let secrets = read_document(&configs_dir.join(SECRETS_CONFIG_FILE))?;
    Ok((general, secrets))
}

fn apply_cluster_defaults(general: &mut GeneralConfig) {
    let cluster_name = general.cluster.name.trim().to_lowercase();
    general.cluster.name.clone_from(&cluster_name);

    if general.forks.kubeaid_config.directory.trim().is_empty() {
        general.forks.kubeaid_config.directory = cluster_name;
    }
}

/// Load everything the documents only reference by path, and fill derived defaults.
fn hydrate(general: &mut GeneralConfig, secrets: &mut SecretsConfig, cloud: CloudKind) -> Result<()> {
    if let Some(path) = &general.git.ca_bundle_path {
        let bundle = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed reading CA bundle {}: {e}", path.display()))
        })?;
        general.git.ca_bundle = Some(bundle);
    }

    if let Some(path) = general.git.private_key_file_path.clone() {
        let mut key = super::model::SshPrivateKeyConfig {
            private_key_file_path: path,
            private_key: String::new(),
        };
        hydrate_private_key(&mut key)?;
        general.git.private_key = Some(key.private_key);
    }

    if let Some(azure) = general.cloud.azure.as_mut() {
        hydrate_key_pair(&mut azure.workload_identity.openid_provider_ssh_key_pair)?;
    }

    if let Some(bare_metal) = general
        .cloud
        .hetzner
        .as_mut()
        .and_then(|hetzner| hetzner.bare_metal.as_mut())
    {
        hydrate_key_pair(&mut bare_metal.ssh_key_pair.key_pair)?;
    }

    if let Some(bare_metal) = general.cloud.bare_metal.as_mut() {
        if let Some(key) = bare_metal.ssh.private_key.as_mut() {
            hydrate_private_key(key)?;
        }
        let hosts = bare_metal
            .control_plane
            .hosts
            .iter_mut()
            .chain(bare_metal.node_groups.iter_mut().flat_map(|ng| ng.hosts.iter_mut()));
        for host in hosts {
            if let Some(key) = host.ssh.as_mut().and_then(|ssh| ssh.private_key.as_mut()) {
                hydrate_private_key(key)?;
            }
        }
    }

    hydrate_audit_logging(&mut general.cluster);

    if cloud == CloudKind::Aws && secrets.aws.is_none() {
        secrets.aws = ambient_aws_credentials();
        if secrets.aws.is_some() {
            info!("Using AWS credentials from the environment");
        }
    }
    Ok(())
}

/// AWS credentials from the environment, falling back to the shared credentials file.
#[must_use]
pub fn ambient_aws_credentials() -> Option<AwsCredentials> {
    let from_env = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());

    if let (Some(access_key_id), Some(secret_access_key)) = (
        from_env(ENV_AWS_ACCESS_KEY_ID),
        from_env(ENV_AWS_SECRET_ACCESS_KEY),
    ) {
        return Some(AwsCredentials {
            access_key_id,
            secret_access_key,
            session_token: from_env(ENV_AWS_SESSION_TOKEN),
        });
    }

    let path = shared_credentials_path()?;
    let content = std::fs::read_to_string(&path).ok()?;
    let profile = from_env(ENV_AWS_PROFILE).unwrap_or_else(|| "default".to_string());

    let credentials = parse_shared_credentials(&content, &profile);
    if credentials.is_none() {
        warn!(path = %path.display(), profile = %profile, "No usable AWS credentials in profile");
    }
    credentials
}

fn shared_credentials_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".aws").join("credentials"))
}

/// Read one profile out of an INI style `~/.aws/credentials` file.
fn parse_shared_credentials(content: &str, profile: &str) -> Option<AwsCredentials> {
    let mut in_profile = false;
    let mut access_key_id = None;
    let mut secret_access_key = None;
    let mut session_token = None;

    for line in content.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            in_profile = section.trim() == profile;
            continue;
        }
        if !in_profile {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().to_string();
        match key.trim() {
            "aws_access_key_id" => access_key_id = Some(value),
            "aws_secret_access_key" => secret_access_key = Some(value),
            "aws_session_token" => session_token = Some(value),
            _ => {}
        }
    }

    Some(AwsCredentials {
        access_key_id: access_key_id?,
        secret_access_key: secret_access_key?,
        session_token,
    })
}

#[cfg(test)]
mod tests {
    use serial_test::serial;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::config::ssh::tests::ED25519_PUBLIC_KEY;

    const LOCAL_GENERAL: &str = r"
forkURLs:
  kubeaid:
    version: 19.0.0
  kubeaidConfig:
    url: https://github.com/example/kubeaid-config
cluster:
  name: Smoke
  k8sVersion: v1.30.0
cloud:
  local: {}
";

    const AWS_GENERAL: &str = r"
forkURLs:
  kubeaid:
    version: 19.0.0
  kubeaidConfig:
    url: https://github.com/example/kubeaid-config
cluster:
  name: foo
  k8sVersion: v1.31.2
cloud:
  aws:
    region: eu-west-1
    sshKeyName: kubeaid
    controlPlane:
      replicas: 3
      instanceType: t4g.medium
      ami:
        id: ami-OLD
    nodeGroups:
      - name: workers
        minSize: 1
        maxSize: 3
        instanceType: t4g.medium
        rootVolumeSize: 35
        sshKeyName: kubeaid
        ami:
          id: ami-OLD
        labels:
          node-role.kubernetes.io/worker: ''
";

    async fn stable_server(version: &str) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/stable.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!("{version}\n")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/releases/latest"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "tag_name": "20.1.0" })),
            )
            .mount(&server)
            .await;
        server
    }

    fn parser(server: &MockServer) -> ConfigParser {
        ConfigParser::with_urls(
            &format!("{}/stable.txt", server.uri()),
            &format!("{}/releases/latest", server.uri()),
        )
    }

    fn write_configs(general: &str, secrets: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(GENERAL_CONFIG_FILE), general).unwrap();
        std::fs::write(dir.path().join(SECRETS_CONFIG_FILE), secrets).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_parse_local_applies_defaults() {
        let server = stable_server("v1.33.1").await;
        let dir = write_configs(LOCAL_GENERAL, "{}\n");

        let config = parser(&server).parse(dir.path()).await.unwrap();

        assert_eq!(config.cloud, CloudKind::Local);
        assert_eq!(config.cluster_name(), "smoke");
        assert_eq!(config.general.forks.kubeaid_config.directory, "smoke");
        assert_eq!(config.general.git.ssh_username, "git");
        assert!(config.general.cluster.enable_audit_logging);
        assert_eq!(config.general.cluster.api_server.extra_volumes.len(), 2);
    }

    #[tokio::test]
    async fn test_parse_is_idempotent() {
        let server = stable_server("v1.33.1").await;
        let dir = write_configs(LOCAL_GENERAL, "git:\n  username: bot\n  password: secret\n");

        let first = parser(&server).parse(dir.path()).await.unwrap();

        let reserialized = write_configs(
            &serde_yaml::to_string(&first.general).unwrap(),
            &serde_yaml::to_string(&first.secrets).unwrap(),
        );
        let second = parser(&server).parse(reserialized.path()).await.unwrap();

        assert_eq!(first.general, second.general);
        assert_eq!(first.secrets, second.secrets);
    }

    #[tokio::test]
    async fn test_blank_kubeaid_version_uses_latest_release() {
        let server = stable_server("v1.33.1").await;
        let general = LOCAL_GENERAL.replace("    version: 19.0.0\n", "");
        let dir = write_configs(&general, "{}\n");

        let config = parser(&server).parse(dir.path()).await.unwrap();
        assert_eq!(config.general.forks.kubeaid.version, "20.1.0");
    }

    #[tokio::test]
    async fn test_k8s_version_newer_than_stable_rejected() {
        let server = stable_server("v1.29.9").await;
        let dir = write_configs(LOCAL_GENERAL, "{}\n");

        let err = parser(&server).parse(dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_dotted_cluster_name_rejected() {
        let server = stable_server("v1.33.1").await;
        let dir = write_configs(&LOCAL_GENERAL.replace("Smoke", "smoke.prod"), "{}\n");

        let err = parser(&server).parse(dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("dots"));
    }

    #[tokio::test]
    async fn test_missing_cloud_rejected() {
        let server = stable_server("v1.33.1").await;
        let dir = write_configs(&LOCAL_GENERAL.replace("  local: {}\n", "  {}\n"), "{}\n");

        let err = parser(&server).parse(dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("cloud"));
    }

    #[tokio::test]
    async fn test_additional_user_ubuntu_rejected() {
        let server = stable_server("v1.33.1").await;
        let general = LOCAL_GENERAL.replace(
            "  k8sVersion: v1.30.0\n",
            &format!(
                "  k8sVersion: v1.30.0\n  additionalUsers:\n    - name: ubuntu\n      sshPublicKey: {ED25519_PUBLIC_KEY}\n"
            ),
        );
        let dir = write_configs(&general, "{}\n");

        let err = parser(&server).parse(dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("ubuntu"));
    }

    #[tokio::test]
    #[serial]
    async fn test_aws_credentials_from_environment() {
        let server = stable_server("v1.33.1").await;
        let dir = write_configs(AWS_GENERAL, "{}\n");

        std::env::set_var(ENV_AWS_ACCESS_KEY_ID, "AKIAEXAMPLE");
        std::env::set_var(ENV_AWS_SECRET_ACCESS_KEY, "secret");
        std::env::remove_var(ENV_AWS_SESSION_TOKEN);

        let result = parser(&server).parse(dir.path()).await;

        std::env::remove_var(ENV_AWS_ACCESS_KEY_ID);
        std::env::remove_var(ENV_AWS_SECRET_ACCESS_KEY);

        let config = result.unwrap();
        let credentials = config.secrets.aws.unwrap();
        assert_eq!(credentials.access_key_id, "AKIAEXAMPLE");
        assert_eq!(credentials.session_token, None);
    }

    #[tokio::test]
    #[serial]
    async fn test_aws_without_any_credentials_rejected() {
        let server = stable_server("v1.33.1").await;
        let dir = write_configs(AWS_GENERAL, "{}\n");
        let home = TempDir::new().unwrap();

        let previous_home = std::env::var("HOME").ok();
        std::env::set_var("HOME", home.path());
        std::env::remove_var(ENV_AWS_ACCESS_KEY_ID);
        std::env::remove_var(ENV_AWS_SECRET_ACCESS_KEY);

        let result = parser(&server).parse(dir.path()).await;

        if let Some(previous) = previous_home {
            std::env::set_var("HOME", previous);
        }

        let err = result.unwrap_err();
        assert!(err.to_string().contains("AWS credentials"));
    }

    #[test]
    fn test_shared_credentials_profiles() {
        let content = r"
[default]
aws_access_key_id = AKIADEFAULT
aws_secret_access_key = default-secret

# staging account
[staging]
aws_access_key_id=AKIASTAGING
aws_secret_access_key=staging-secret
aws_session_token=token
";
        let default = parse_shared_credentials(content, "default").unwrap();
        assert_eq!(default.access_key_id, "AKIADEFAULT");
        assert_eq!(default.session_token, None);

        let staging = parse_shared_credentials(content, "staging").unwrap();
        assert_eq!(staging.secret_access_key, "staging-secret");
        assert_eq!(staging.session_token.as_deref(), Some("token"));

        assert!(parse_shared_credentials(content, "prod").is_none());
    }
}
