//! Local clones of KubeAid and the KubeAid config fork.

use std::path::{Path, PathBuf};

use kubeaid_cloud::{run_checked, Invocation};
use tracing::info;

use crate::config::{Config, GENERAL_CONFIG_FILE};
use crate::error::Result;
use crate::git::{is_public, Git, Repo};
use crate::session::Session;
use crate::templates::{ApiEndpoint, CloudTemplateValues, TemplateValues};

/// Both clones a workflow step works with.
pub struct Checkouts {
    /// KubeAid checked out at the configured version tag.
    pub kubeaid_dir: PathBuf,
    pub config_repo: ConfigRepo,
}

impl Checkouts {
    /// Clone (or reuse the clones of) KubeAid and the KubeAid config fork.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Auth`] when a remote rejects the credentials.
    pub async fn prepare(session: &Session) -> Result<Self> {
        let git = session.git()?;
        let forks = &session.config.general.forks;

        let authenticated =
            !is_public(&forks.kubeaid.url, session.config.general.git.ca_bundle.as_deref()).await?;
        let kubeaid = git
            .clone_or_open(&forks.kubeaid.url, Some(&forks.kubeaid.version), authenticated)
            .await?;

        let config_repo = ConfigRepo::open(git, &forks.kubeaid_config.url).await?;
        Ok(Self {
            kubeaid_dir: kubeaid.dir,
            config_repo,
        })
    }

    #[must_use]
    pub fn cluster_dir(&self, config: &Config) -> PathBuf {
        self.config_repo.cluster_dir(config)
    }
}

/// The KubeAid config fork and the branch changes go to.
pub struct ConfigRepo {
    git: Git,
    pub repo: Repo,
    pub branch: String,
}

impl ConfigRepo {
    async fn open(git: Git, url: &str) -> Result<Self> {
        let repo = git.clone_or_open(url, None, true).await?;
        let branch = repo.default_branch.clone();
        Ok(Self { git, repo, branch })
    }

    /// `k8s/<cluster directory>` inside the clone.
    #[must_use]
    pub fn cluster_dir(&self, config: &Config) -> PathBuf {
        self.repo.dir.join(cluster_pathspec(config))
    }

    /// Check out the branch the next commit lands on.
    ///
    /// With the PR workflow a fresh `kubeaid-<cluster>-<unix timestamp>` branch is created,
    /// otherwise the default branch is written to directly.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::StatePrecondition`] if the branch already exists.
    pub async fn start_change(&mut self, session: &Session) -> Result<()> {
        if session.flags.skip_pr_workflow {
            self.git.checkout_default(&self.repo).await?;
            self.branch = self.repo.default_branch.clone();
            return Ok(());
        }

        let branch = change_branch(session.cluster_name(), chrono::Utc::now().timestamp());
        self.git.create_branch(&self.repo, &branch).await?;
        self.branch = branch;
        Ok(())
    }

    /// Commit everything under the cluster directory and push it. On a PR branch, block until
    /// the change is merged, then return to the default branch.
    ///
    /// # Errors
    ///
    /// Returns an error if committing, pushing or waiting fails.
    pub async fn publish(&self, config: &Config, message: &str) -> Result<()> {
        let commit = self
            .git
            .commit_and_push(&self.repo, &self.branch, &cluster_pathspec(config), message)
            .await?;

        if self.branch != self.repo.default_branch {
            self.git.wait_for_merge(&self.repo, &self.branch, &commit).await?;
            self.git.checkout_default(&self.repo).await?;
        }
        Ok(())
    }
}

fn cluster_pathspec(config: &Config) -> String {
    format!("k8s/{}", config.cluster_directory())
}

fn change_branch(cluster: &str, timestamp: i64) -> String {
    format!("kubeaid-{cluster}-{timestamp}")
}

/// Commit message for a change to the cluster's config files.
#[must_use]
pub fn commit_message(cluster: &str, change: &str) -> String {
    format!("(cluster/{cluster}) : {change}")
}

/// Values the templates render with, reading `general.yaml` verbatim for embedding.
///
/// # Errors
///
/// Returns an error if `general.yaml` cannot be read.
pub fn template_values(
    session: &Session,
    cloud_values: CloudTemplateValues,
    endpoint: Option<ApiEndpoint>,
) -> Result<TemplateValues> {
    let contents = std::fs::read_to_string(session.config.configs_dir.join(GENERAL_CONFIG_FILE))?;
    TemplateValues::new(&session.config, contents, cloud_values, endpoint)
}

/// Generate the kube-prometheus manifests for the cluster with KubeAid's build script.
///
/// # Errors
///
/// Returns an error if the script fails.
pub async fn build_kube_prometheus(
    session: &Session,
    kubeaid_dir: &Path,
    cluster_dir: &Path,
) -> Result<()> {
    let script = kubeaid_dir.join("build/kube-prometheus/build.sh");
    info!(script = %script.display(), "Building kube-prometheus manifests");

    let invocation =
        Invocation::new(script.display().to_string()).args([cluster_dir.display().to_string()]);
    run_checked(session.runner.as_ref(), invocation).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;

    const GENERAL: &str = r"
forkURLs:
  kubeaid:
    url: https://github.com/Obmondo/KubeAid
    version: 19.0.0
  kubeaidConfig:
    url: https://gitea.example.com/acme/kubeaid-config
    directory: demo
cluster:
  name: kubeaid-demo
  k8sVersion: v1.31.0
cloud:
  local: {}
";

    #[test]
    fn test_change_branch_name() {
        assert_eq!(
            change_branch("kubeaid-demo", 1_760_000_000),
            "kubeaid-kubeaid-demo-1760000000"
        );
    }

    #[test]
    fn test_commit_message() {
        assert_eq!(
            commit_message("kubeaid-demo", "created / updated KubeAid config files"),
            "(cluster/kubeaid-demo) : created / updated KubeAid config files"
        );
    }

    #[test]
    fn test_cluster_pathspec() {
        let config = test_config(GENERAL, "");
        assert_eq!(cluster_pathspec(&config), "k8s/demo");
    }
}
