//! Idempotent Helm chart installs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use kubeaid_cloud::{run_checked, CloudProviderError, CommandRunner, Invocation};
use serde::Deserialize;
use tracing::{info, warn};

use crate::constants::HELM_TIMEOUT;
use crate::error::Result;
use crate::state::{retry_transient, RetryConfig};

/// Where a chart comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChartSource {
    /// A chart in a remote repository.
    Repo {
        url: String,
        name: String,
        version: String,
    },
    /// An unpacked chart directory, e.g. inside the KubeAid clone.
    Path(PathBuf),
}

/// A release to install.
#[derive(Debug, Clone)]
pub struct HelmRelease {
    pub name: String,
    pub namespace: String,
    pub chart: ChartSource,
    /// Values YAML, fed through stdin.
    pub values: Option<String>,
}

/// Release states reported by `helm status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseStatus {
    Deployed,
    PendingInstall,
    Other,
}

#[derive(Deserialize)]
struct StatusOutput {
    info: StatusInfo,
}

#[derive(Deserialize)]
struct StatusInfo {
    status: String,
}

/// `helm` bound to one kubeconfig.
#[derive(Clone)]
pub struct Helm {
    runner: Arc<dyn CommandRunner>,
    kubeconfig: PathBuf,
    retry: RetryConfig,
}

impl Helm {
    pub fn new(runner: Arc<dyn CommandRunner>, kubeconfig: &Path) -> Self {
        Self {
            runner,
            kubeconfig: kubeconfig.to_path_buf(),
            retry: RetryConfig::default(),
        }
    }

    fn invocation(&self, args: &[&str]) -> Invocation {
        Invocation::new("helm")
            .args(["--kubeconfig".to_string(), self.kubeconfig.display().to_string()])
            .args(args.iter().copied())
    }

    /// State of an existing release, `None` when there is none.
    ///
    /// # Errors
    ///
    /// Returns an error if `helm status` fails for a reason other than a missing release.
    pub async fn status(&self, release: &str, namespace: &str) -> Result<Option<ReleaseStatus>> {
        let invocation = self.invocation(&["status", release, "-n", namespace, "-o", "json"]);
        let output = match run_checked(self.runner.as_ref(), invocation).await {
            Ok(output) => output,
            Err(CloudProviderError::Command { stderr, .. }) if stderr.contains("not found") => {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let status: StatusOutput = serde_json::from_str(&output)?;
        Ok(Some(match status.info.status.as_str() {
            "deployed" => ReleaseStatus::Deployed,
            "pending-install" => ReleaseStatus::PendingInstall,
            _ => ReleaseStatus::Other,
        }))
    }

    /// Install `release` unless it is already deployed.
    ///
    /// A release stuck in `pending-install` is uninstalled first. The release state is read
    /// again before every retry, since a timed out install may have left one behind.
    ///
    /// # Errors
    ///
    /// Returns an error if the install fails after retries.
    pub async fn install(&self, release: &HelmRelease) -> Result<()> {
        info!(release = %release.name, namespace = %release.namespace, "Installing Helm chart");
        let installed = retry_transient(&self.retry, "helm install", || self.install_once(release)).await?;

        if installed {
            info!(release = %release.name, "Installed Helm chart");
        }
        Ok(())
    }

    /// One install attempt, `false` when the release was already deployed.
    async fn install_once(&self, release: &HelmRelease) -> Result<bool> {
        match self.status(&release.name, &release.namespace).await? {
            Some(ReleaseStatus::Deployed) => {
                info!(release = %release.name, namespace = %release.namespace, "Helm release already deployed, skipping");
                return Ok(false);
            }
            Some(ReleaseStatus::PendingInstall) => {
                warn!(release = %release.name, "Removing Helm release stuck in pending-install");
                self.uninstall(&release.name, &release.namespace).await?;
            }
            Some(ReleaseStatus::Other) | None => {}
        }

        run_checked(self.runner.as_ref(), self.install_invocation(release)).await?;
        Ok(true)
    }

    fn install_invocation(&self, release: &HelmRelease) -> Invocation {
        let mut args: Vec<String> = vec!["install".into(), release.name.clone()];
        match &release.chart {
            ChartSource::Repo { url, name, version } => args.extend([
                name.clone(),
                "--repo".into(),
                url.clone(),
                "--version".into(),
                version.clone(),
            ]),
            ChartSource::Path(path) => args.push(path.display().to_string()),
        }
        args.extend([
            "-n".into(),
            release.namespace.clone(),
            "--create-namespace".into(),
            "--wait".into(),
            "--timeout".into(),
            HELM_TIMEOUT.into(),
        ]);

        let mut invocation = Invocation::new("helm")
            .args(["--kubeconfig".to_string(), self.kubeconfig.display().to_string()])
            .args(args);
        if let Some(values) = &release.values {
            invocation = invocation.args(["-f", "-"]).stdin(values.clone());
        }
        invocation
    }

    /// # Errors
    ///
    /// Returns an error if `helm uninstall` fails.
    pub async fn uninstall(&self, release: &str, namespace: &str) -> Result<()> {
        let invocation = self.invocation(&[
            "uninstall",
            release,
            "-n",
            namespace,
            "--wait",
            "--timeout",
            HELM_TIMEOUT,
        ]);
        run_checked(self.runner.as_ref(), invocation).await?;
        info!(release = %release, "Uninstalled Helm release");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubeaid_cloud::{CommandOutput, MockCommandRunner};
    use mockall::Sequence;

    fn ok(stdout: &str) -> CommandOutput {
        CommandOutput {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    fn release() -> HelmRelease {
        HelmRelease {
            name: "sealed-secrets".into(),
            namespace: "sealed-secrets".into(),
            chart: ChartSource::Path(PathBuf::from("/tmp/kubeaid/argocd-helm-charts/sealed-secrets")),
            values: Some("fullnameOverride: sealed-secrets-controller\n".into()),
        }
    }

    fn is(invocation: &Invocation, verb: &str) -> bool {
        invocation.args.get(2).map(String::as_str) == Some(verb)
    }

    #[tokio::test]
    async fn test_deployed_release_is_skipped() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|i| is(i, "status"))
            .times(1)
            .returning(|_| Ok(ok(r#"{"info":{"status":"deployed"}}"#)));

        let helm = Helm::new(Arc::new(runner), Path::new("host.yaml"));
        helm.install(&release()).await.unwrap();
    }

    #[tokio::test]
    async fn test_pending_install_is_reinstalled() {
        let mut seq = Sequence::new();
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|i| is(i, "status"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ok(r#"{"info":{"status":"pending-install"}}"#)));
        runner
            .expect_run()
            .withf(|i| is(i, "uninstall"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ok("")));
        runner
            .expect_run()
            .withf(|i| {
                is(i, "install")
                    && i.args.contains(&"--create-namespace".to_string())
                    && i.args.contains(&"10m".to_string())
                    && i.stdin.is_some()
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ok("")));

        let helm = Helm::new(Arc::new(runner), Path::new("host.yaml"));
        helm.install(&release()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_release_installs_with_retry() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|i| is(i, "status"))
            .returning(|_| {
                Ok(CommandOutput {
                    status: 1,
                    stdout: String::new(),
                    stderr: "Error: release: not found".into(),
                })
            });
        let mut attempts = 0;
        runner
            .expect_run()
            .withf(|i| is(i, "install"))
            .times(2)
            .returning(move |_| {
                attempts += 1;
                if attempts == 1 {
                    Ok(CommandOutput {
                        status: 1,
                        stdout: String::new(),
                        stderr: "Error: looks like the repo is not reachable: i/o timeout".into(),
                    })
                } else {
                    Ok(ok(""))
                }
            });

        let helm = Helm::new(Arc::new(runner), Path::new("host.yaml"));
        let mut release = release();
        release.chart = ChartSource::Repo {
            url: "https://argoproj.github.io/argo-helm".into(),
            name: "argo-cd".into(),
            version: "7.7.0".into(),
        };
        helm.install(&release).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_install_is_cleaned_up_before_retry() {
        let mut seq = Sequence::new();
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|i| is(i, "status"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(CommandOutput {
                    status: 1,
                    stdout: String::new(),
                    stderr: "Error: release: not found".into(),
                })
            });
        runner
            .expect_run()
            .withf(|i| is(i, "install"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(CommandOutput {
                    status: 1,
                    stdout: String::new(),
                    stderr: "Error: context deadline exceeded: i/o timeout".into(),
                })
            });
        runner
            .expect_run()
            .withf(|i| is(i, "status"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ok(r#"{"info":{"status":"pending-install"}}"#)));
        runner
            .expect_run()
            .withf(|i| is(i, "uninstall"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ok("")));
        runner
            .expect_run()
            .withf(|i| is(i, "install"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ok("")));

        let helm = Helm::new(Arc::new(runner), Path::new("host.yaml"));
        helm.install(&release()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_deployed_by_timed_out_install_is_not_reinstalled() {
        let mut seq = Sequence::new();
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|i| is(i, "status"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ok(r#"{"info":{"status":"failed"}}"#)));
        runner
            .expect_run()
            .withf(|i| is(i, "install"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(CommandOutput {
                    status: 1,
                    stdout: String::new(),
                    stderr: "Error: i/o timeout".into(),
                })
            });
        runner
            .expect_run()
            .withf(|i| is(i, "status"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(ok(r#"{"info":{"status":"deployed"}}"#)));

        let helm = Helm::new(Arc::new(runner), Path::new("host.yaml"));
        helm.install(&release()).await.unwrap();
    }
}
