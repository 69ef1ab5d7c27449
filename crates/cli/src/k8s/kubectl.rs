//! `kubectl` for the operations the typed client does not cover: applying arbitrary
//! multi-document manifests and replacing key material.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use kubeaid_cloud::{run_checked, CommandRunner, Invocation};
use tracing::info;

use crate::error::Result;

/// `kubectl` bound to one kubeconfig.
#[derive(Clone)]
pub struct Kubectl {
    runner: Arc<dyn CommandRunner>,
    kubeconfig: PathBuf,
}

impl Kubectl {
    pub fn new(runner: Arc<dyn CommandRunner>, kubeconfig: &Path) -> Self {
        Self {
            runner,
            kubeconfig: kubeconfig.to_path_buf(),
        }
    }

    fn invocation<I, S>(&self, args: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Invocation::new("kubectl")
            .args(["--kubeconfig".to_string(), self.kubeconfig.display().to_string()])
            .args(args)
    }

    async fn run<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Ok(run_checked(self.runner.as_ref(), self.invocation(args)).await?)
    }

    /// Apply a manifest file, directory or URL.
    ///
    /// # Errors
    ///
    /// Returns an error if `kubectl apply` fails.
    pub async fn apply(&self, source: &str) -> Result<()> {
        self.run(["apply", "-f", source]).await?;
        info!(source = %source, "Applied manifests");
        Ok(())
    }

    /// Recreate every object under `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if `kubectl replace` fails.
    pub async fn replace_force(&self, path: &Path) -> Result<()> {
        let path = path.display().to_string();
        self.run(["replace", "--force", "-f", path.as_str()]).await?;
        info!(path = %path, "Replaced objects");
        Ok(())
    }

    /// Label a namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if `kubectl label` fails.
    pub async fn label_namespace(&self, namespace: &str, label: &str) -> Result<()> {
        self.run(["label", "--overwrite", "namespace", namespace, label])
            .await?;
        Ok(())
    }

    /// Set a label on a cluster-scoped object, e.g. `crd/appprojects.argoproj.io`.
    ///
    /// # Errors
    ///
    /// Returns an error if `kubectl label` fails.
    pub async fn label(&self, resource: &str, label: &str) -> Result<()> {
        self.run(["label", "--overwrite", resource, label]).await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if `kubectl annotate` fails.
    pub async fn annotate(&self, resource: &str, annotation: &str) -> Result<()> {
        self.run(["annotate", "--overwrite", resource, annotation])
            .await?;
        Ok(())
    }

    /// Run an arbitrary `kubectl` subcommand and return its stdout.
    ///
    /// # Errors
    ///
    /// Returns an error if `kubectl` exits unsuccessfully.
    pub async fn exec(&self, args: &[&str]) -> Result<String> {
        self.run(args.iter().copied()).await
    }

    /// Wait for `condition` on `resource` in `namespace`.
    ///
    /// # Errors
    ///
    /// Returns an error if the condition is not met within `timeout`.
    pub async fn wait(
        &self,
        namespace: &str,
        resource: &str,
        condition: &str,
        timeout: &str,
    ) -> Result<()> {
        let condition = format!("--for={condition}");
        let timeout = format!("--timeout={timeout}");
        self.run([
            "wait",
            "-n",
            namespace,
            resource,
            condition.as_str(),
            timeout.as_str(),
        ])
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubeaid_cloud::{CommandOutput, MockCommandRunner};

    #[tokio::test]
    async fn test_failure_carries_stderr() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_| {
            Ok(CommandOutput {
                status: 1,
                stdout: String::new(),
                stderr: "error: the server doesn't have a resource type \"foo\"".into(),
            })
        });

        let kubectl = Kubectl::new(Arc::new(runner), Path::new("kubeconfig"));
        let err = kubectl.apply("foo.yaml").await.unwrap_err();
        assert!(err.to_string().contains("resource type"));
    }
}
