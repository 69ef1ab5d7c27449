//! Sealing rendered `Secret` manifests with a cluster's sealed-secrets controller.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kubeaid_cloud::{run_checked, CommandRunner, Invocation};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::constants::{NAMESPACE_SEALED_SECRETS, SEALED_SECRETS_CONTROLLER};
use crate::error::{Error, Result};
use crate::k8s::Kubectl;

const KIND_SEALED_SECRET: &str = "SealedSecret";

/// `kubeseal` pinned to one controller certificate.
pub struct Sealer {
    runner: Arc<dyn CommandRunner>,
    cert: NamedTempFile,
}

impl Sealer {
    /// Fetch the public certificate of the controller in the cluster behind `kubeconfig`.
    ///
    /// # Errors
    ///
    /// Returns an error if `kubeseal --fetch-cert` fails, e.g. while the controller is not ready.
    pub async fn fetch(runner: Arc<dyn CommandRunner>, kubeconfig: &Path) -> Result<Self> {
        let invocation = Invocation::new("kubeseal").args([
            "--kubeconfig".to_string(),
            kubeconfig.display().to_string(),
            "--fetch-cert".into(),
            "--controller-name".into(),
            SEALED_SECRETS_CONTROLLER.into(),
            "--controller-namespace".into(),
            NAMESPACE_SEALED_SECRETS.into(),
        ]);
        let cert = run_checked(runner.as_ref(), invocation).await?;
        if !cert.contains("BEGIN CERTIFICATE") {
            return Err(Error::RemoteTransient(
                "sealed-secrets controller returned no certificate".into(),
            ));
        }
        Self::from_cert(runner, &cert)
    }

    /// A sealer for an already known certificate.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the certificate cannot be written to a scratch file.
    pub fn from_cert(runner: Arc<dyn CommandRunner>, cert: &str) -> Result<Self> {
        let mut file = NamedTempFile::new()?;
        file.write_all(cert.as_bytes())?;
        file.flush()?;
        Ok(Self { runner, cert: file })
    }

    /// Replace the plain `Secret` at `path` with its `SealedSecret`.
    ///
    /// Returns `false` when the file is already sealed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable or `kubeseal` rejects it.
    pub async fn seal_file(&self, path: &Path) -> Result<bool> {
        let plain = std::fs::read_to_string(path)?;
        if is_sealed(&plain)? {
            debug!(path = %path.display(), "Already sealed, skipping");
            return Ok(false);
        }

        let invocation = Invocation::new("kubeseal")
            .args([
                "--cert".to_string(),
                self.cert.path().display().to_string(),
                "--format".into(),
                "yaml".into(),
            ])
            .stdin(plain)
            .sensitive();
        let sealed = run_checked(self.runner.as_ref(), invocation).await?;
        if !is_sealed(&sealed)? {
            return Err(Error::RemoteFatal(format!(
                "kubeseal produced no SealedSecret for {}",
                path.display()
            )));
        }

        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        let mut staged = NamedTempFile::new_in(parent)?;
        staged.write_all(sealed.as_bytes())?;
        staged
            .persist(path)
            .map_err(|e| Error::Io(e.error))?;

        debug!(path = %path.display(), "Sealed secret");
        Ok(true)
    }

    /// Seal every file in `paths`.
    ///
    /// # Errors
    ///
    /// Stops at the first file that fails to seal.
    pub async fn seal_all(&self, paths: &[PathBuf]) -> Result<usize> {
        let mut sealed = 0;
        for path in paths {
            if self.seal_file(path).await? {
                sealed += 1;
            }
        }
        info!(sealed, total = paths.len(), "Sealed secrets");
        Ok(sealed)
    }
}

fn is_sealed(manifest: &str) -> Result<bool> {
    let document: serde_yaml::Value = serde_yaml::from_str(manifest)?;
    Ok(document.get("kind").and_then(serde_yaml::Value::as_str) == Some(KIND_SEALED_SECRET))
}

/// Put backed up controller keys in place so existing `SealedSecret`s stay decryptable.
///
/// # Errors
///
/// Returns [`Error::StatePrecondition`] if `keys_dir` holds no key manifests.
pub async fn restore_keys(kubectl: &Kubectl, keys_dir: &Path) -> Result<()> {
    let has_keys = std::fs::read_dir(keys_dir)
        .map(|entries| {
            entries
                .filter_map(std::result::Result::ok)
                .any(|entry| entry.path().extension().is_some_and(|ext| ext == "yaml"))
        })
        .unwrap_or(false);
    if !has_keys {
        return Err(Error::precondition(format!(
            "no sealed-secrets key backups found in {}",
            keys_dir.display()
        )));
    }

    kubectl.replace_force(keys_dir).await?;
    info!(dir = %keys_dir.display(), "Restored sealed-secrets controller keys");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubeaid_cloud::{CommandOutput, MockCommandRunner};

    const SECRET: &str = "apiVersion: v1\nkind: Secret\nmetadata:\n  name: kubeaid-config\n  namespace: argocd\nstringData:\n  url: https://gitea.example.com/acme/kubeaid-config\n";
    const SEALED: &str = "apiVersion: bitnami.com/v1alpha1\nkind: SealedSecret\nmetadata:\n  name: kubeaid-config\n  namespace: argocd\nspec:\n  encryptedData:\n    url: AgBy3i4OJSWK\n";

    fn ok(stdout: &str) -> CommandOutput {
        CommandOutput {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    #[tokio::test]
    async fn test_seal_file_replaces_plain_secret() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|i| {
                i.program == "kubeseal"
                    && i.sensitive
                    && i.stdin.as_deref().is_some_and(|s| s.contains("kind: Secret"))
            })
            .times(1)
            .returning(|_| Ok(ok(SEALED)));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kubeaid-config.yaml");
        std::fs::write(&path, SECRET).unwrap();

        let sealer = Sealer::from_cert(Arc::new(runner), "-----BEGIN CERTIFICATE-----\n").unwrap();
        assert!(sealer.seal_file(&path).await.unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), SEALED);

        // Second pass sees a SealedSecret and does not call kubeseal again.
        assert!(!sealer.seal_file(&path).await.unwrap());
    }

    #[tokio::test]
    async fn test_kubeseal_failure_keeps_plain_file() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_| {
            Ok(CommandOutput {
                status: 1,
                stdout: String::new(),
                stderr: "error: cannot fetch certificate: no endpoints available".into(),
            })
        });

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloud-credentials.yaml");
        std::fs::write(&path, SECRET).unwrap();

        let sealer = Sealer::from_cert(Arc::new(runner), "cert").unwrap();
        assert!(sealer.seal_all(&[path.clone()]).await.is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), SECRET);
    }

    #[tokio::test]
    async fn test_fetch_requires_a_certificate() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|i| i.args.contains(&"--fetch-cert".to_string()))
            .returning(|_| Ok(ok("")));

        let err = Sealer::fetch(Arc::new(runner), Path::new("main.yaml"))
            .await
            .err()
            .unwrap();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_restore_keys_requires_backups() {
        let runner = MockCommandRunner::new();
        let kubectl = Kubectl::new(Arc::new(runner), Path::new("main.yaml"));
        let dir = tempfile::tempdir().unwrap();

        let err = restore_keys(&kubectl, dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::StatePrecondition(_)));
    }
}
