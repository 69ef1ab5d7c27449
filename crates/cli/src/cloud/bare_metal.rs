//! Linux servers we do not manage the lifecycle of, turned into a cluster by KubeOne.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use kubeaid_cloud::{run_checked, CommandRunner, Invocation};
use tracing::{debug, info};

use super::CloudProvider;
use crate::config::CloudKind;
use crate::error::Result;
use crate::k8s::write_kubeconfig;
use crate::session::Session;
use crate::templates::TEMPLATE_KUBEONE_CLUSTER;

pub struct BareMetalProvider {
    runner: Arc<dyn CommandRunner>,
}

impl BareMetalProvider {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

/// The kubeconfig KubeOne leaves in the working directory.
fn generated_kubeconfig(cluster: &str) -> PathBuf {
    PathBuf::from(format!("{cluster}-kubeconfig"))
}

#[async_trait]
impl CloudProvider for BareMetalProvider {
    fn kind(&self) -> CloudKind {
        CloudKind::BareMetal
    }

    async fn provision_without_capi(&self, session: &Session, cluster_dir: &Path) -> Result<()> {
        let cluster = session.cluster_name();
        let manifest = cluster_dir.join(TEMPLATE_KUBEONE_CLUSTER);
        info!(cluster = %cluster, manifest = %manifest.display(), "Provisioning the main cluster with KubeOne");

        let invocation = Invocation::new("kubeone").args([
            "apply".to_string(),
            "--manifest".to_string(),
            manifest.display().to_string(),
            "--auto-approve".to_string(),
        ]);
        run_checked(self.runner.as_ref(), invocation).await?;

        // PKI backup, not needed once the cluster is up.
        if let Some(kubeone_dir) = manifest.parent() {
            let backup = kubeone_dir.join(format!("{cluster}.tar.gz"));
            if backup.is_file() {
                std::fs::remove_file(&backup)?;
                debug!(path = %backup.display(), "Removed KubeOne PKI backup");
            }
        }

        // Copy, then remove: the outputs directory may sit on another device.
        let generated = generated_kubeconfig(cluster);
        let kubeconfig = std::fs::read_to_string(&generated)?;
        write_kubeconfig(&session.paths.main_kubeconfig(), &kubeconfig)?;
        std::fs::remove_file(&generated)?;

        info!(cluster = %cluster, "Main cluster has been provisioned");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_kubeconfig_name() {
        assert_eq!(
            generated_kubeconfig("kubeaid-demo-bare-metal"),
            PathBuf::from("kubeaid-demo-bare-metal-kubeconfig")
        );
    }

    #[test]
    fn test_upgrade_is_unsupported() {
        let provider = BareMetalProvider::new(Arc::new(kubeaid_cloud::MockCommandRunner::new()));
        let mut document = serde_yaml::Value::Null;
        assert!(provider
            .update_values_file(&mut document, &super::super::MachineImageUpdates::default())
            .is_err());
    }
}
