//! The K3D management cluster doubles as the main cluster.

use std::path::Path;

use async_trait::async_trait;
use tracing::info;

use super::CloudProvider;
use crate::config::CloudKind;
use crate::error::Result;
use crate::k8s::write_kubeconfig;
use crate::session::{ClusterTarget, Session};

pub struct LocalProvider;

#[async_trait]
impl CloudProvider for LocalProvider {
    fn kind(&self) -> CloudKind {
        CloudKind::Local
    }

    async fn provision_without_capi(&self, session: &Session, _cluster_dir: &Path) -> Result<()> {
        let kubeconfig = std::fs::read_to_string(session.kubeconfig(ClusterTarget::Management))?;
        write_kubeconfig(&session.paths.main_kubeconfig(), &kubeconfig)?;
        info!("Using the management cluster as the main cluster");
        Ok(())
    }
}
