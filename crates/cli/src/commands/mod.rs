//! Command-line surface of `kubeaid-cli`.

pub mod cluster;
pub mod config;
pub mod devenv;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use kubeaid_cloud::{CommandRunner, SystemRunner};

use crate::config::ConfigParser;
use crate::constants::{DEFAULT_CONFIGS_DIRECTORY, DEFAULT_MANAGEMENT_CLUSTER_NAME};
use crate::error::Result;
use crate::session::{Flags, Paths, Session};

/// Flags accepted by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Log at debug level.
    #[arg(long, global = true)]
    pub debug: bool,

    /// Directory holding general.yaml and secrets.yaml.
    #[arg(long, global = true, value_name = "DIR", default_value = DEFAULT_CONFIGS_DIRECTORY)]
    pub configs_directory: PathBuf,

    /// Name of the local K3D management cluster.
    #[arg(long, global = true, value_name = "NAME", default_value = DEFAULT_MANAGEMENT_CLUSTER_NAME)]
    pub management_cluster_name: String,

    /// Push config changes straight to the default branch instead of opening a pull request.
    #[arg(long, global = true)]
    pub skip_pr_workflow: bool,

    /// Skip the monitoring setup, including the kube-prometheus build.
    #[arg(long, global = true)]
    pub skip_monitoring_setup: bool,

    /// Skip building the kube-prometheus manifests.
    #[arg(long, global = true)]
    pub skip_kube_prometheus_build: bool,

    /// Keep the Cluster API objects in the management cluster.
    #[arg(long, global = true)]
    pub skip_clusterctl_move: bool,
}

impl GlobalArgs {
    #[must_use]
    pub fn flags(&self) -> Flags {
        Flags {
            debug: self.debug,
            configs_dir: self.configs_directory.clone(),
            management_cluster_name: self.management_cluster_name.clone(),
            skip_pr_workflow: self.skip_pr_workflow,
            skip_monitoring_setup: self.skip_monitoring_setup,
            skip_kube_prometheus_build: self.skip_kube_prometheus_build,
            skip_clusterctl_move: self.skip_clusterctl_move,
        }
    }
}

/// Parse the config directory and build the session every workflow runs against.
///
/// # Errors
///
/// Returns configuration errors from parsing and from the cloud adapter.
pub async fn load_session(flags: Flags) -> Result<Session> {
    let config = ConfigParser::new().parse(&flags.configs_dir).await?;
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
    Session::new(flags, config, Paths::default(), runner).await
}
