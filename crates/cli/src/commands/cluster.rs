use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Subcommand};
use dialoguer::{theme::ColorfulTheme, Confirm};
use kubeaid_cloud::{CommandRunner, SystemRunner};

use super::{load_session, GlobalArgs};
use crate::cloud::MachineImageUpdates;
use crate::config::CloudKind;
use crate::orchestrator::connectivity::test_cluster;
use crate::orchestrator::delete::{delete_main_cluster, delete_management_cluster};
use crate::orchestrator::recover::recover_cluster;
use crate::orchestrator::upgrade::{upgrade_cluster, UpgradeRequest};
use crate::orchestrator::Bootstrapper;
use crate::session::Paths;
use crate::ui;

/// Bootstrap, upgrade, delete, recover or test a cluster
#[derive(Args, Debug)]
pub struct ClusterCommand {
    #[command(subcommand)]
    command: ClusterSubcommand,
}

#[derive(Subcommand, Debug)]
enum ClusterSubcommand {
    /// Bootstrap the main cluster through a local K3D management cluster
    ///
    /// Every step is recorded, so re-running after a failure resumes at the failed step.
    Bootstrap,

    /// Upgrade the Kubernetes version and machine image of the main cluster
    Upgrade {
        #[command(subcommand)]
        cloud: UpgradeCloud,
    },

    /// Delete the main or the management cluster
    Delete {
        #[command(subcommand)]
        target: DeleteTarget,
    },

    /// Recreate a lost main cluster from its disaster recovery backups
    Recover,

    /// Run the Cilium connectivity tests against the main cluster
    Test,
}

#[derive(Args, Debug)]
struct UpgradeArgs {
    /// Kubernetes version to upgrade to, like v1.31.2
    #[arg(long, value_name = "VERSION")]
    new_k8s_version: String,
}

#[derive(Subcommand, Debug)]
enum UpgradeCloud {
    /// Upgrade a cluster running on AWS
    Aws {
        #[command(flatten)]
        args: UpgradeArgs,

        /// AMI used by the upgraded machines
        #[arg(long, value_name = "AMI")]
        ami_id: Option<String>,
    },

    /// Upgrade a cluster running on Azure
    Azure {
        #[command(flatten)]
        args: UpgradeArgs,

        /// Marketplace image offer used by the upgraded machines
        #[arg(long, value_name = "OFFER")]
        new_image_offer: Option<String>,
    },

    /// Upgrade a cluster running on Hetzner
    Hetzner {
        #[command(flatten)]
        args: UpgradeArgs,

        /// HCloud image used by the upgraded VMs
        #[arg(long, value_name = "IMAGE")]
        new_image_name: Option<String>,

        /// installimage tarball used by the upgraded bare metal servers
        #[arg(long, value_name = "PATH")]
        new_image_path: Option<String>,
    },
}

impl UpgradeCloud {
    fn request(&self) -> UpgradeRequest {
        match self {
            Self::Aws { args, ami_id } => UpgradeRequest {
                cloud: CloudKind::Aws,
                new_k8s_version: args.new_k8s_version.clone(),
                images: MachineImageUpdates {
                    ami_id: ami_id.clone(),
                    ..MachineImageUpdates::default()
                },
            },
            Self::Azure {
                args,
                new_image_offer,
            } => UpgradeRequest {
                cloud: CloudKind::Azure,
                new_k8s_version: args.new_k8s_version.clone(),
                images: MachineImageUpdates {
                    image_offer: new_image_offer.clone(),
                    ..MachineImageUpdates::default()
                },
            },
            Self::Hetzner {
                args,
                new_image_name,
                new_image_path,
            } => UpgradeRequest {
                cloud: CloudKind::Hetzner,
                new_k8s_version: args.new_k8s_version.clone(),
                images: MachineImageUpdates {
                    image_name: new_image_name.clone(),
                    image_path: new_image_path.clone(),
                    ..MachineImageUpdates::default()
                },
            },
        }
    }
}

#[derive(Subcommand, Debug)]
enum DeleteTarget {
    /// Delete the main cluster and its cloud infrastructure
    Main {
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Delete the local K3D management cluster
    Management,
}

impl ClusterCommand {
    pub async fn run(&self, global: &GlobalArgs) -> Result<()> {
        match &self.command {
            ClusterSubcommand::Bootstrap => {
                let session = load_session(global.flags()).await?;
                Bootstrapper::new_or_resume(&session, false)?
                    .run_to_completion()
                    .await?;

                ui::print_kv(
                    "Main cluster kubeconfig",
                    &session.paths.main_kubeconfig().display().to_string(),
                );
            }

            ClusterSubcommand::Upgrade { cloud } => {
                let session = load_session(global.flags()).await?;
                upgrade_cluster(&session, &cloud.request()).await?;
            }

            ClusterSubcommand::Delete {
                target: DeleteTarget::Main { yes },
            } => {
                let session = load_session(global.flags()).await?;
                if !yes && !confirm_delete(session.cluster_name())? {
                    ui::print_warning("Deletion cancelled");
                    return Ok(());
                }
                delete_main_cluster(&session).await?;
            }

            // The management cluster can go even when the config no longer parses.
            ClusterSubcommand::Delete {
                target: DeleteTarget::Management,
            } => {
                let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
                delete_management_cluster(runner, &Paths::default().k3d_config()).await?;
            }

            ClusterSubcommand::Recover => {
                let session = load_session(global.flags()).await?;
                recover_cluster(&session).await?;
            }

            ClusterSubcommand::Test => {
                let session = load_session(global.flags()).await?;
                test_cluster(&session).await?;
            }
        }

        Ok(())
    }
}

fn confirm_delete(cluster_name: &str) -> Result<bool> {
    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!(
            "Delete cluster {cluster_name} and all of its cloud resources?"
        ))
        .default(false)
        .interact()?;
    Ok(confirmed)
}
