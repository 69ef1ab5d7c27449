use anyhow::Result;
use clap::{Args, Subcommand};

use super::GlobalArgs;
use crate::config::generate::{generate_sample_config, SampleKind};
use crate::config::HetznerMode;
use crate::ui;

/// Manage KubeAid CLI config files
#[derive(Args, Debug)]
pub struct ConfigCommand {
    #[command(subcommand)]
    command: ConfigSubcommand,
}

#[derive(Subcommand, Debug)]
enum ConfigSubcommand {
    /// Generate a sample general.yaml and secrets.yaml
    Generate(GenerateCommand),
}

#[derive(Args, Debug)]
struct GenerateCommand {
    /// Overwrite existing config files
    #[arg(long, global = true)]
    force: bool,

    #[command(subcommand)]
    target: GenerateTarget,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum GenerateTarget {
    /// Cluster on AWS
    Aws,
    /// Cluster on Azure
    Azure,
    /// Cluster on Hetzner
    Hetzner {
        #[command(subcommand)]
        mode: HetznerTarget,
    },
    /// Single node cluster on this machine
    Local,
    /// Cluster on pre-provisioned machines, set up with KubeOne
    BareMetal,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum HetznerTarget {
    /// Control plane and workers on HCloud VMs
    Hcloud,
    /// Control plane and workers on Hetzner Robot servers
    BareMetal,
    /// Control plane on HCloud, workers on Hetzner Robot servers
    Hybrid,
}

impl From<GenerateTarget> for SampleKind {
    fn from(target: GenerateTarget) -> Self {
        match target {
            GenerateTarget::Aws => Self::Aws,
            GenerateTarget::Azure => Self::Azure,
            GenerateTarget::Hetzner { mode } => Self::Hetzner(match mode {
                HetznerTarget::Hcloud => HetznerMode::Hcloud,
                HetznerTarget::BareMetal => HetznerMode::BareMetal,
                HetznerTarget::Hybrid => HetznerMode::Hybrid,
            }),
            GenerateTarget::Local => Self::Local,
            GenerateTarget::BareMetal => Self::BareMetal,
        }
    }
}

impl ConfigCommand {
    pub async fn run(&self, global: &GlobalArgs) -> Result<()> {
        match &self.command {
            ConfigSubcommand::Generate(generate) => {
                let written = generate_sample_config(
                    &global.configs_directory,
                    generate.target.into(),
                    generate.force,
                )?;

                for path in &written {
                    ui::print_success(&format!("Wrote {}", path.display()));
                }
                ui::print_info("Fill in the placeholders, then run: kubeaid-cli cluster bootstrap");
                Ok(())
            }
        }
    }
}
