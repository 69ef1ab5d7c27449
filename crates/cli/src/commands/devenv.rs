use anyhow::Result;
use clap::{Args, Subcommand};

use super::{load_session, GlobalArgs};
use crate::orchestrator::Bootstrapper;
use crate::state::BootstrapStep;
use crate::ui;

/// Manage the local development environment
#[derive(Args, Debug)]
pub struct DevenvCommand {
    #[command(subcommand)]
    command: DevenvSubcommand,
}

#[derive(Subcommand, Debug)]
enum DevenvSubcommand {
    /// Create and set up the K3D management cluster only
    ///
    /// A later `cluster bootstrap` picks up from where this stops.
    Create,
}

impl DevenvCommand {
    pub async fn run(&self, global: &GlobalArgs) -> Result<()> {
        match self.command {
            DevenvSubcommand::Create => {
                let session = load_session(global.flags()).await?;
                Bootstrapper::new_or_resume(&session, false)?
                    .stop_after(BootstrapStep::ManagementSetup)
                    .run_to_completion()
                    .await?;

                ui::print_success("Development environment is ready");
                Ok(())
            }
        }
    }
}
