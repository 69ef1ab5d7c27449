//! KubeAid CLI.
//!
//! Bootstraps, upgrades, recovers and deletes KubeAid managed Kubernetes clusters.

// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]

use std::fs::OpenOptions;
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use kubeaid_cli::commands::cluster::ClusterCommand;
use kubeaid_cli::commands::config::ConfigCommand;
use kubeaid_cli::commands::devenv::DevenvCommand;
use kubeaid_cli::commands::GlobalArgs;
use kubeaid_cli::session::Paths;
use kubeaid_cli::{ui, Error};

/// KubeAid - GitOps managed Kubernetes clusters.
#[derive(Parser)]
#[command(
    name = "kubeaid-cli",
    version,
    about = "Bootstrap and operate KubeAid managed Kubernetes clusters",
    long_about = "Bootstrap and operate KubeAid managed Kubernetes clusters.\n\n\
                  A local K3D management cluster provisions the main cluster through\n\
                  Cluster API and ArgoCD, then hands it its own Cluster API objects.\n\n\
                  Bootstrapping is resumable - re-running the same command continues\n\
                  from the step that failed."
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate sample config files.
    Config(ConfigCommand),

    /// Set up only the local management cluster.
    Devenv(DevenvCommand),

    /// Bootstrap, upgrade, delete, recover or test the main cluster.
    Cluster(ClusterCommand),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.global.debug) {
        ui::print_warning(&format!("File logging disabled: {e:#}"));
    }
    ui::print_banner();

    let outcome = tokio::select! {
        result = run(&cli) => result,
        () = shutdown_signal() => Err(Error::UserAbort.into()),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Command failed");
            ui::print_error(&format!("{e:#}"));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Config(cmd) => cmd.run(&cli.global).await,
        Commands::Devenv(cmd) => cmd.run(&cli.global).await,
        Commands::Cluster(cmd) => cmd.run(&cli.global).await,
    }
}

/// Human readable logs on stdout, JSON records appended to `outputs/.log`.
fn init_tracing(debug: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if debug {
            EnvFilter::new("debug,kubeaid_cli=debug,kubeaid_cloud=debug")
        } else {
            EnvFilter::new("info")
        }
    });
    let console = fmt::layer().with_target(false).with_filter(filter);

    let log_file = Paths::default().log_file();
    let file = log_file
        .parent()
        .map_or(Ok(()), std::fs::create_dir_all)
        .and_then(|()| OpenOptions::new().create(true).append(true).open(&log_file));

    match file {
        Ok(file) => {
            let records = fmt::layer()
                .json()
                .with_writer(Mutex::new(file))
                .with_filter(EnvFilter::new("info,kubeaid_cli=debug,kubeaid_cloud=debug"));
            tracing_subscriber::registry().with(console).with(records).init();
            Ok(())
        }
        Err(e) => {
            tracing_subscriber::registry().with(console).init();
            Err(e.into())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
