//! KubeAid cluster orchestrator library.
//!
//! Bootstraps Kubernetes clusters on AWS, Azure, Hetzner, bare metal and local machines
//! through a temporary K3D management cluster, Cluster API and ArgoCD, keeping every
//! cluster's desired state in a KubeAid config repository.
//!
//! # Example
//!
//! ```ignore
//! use kubeaid_cli::commands::load_session;
//! use kubeaid_cli::session::Flags;
//! use kubeaid_cli::Bootstrapper;
//!
//! #[tokio::main]
//! async fn main() -> kubeaid_cli::Result<()> {
//!     let session = load_session(Flags::default()).await?;
//!     let mut bootstrapper = Bootstrapper::new_or_resume(&session, false)?;
//!     bootstrapper.run_to_completion().await
//! }
//! ```

// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]
// Allow async functions that don't use await (may need await in future)
#![allow(clippy::unused_async)]
// Allow imports after statements in functions
#![allow(clippy::items_after_statements)]

pub mod argocd;
pub mod capi;
pub mod cloud;
pub mod commands;
pub mod config;
pub mod constants;
pub mod error;
pub mod git;
pub mod k3d;
pub mod k8s;
pub mod orchestrator;
pub mod sealed_secrets;
pub mod session;
pub mod state;
pub mod templates;
pub mod ui;
pub mod velero;

pub use error::{Error, Result};
pub use orchestrator::Bootstrapper;
