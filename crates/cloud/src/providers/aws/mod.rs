//! AWS (Amazon Web Services) cloud provider.
//!
//! ## Services
//!
//! - **STS** - account lookup
//! - **EC2** - instance type specs
//! - **S3** / **IAM** - disaster recovery buckets and IRSA-less roles for Velero and the
//!   sealed-secrets backuper
//! - **clusterawsadm** - CAPA bootstrap IAM stack and controller credential management

mod client;
mod models;

pub use client::{Aws, AwsCredentials};
pub use models::*;
