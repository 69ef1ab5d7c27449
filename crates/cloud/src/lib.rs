//! Cloud provider integrations for the KubeAid CLI.
//!
//! - **AWS** - `aws` / `clusterawsadm` CLIs: IAM, S3, EC2 instance types
//! - **Azure** - `az` / `azwi` CLIs: resource groups, storage, managed identities
//! - **Hetzner** - HCloud REST API and the Robot webservice
//!
//! CLI backed providers run every process through [`CommandRunner`], so they can be exercised
//! in tests without the vendor tooling installed.

pub mod error;
pub mod exec;
pub mod providers;

pub use error::CloudProviderError;
pub use exec::{run_checked, CommandOutput, CommandRunner, Invocation, SystemRunner};
pub use providers::{aws, azure, hetzner, Aws, Azure, HCloud, Robot, VmSpec};

#[cfg(any(test, feature = "mock"))]
pub use exec::MockCommandRunner;
