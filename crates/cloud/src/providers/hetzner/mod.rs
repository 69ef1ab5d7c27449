//! Hetzner cloud provider.
//!
//! ## APIs
//!
//! - **Hetzner Cloud** (bearer token) - machine type specs, private networks
//! - **Hetzner Robot** (basic auth) - VSwitches, failover IPs of dedicated servers

mod hcloud;
mod models;
mod robot;

pub use hcloud::HCloud;
pub use models::*;
pub use robot::Robot;
