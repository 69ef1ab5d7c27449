//! Kubernetes access: typed and dynamic clients, `kubectl`, Helm and port-forwarding.

pub mod client;
pub mod helm;
pub mod kubectl;
pub mod port_forward;
pub mod resources;

pub use client::{connect, ensure_namespace, is_not_found, is_reachable, secret_value, write_kubeconfig};
pub use helm::{ChartSource, Helm, HelmRelease};
pub use kubectl::Kubectl;
pub use port_forward::PortForward;
