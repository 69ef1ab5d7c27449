//! Hetzner Cloud and Robot API data models.

use serde::{Deserialize, Serialize};

// ============================================================================
// Hetzner Cloud
// ============================================================================

/// An HCloud server type (machine type).
#[derive(Debug, Clone, Deserialize)]
pub struct ServerType {
    pub id: u64,
    pub name: String,
    pub cores: u32,
    /// Memory in GB.
    pub memory: f64,
    /// Local disk in GB.
    pub disk: u32,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServerTypesResponse {
    pub server_types: Vec<ServerType>,
}

/// Subnet of an HCloud network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSubnet {
    #[serde(rename = "type")]
    pub subnet_type: String,
    pub ip_range: String,
    pub network_zone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vswitch_id: Option<u64>,
}

/// An HCloud private network.
#[derive(Debug, Clone, Deserialize)]
pub struct Network {
    pub id: u64,
    pub name: String,
    pub ip_range: String,
    #[serde(default)]
    pub subnets: Vec<NetworkSubnet>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct NetworkResponse {
    pub network: Network,
}

// ============================================================================
// Hetzner Robot
// ============================================================================

/// A Robot VSwitch.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VSwitch {
    pub id: u64,
    pub name: String,
    pub vlan: u32,
    #[serde(default)]
    pub cancelled: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateVSwitchRequest<'a> {
    pub name: &'a str,
    pub vlan: u32,
}

/// Routing state of a failover IP.
#[derive(Debug, Clone, Deserialize)]
pub struct Failover {
    pub ip: String,
    #[serde(default)]
    pub server_ip: Option<String>,
    pub active_server_ip: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FailoverResponse {
    pub failover: Failover,
}

#[derive(Debug, Serialize)]
pub(crate) struct RouteFailoverRequest<'a> {
    pub active_server_ip: &'a str,
}
