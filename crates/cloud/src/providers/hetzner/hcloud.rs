//! Hetzner Cloud API client.
//!
//! API Documentation: <https://docs.hetzner.cloud/>

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::models::{Network, NetworkResponse, NetworkSubnet, ServerType, ServerTypesResponse};
use crate::providers::VmSpec;
use crate::CloudProviderError;

/// Base URL for the Hetzner Cloud API.
const API_BASE_URL: &str = "https://api.hetzner.cloud/v1";

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Hetzner Cloud client, authenticated with a project API token.
#[derive(Clone)]
pub struct HCloud {
    client: Client,
    token: String,
    base_url: String,
}

impl HCloud {
    /// Create a client against the public Hetzner Cloud API.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new(token: impl Into<String>) -> Result<Self, CloudProviderError> {
        Self::with_base_url(token, API_BASE_URL)
    }

    /// Create a client against a custom endpoint.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn with_base_url(
        token: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, CloudProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            token: token.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, CloudProviderError> {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "GET request");

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;

        handle_response(response).await
    }

    async fn post<T, B>(&self, path: &str, body: &B) -> Result<T, CloudProviderError>
    where
        T: serde::de::DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "POST request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;

        handle_response(response).await
    }

    /// Look up a server type by name.
    ///
    /// # Errors
    /// Returns [`CloudProviderError::NotFound`] when no server type carries that name.
    pub async fn server_type(&self, name: &str) -> Result<ServerType, CloudProviderError> {
        let response: ServerTypesResponse = self
            .get(&format!("/server_types?name={name}"))
            .await?;

        response
            .server_types
            .into_iter()
            .find(|server_type| server_type.name == name)
            .ok_or_else(|| CloudProviderError::NotFound(format!("server type {name}")))
    }

    /// CPU, memory and root disk size of a machine type.
    ///
    /// # Errors
    /// Returns error if the lookup fails.
    pub async fn vm_spec(&self, machine_type: &str) -> Result<VmSpec, CloudProviderError> {
        let server_type = self.server_type(machine_type).await?;

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let memory_mib = (server_type.memory * 1024.0).round() as u32;

        Ok(VmSpec {
            cpu: server_type.cores,
            memory_mib,
            root_volume_gib: Some(server_type.disk),
        })
    }

    /// Get a network by id.
    ///
    /// # Errors
    /// Returns error if the request fails.
    pub async fn network(&self, id: u64) -> Result<Network, CloudProviderError> {
        let response: NetworkResponse = self.get(&format!("/networks/{id}")).await?;
        Ok(response.network)
    }

    /// Attach a VSwitch to a network as a subnet, unless one is attached already.
    ///
    /// Fails when a *different* VSwitch is attached to the network.
    ///
    /// # Errors
    /// Returns error if the request fails or a foreign VSwitch is attached.
    pub async fn attach_vswitch(
        &self,
        network_id: u64,
        vswitch_id: u64,
        ip_range: &str,
        gateway: &str,
    ) -> Result<(), CloudProviderError> {
        let network = self.network(network_id).await?;

        if let Some(existing) = network
            .subnets
            .iter()
            .find(|subnet| subnet.subnet_type == "vswitch")
        {
            if existing.vswitch_id == Some(vswitch_id) {
                info!(network = network_id, vswitch = vswitch_id, "VSwitch is already connected to the HCloud network");
                return Ok(());
            }
            warn!(network = network_id, attached = ?existing.vswitch_id, "Unexpected VSwitch attached to the HCloud network");
            return Err(CloudProviderError::Config(format!(
                "HCloud network {network_id} already has VSwitch {:?} attached",
                existing.vswitch_id
            )));
        }

        let subnet = NetworkSubnet {
            subnet_type: "vswitch".to_string(),
            ip_range: ip_range.to_string(),
            network_zone: network_zone_of(&network),
            gateway: Some(gateway.to_string()),
            vswitch_id: Some(vswitch_id),
        };

        let _: serde_json::Value = self
            .post(&format!("/networks/{network_id}/actions/add_subnet"), &subnet)
            .await?;

        info!(network = network_id, vswitch = vswitch_id, "Connected VSwitch to HCloud network");
        Ok(())
    }
}

/// VSwitch subnets must live in the same network zone as the network's cloud subnets.
fn network_zone_of(network: &Network) -> String {
    network
        .subnets
        .first()
        .map_or_else(|| "eu-central".to_string(), |subnet| subnet.network_zone.clone())
}

/// Map an HCloud response to a typed result.
pub(crate) async fn handle_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, CloudProviderError> {
    let status = response.status();
    let text = response.text().await?;

    if status.is_success() {
        serde_json::from_str(&text).map_err(|e| {
            warn!(error = %e, body = %text, "Failed to parse response");
            CloudProviderError::Serialization(e)
        })
    } else if status == StatusCode::NOT_FOUND {
        Err(CloudProviderError::NotFound(text))
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        Err(CloudProviderError::Auth(text))
    } else {
        Err(CloudProviderError::Api {
            status: status.as_u16(),
            message: text,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_vm_spec_from_server_type() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/server_types"))
            .and(query_param("name", "cpx31"))
            .and(header("authorization", "Bearer token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "server_types": [
                    {"id": 9, "name": "cpx31", "cores": 4, "memory": 8.0, "disk": 160}
                ]
            })))
            .mount(&server)
            .await;

        let hcloud = HCloud::with_base_url("token", server.uri()).unwrap();
        let spec = hcloud.vm_spec("cpx31").await.unwrap();

        assert_eq!(spec.cpu, 4);
        assert_eq!(spec.memory_mib, 8192);
        assert_eq!(spec.root_volume_gib, Some(160));
    }

    #[tokio::test]
    async fn test_unknown_server_type_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/server_types"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"server_types": []})))
            .mount(&server)
            .await;

        let hcloud = HCloud::with_base_url("token", server.uri()).unwrap();
        let err = hcloud.vm_spec("cx999").await.unwrap_err();
        assert!(matches!(err, CloudProviderError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_attach_vswitch_adds_subnet() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/networks/42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "network": {
                    "id": 42,
                    "name": "prod",
                    "ip_range": "10.0.0.0/16",
                    "subnets": [
                        {"type": "cloud", "ip_range": "10.0.0.0/24", "network_zone": "eu-central", "gateway": "10.0.0.1"}
                    ]
                }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/networks/42/actions/add_subnet"))
            .and(body_partial_json(json!({
                "type": "vswitch",
                "ip_range": "10.0.1.0/24",
                "network_zone": "eu-central",
                "vswitch_id": 7
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"action": {"id": 1}})))
            .expect(1)
            .mount(&server)
            .await;

        let hcloud = HCloud::with_base_url("token", server.uri()).unwrap();
        hcloud
            .attach_vswitch(42, 7, "10.0.1.0/24", "10.0.1.1")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_attach_vswitch_is_idempotent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/networks/42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "network": {
                    "id": 42,
                    "name": "prod",
                    "ip_range": "10.0.0.0/16",
                    "subnets": [
                        {"type": "vswitch", "ip_range": "10.0.1.0/24", "network_zone": "eu-central", "vswitch_id": 7}
                    ]
                }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let hcloud = HCloud::with_base_url("token", server.uri()).unwrap();
        hcloud
            .attach_vswitch(42, 7, "10.0.1.0/24", "10.0.1.1")
            .await
            .unwrap();

        let err = hcloud
            .attach_vswitch(42, 8, "10.0.1.0/24", "10.0.1.1")
            .await
            .unwrap_err();
        assert!(matches!(err, CloudProviderError::Config(_)));
    }
}
