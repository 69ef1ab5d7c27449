//! Hetzner Robot API client implementation.
//!
//! Uses the Hetzner Robot webservice for VSwitch and failover IP management.
//! API Documentation: <https://robot.hetzner.com/doc/webservice/en.html>

use std::time::Duration;

use reqwest::Client;
use tracing::{debug, info};

use super::hcloud::handle_response;
use super::models::{
    CreateVSwitchRequest, Failover, FailoverResponse, RouteFailoverRequest, VSwitch,
};
use crate::CloudProviderError;

/// Base URL for Hetzner Robot API.
const API_BASE_URL: &str = "https://robot-ws.your-server.de";

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Polling interval while a failover switch propagates.
const FAILOVER_POLL_INTERVAL_SECS: u64 = 10;

/// Hetzner Robot client, authenticated with the Robot webservice user.
#[derive(Clone)]
pub struct Robot {
    client: Client,
    username: String,
    password: String,
    base_url: String,
    poll_interval: Duration,
}

impl Robot {
    /// Create a new Robot client.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, CloudProviderError> {
        Self::with_base_url(username, password, API_BASE_URL)
    }

    /// Create a Robot client against a custom endpoint.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn with_base_url(
        username: impl Into<String>,
        password: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, CloudProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            username: username.into(),
            password: password.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            poll_interval: Duration::from_secs(FAILOVER_POLL_INTERVAL_SECS),
        })
    }

    /// Override the failover polling interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Make an authenticated GET request.
    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, CloudProviderError> {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "GET request");

        let response = self
            .client
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        handle_response(response).await
    }

    /// Make an authenticated POST request with form data.
    async fn post_form<T, B>(&self, path: &str, body: &B) -> Result<T, CloudProviderError>
    where
        T: serde::de::DeserializeOwned,
        B: serde::Serialize,
    {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "POST request (form)");

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .form(body)
            .send()
            .await?;

        handle_response(response).await
    }

    /// List all VSwitches of the account.
    ///
    /// # Errors
    /// Returns error if the request fails.
    pub async fn list_vswitches(&self) -> Result<Vec<VSwitch>, CloudProviderError> {
        self.get("/vswitch").await
    }

    /// Find a live VSwitch by name and VLAN id, creating it when absent. Returns its id.
    ///
    /// # Errors
    /// Returns error if listing or creation fails.
    pub async fn ensure_vswitch(&self, name: &str, vlan: u32) -> Result<u64, CloudProviderError> {
        let existing = self
            .list_vswitches()
            .await?
            .into_iter()
            .find(|vswitch| vswitch.name == name && vswitch.vlan == vlan && !vswitch.cancelled);

        if let Some(vswitch) = existing {
            info!(id = vswitch.id, name = %name, "VSwitch already exists");
            return Ok(vswitch.id);
        }

        let created: VSwitch = self
            .post_form("/vswitch", &CreateVSwitchRequest { name, vlan })
            .await?;

        info!(id = created.id, name = %name, vlan, "Created VSwitch");
        Ok(created.id)
    }

    /// Current routing of a failover IP.
    ///
    /// # Errors
    /// Returns error if the request fails.
    pub async fn failover(&self, failover_ip: &str) -> Result<Failover, CloudProviderError> {
        let response: FailoverResponse = self.get(&format!("/failover/{failover_ip}")).await?;
        Ok(response.failover)
    }

    /// Route a failover IP to `server_ip` and wait until Robot reports it active.
    ///
    /// No request is issued when the IP already points at the target.
    ///
    /// # Errors
    /// Returns error if a request fails.
    pub async fn route_failover(
        &self,
        failover_ip: &str,
        server_ip: &str,
    ) -> Result<(), CloudProviderError> {
        let current = self.failover(failover_ip).await?;
        if current.active_server_ip == server_ip {
            info!(failover_ip = %failover_ip, server_ip = %server_ip, "Failover IP already points to the target server");
            return Ok(());
        }

        let _: FailoverResponse = self
            .post_form(
                &format!("/failover/{failover_ip}"),
                &RouteFailoverRequest {
                    active_server_ip: server_ip,
                },
            )
            .await?;
        info!(failover_ip = %failover_ip, server_ip = %server_ip, "Requested failover IP switch");

        loop {
            let current = self.failover(failover_ip).await?;
            if current.active_server_ip == server_ip {
                info!(failover_ip = %failover_ip, server_ip = %server_ip, "Failover IP now points to the target server");
                return Ok(());
            }
            debug!(active = %current.active_server_ip, "Waiting for failover switch");
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
