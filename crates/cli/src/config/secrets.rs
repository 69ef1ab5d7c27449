//! Schema of the secrets document (`secrets.yaml`).
//!
//! Kept apart from the general document so the latter can be committed.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecretsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitCredentials>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws: Option<AwsCredentials>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzureCredentials>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hetzner: Option<HetznerCredentials>,
}

/// Basic auth credentials, or the passphrase of the git SSH key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GitCredentials {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsCredentials {
    #[serde(rename = "accessKeyID")]
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureCredentials {
    #[serde(rename = "clientID")]
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HetznerCredentials {
    pub api_token: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub robot: Option<HetznerRobotCredentials>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HetznerRobotCredentials {
    pub user: String,
    pub password: String,
}
