//! Azure CLI response models.

use serde::Deserialize;

/// A user assigned managed identity.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedIdentity {
    pub id: String,
    pub client_id: String,
    pub principal_id: String,
}

/// A VM size offered in a location.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmSize {
    pub name: String,
    pub number_of_cores: u32,
    #[serde(rename = "memoryInMB")]
    pub memory_in_mb: u32,
    #[serde(default, rename = "osDiskSizeInMB")]
    pub os_disk_size_in_mb: Option<u32>,
}

/// A storage account access key.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageAccountKey {
    pub key_name: String,
    pub value: String,
}

/// A blob in a container listing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Blob {
    pub name: String,
}
