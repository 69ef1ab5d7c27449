//! Azure cloud provider.
//!
//! Wraps the `az` and `azwi` CLIs for the pieces of Azure that cluster bootstrap needs:
//! resource groups, storage accounts and blob containers for the workload identity OIDC issuer
//! and disaster recovery, user assigned identities with role assignments and federated
//! credentials, and VM size lookups.

mod client;
mod models;

pub use client::{
    service_account_issuer_url, storage_account_url, Azure, AzureCredentials, ROLE_ID_CONTRIBUTOR,
    ROLE_ID_STORAGE_BLOB_DATA_OWNER,
};
pub use models::*;
