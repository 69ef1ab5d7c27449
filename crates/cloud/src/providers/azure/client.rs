//! Azure client implementation.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tracing::{debug, info, warn};
use url::Url;

use super::models::{ManagedIdentity, StorageAccountKey, VmSize};
use crate::exec::{run_checked, CommandRunner, Invocation, SystemRunner};
use crate::providers::VmSpec;
use crate::CloudProviderError;

/// Built-in Contributor role definition id.
pub const ROLE_ID_CONTRIBUTOR: &str = "b24988ac-6180-42a0-ab88-20f7382dd24c";

/// Built-in Storage Blob Data Owner role definition id.
pub const ROLE_ID_STORAGE_BLOB_DATA_OWNER: &str = "b7e6dc6d-f1e8-4753-8033-0f276bb0955b";

/// Upload attempts while a freshly created container becomes writable.
const UPLOAD_ATTEMPTS: u32 = 6;

/// Delay between upload attempts.
const UPLOAD_RETRY_DELAY_SECS: u64 = 10;

/// Service principal credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AzureCredentials {
    pub tenant_id: String,
    pub subscription_id: String,
    pub client_id: String,
    pub client_secret: String,
}

/// Azure provider, scoped to a single resource group.
#[derive(Clone)]
pub struct Azure {
    runner: Arc<dyn CommandRunner>,
    http: Client,
    credentials: AzureCredentials,
    resource_group: String,
    location: String,
    upload_retry_delay: Duration,
}

impl Azure {
    /// Create a provider that spawns real CLI processes.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created.
    pub fn new(
        credentials: AzureCredentials,
        resource_group: impl Into<String>,
        location: impl Into<String>,
    ) -> Result<Self, CloudProviderError> {
        Self::with_runner(credentials, resource_group, location, Arc::new(SystemRunner))
    }

    /// Create a provider on top of a custom [`CommandRunner`].
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created.
    pub fn with_runner(
        credentials: AzureCredentials,
        resource_group: impl Into<String>,
        location: impl Into<String>,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, CloudProviderError> {
        let http = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            runner,
            http,
            credentials,
            resource_group: resource_group.into(),
            location: location.into(),
            upload_retry_delay: Duration::from_secs(UPLOAD_RETRY_DELAY_SECS),
        })
    }

    /// Override the delay between blob upload attempts.
    #[must_use]
    pub fn with_upload_retry_delay(mut self, delay: Duration) -> Self {
        self.upload_retry_delay = delay;
        self
    }

    #[must_use]
    pub fn resource_group(&self) -> &str {
        &self.resource_group
    }

    #[must_use]
    pub fn subscription_id(&self) -> &str {
        &self.credentials.subscription_id
    }

    async fn az(&self, args: &[&str]) -> Result<String, CloudProviderError> {
        let invocation = Invocation::new("az")
            .args(args.iter().copied())
            .args(["--output", "json", "--only-show-errors"]);
        run_checked(self.runner.as_ref(), invocation).await
    }

    /// Log the `az` CLI in as the service principal.
    ///
    /// # Errors
    /// Returns error if the login is rejected.
    pub async fn login(&self) -> Result<(), CloudProviderError> {
        let invocation = Invocation::new("az")
            .args([
                "login",
                "--service-principal",
                "--username",
                self.credentials.client_id.as_str(),
                "--password",
                self.credentials.client_secret.as_str(),
                "--tenant",
                self.credentials.tenant_id.as_str(),
                "--output",
                "none",
            ])
            .sensitive();

        run_checked(self.runner.as_ref(), invocation)
            .await
            .map_err(|e| match e {
                CloudProviderError::Command { stderr, .. } => CloudProviderError::Auth(stderr),
                other => other,
            })?;

        self.az(&["account", "set", "--subscription", &self.credentials.subscription_id])
            .await?;
        info!("Logged in to Azure as service principal");
        Ok(())
    }

    /// Create or update the resource group.
    ///
    /// # Errors
    /// Returns error if the CLI call fails.
    pub async fn ensure_resource_group(&self) -> Result<(), CloudProviderError> {
        self.az(&[
            "group",
            "create",
            "--name",
            &self.resource_group,
            "--location",
            &self.location,
        ])
        .await?;
        info!(name = %self.resource_group, "Created Azure Resource Group");
        Ok(())
    }

    /// Create a StorageV2 account (Hot tier, locally redundant, public blob access allowed).
    ///
    /// # Errors
    /// Returns error if the CLI call fails.
    pub async fn ensure_storage_account(
        &self,
        name: &str,
        cluster_name: &str,
    ) -> Result<(), CloudProviderError> {
        info!(storage_account = %name, "Creating / updating Azure Storage Account");
        let tag = format!("cluster={cluster_name}");
        self.az(&[
            "storage",
            "account",
            "create",
            "--name",
            name,
            "--resource-group",
            &self.resource_group,
            "--location",
            &self.location,
            "--kind",
            "StorageV2",
            "--sku",
            "Standard_LRS",
            "--access-tier",
            "Hot",
            "--allow-blob-public-access",
            "true",
            "--tags",
            &tag,
        ])
        .await?;
        Ok(())
    }

    /// First access key of a storage account.
    ///
    /// # Errors
    /// Returns error if the account has no keys or the CLI call fails.
    pub async fn storage_account_key(&self, account: &str) -> Result<String, CloudProviderError> {
        let output = self
            .az(&[
                "storage",
                "account",
                "keys",
                "list",
                "--account-name",
                account,
                "--resource-group",
                &self.resource_group,
            ])
            .await?;
        let keys: Vec<StorageAccountKey> = serde_json::from_str(&output)?;
        keys.into_iter()
            .next()
            .map(|key| key.value)
            .ok_or_else(|| CloudProviderError::NotFound(format!("access key of storage account {account}")))
    }

    /// Create a blob container with public blob read access. Existing containers are kept.
    ///
    /// # Errors
    /// Returns error if the CLI call fails.
    pub async fn ensure_blob_container(
        &self,
        account: &str,
        container: &str,
    ) -> Result<(), CloudProviderError> {
        self.az(&[
            "storage",
            "container",
            "create",
            "--name",
            container,
            "--account-name",
            account,
            "--public-access",
            "blob",
            "--auth-mode",
            "login",
        ])
        .await?;
        info!(container = %container, "Ensured Azure Blob Container");
        Ok(())
    }

    /// Upload `content` to `container/blob`, retrying while the container settles.
    ///
    /// # Errors
    /// Returns the last upload error once all attempts are used.
    pub async fn upload_blob(
        &self,
        account: &str,
        container: &str,
        blob: &str,
        content: &str,
    ) -> Result<(), CloudProviderError> {
        let mut attempt = 1;
        loop {
            let result = self
                .az(&[
                    "storage",
                    "blob",
                    "upload",
                    "--account-name",
                    account,
                    "--container-name",
                    container,
                    "--name",
                    blob,
                    "--data",
                    content,
                    "--overwrite",
                    "--auth-mode",
                    "login",
                ])
                .await;

            match result {
                Ok(_) => {
                    info!(container = %container, blob = %blob, "Uploaded blob");
                    return Ok(());
                }
                Err(e) if attempt < UPLOAD_ATTEMPTS => {
                    warn!(attempt, error = %e, blob = %blob, "Blob upload failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.upload_retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Fetch a public blob over HTTPS and check it matches what was uploaded.
    ///
    /// # Errors
    /// Returns [`CloudProviderError::Config`] on a content mismatch.
    pub async fn verify_public_blob(&self, url: &Url, expected: &str) -> Result<(), CloudProviderError> {
        debug!(url = %url, "Verifying uploaded blob");
        let body = self
            .http
            .get(url.clone())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        if body.trim_end() == expected.trim_end() {
            Ok(())
        } else {
            Err(CloudProviderError::Config(format!(
                "blob served at {url} does not match the uploaded document"
            )))
        }
    }

    /// Create a user assigned identity and grant it `role_id` on `scope`.
    ///
    /// # Errors
    /// Returns error if a CLI call fails.
    pub async fn ensure_identity(
        &self,
        name: &str,
        cluster_name: &str,
        role_id: &str,
        scope: &str,
    ) -> Result<ManagedIdentity, CloudProviderError> {
        info!(name = %name, "Creating User Assigned Identity");
        let tag = format!("cluster={cluster_name}");
        let output = self
            .az(&[
                "identity",
                "create",
                "--name",
                name,
                "--resource-group",
                &self.resource_group,
                "--location",
                &self.location,
                "--tags",
                &tag,
            ])
            .await?;
        let identity: ManagedIdentity = serde_json::from_str(&output)?;

        self.assign_role(&identity.principal_id, role_id, scope).await?;
        Ok(identity)
    }

    /// Assign a role to a service principal. An existing assignment is accepted.
    ///
    /// # Errors
    /// Returns error if the CLI call fails for any other reason.
    pub async fn assign_role(
        &self,
        principal_id: &str,
        role_id: &str,
        scope: &str,
    ) -> Result<(), CloudProviderError> {
        let result = self
            .az(&[
                "role",
                "assignment",
                "create",
                "--assignee-object-id",
                principal_id,
                "--assignee-principal-type",
                "ServicePrincipal",
                "--role",
                role_id,
                "--scope",
                scope,
            ])
            .await;

        match result {
            Ok(_) => {
                info!(principal = %principal_id, role = %role_id, "Assigned role");
                Ok(())
            }
            Err(CloudProviderError::Command { stderr, .. })
                if stderr.contains("RoleAssignmentExists") =>
            {
                info!(principal = %principal_id, role = %role_id, "Role is already assigned");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Create or update a federated credential binding a Kubernetes service account to an
    /// identity.
    ///
    /// # Errors
    /// Returns error if the CLI call fails.
    pub async fn ensure_federated_credential(
        &self,
        name: &str,
        identity_name: &str,
        issuer: &str,
        namespace: &str,
        service_account: &str,
    ) -> Result<(), CloudProviderError> {
        let subject = format!("system:serviceaccount:{namespace}:{service_account}");
        self.az(&[
            "identity",
            "federated-credential",
            "create",
            "--name",
            name,
            "--identity-name",
            identity_name,
            "--resource-group",
            &self.resource_group,
            "--issuer",
            issuer,
            "--subject",
            &subject,
        ])
        .await?;
        info!(name = %name, subject = %subject, "Created federated identity credential");
        Ok(())
    }

    /// CPU and memory of a VM size in the configured location.
    ///
    /// # Errors
    /// Returns [`CloudProviderError::NotFound`] for unknown VM sizes.
    pub async fn vm_spec(&self, vm_size: &str) -> Result<VmSpec, CloudProviderError> {
        let output = self
            .az(&["vm", "list-sizes", "--location", &self.location])
            .await?;
        let sizes: Vec<VmSize> = serde_json::from_str(&output)?;

        sizes
            .into_iter()
            .find(|size| size.name == vm_size)
            .map(|size| VmSpec {
                cpu: size.number_of_cores,
                memory_mib: size.memory_in_mb,
                root_volume_gib: None,
            })
            .ok_or_else(|| CloudProviderError::NotFound(format!("VM size {vm_size}")))
    }

    /// Generate a JWKS document from a public key with `azwi`.
    ///
    /// # Errors
    /// Returns error if `azwi` fails.
    pub async fn generate_jwks(
        &self,
        public_key_path: &Path,
        output_path: &Path,
    ) -> Result<(), CloudProviderError> {
        let invocation = Invocation::new("azwi").args([
            "jwks".to_string(),
            "--public-keys".to_string(),
            public_key_path.to_string_lossy().into_owned(),
            "--output-file".to_string(),
            output_path.to_string_lossy().into_owned(),
        ]);
        run_checked(self.runner.as_ref(), invocation).await?;
        Ok(())
    }
}

/// Public endpoint of a storage account's blob service.
///
/// # Errors
/// Returns error if the account name does not form a valid host.
pub fn storage_account_url(account: &str) -> Result<Url, CloudProviderError> {
    Url::parse(&format!("https://{account}.blob.core.windows.net/"))
        .map_err(|e| CloudProviderError::Config(format!("invalid storage account {account}: {e}")))
}

/// Service account issuer URL served from `container` of `account`.
///
/// # Errors
/// Returns error if the URL cannot be built.
pub fn service_account_issuer_url(account: &str, container: &str) -> Result<Url, CloudProviderError> {
    storage_account_url(account)?
        .join(container)
        .map_err(|e| CloudProviderError::Config(format!("invalid issuer URL: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{CommandOutput, MockCommandRunner};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credentials() -> AzureCredentials {
        AzureCredentials {
            tenant_id: "tenant".into(),
            subscription_id: "sub".into(),
            client_id: "client".into(),
            client_secret: "secret".into(),
        }
    }

    fn ok(stdout: &str) -> Result<CommandOutput, CloudProviderError> {
        Ok(CommandOutput {
            status: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        })
    }

    fn failed(stderr: &str) -> Result<CommandOutput, CloudProviderError> {
        Ok(CommandOutput {
            status: 1,
            stdout: String::new(),
            stderr: stderr.to_string(),
        })
    }

    #[test]
    fn test_service_account_issuer_url() {
        let url = service_account_issuer_url("kubeaidprod", "oidc-provider").unwrap();
        assert_eq!(url.as_str(), "https://kubeaidprod.blob.core.windows.net/oidc-provider");
    }

    #[tokio::test]
    async fn test_login_failure_is_auth_error() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|inv| inv.sensitive && inv.args.first().map(String::as_str) == Some("login"))
            .returning(|_| failed("AADSTS7000215: Invalid client secret provided."));

        let azure = Azure::with_runner(credentials(), "prod", "westeurope", Arc::new(runner)).unwrap();
        let err = azure.login().await.unwrap_err();
        assert!(matches!(err, CloudProviderError::Auth(_)));
    }

    #[tokio::test]
    async fn test_vm_spec_finds_size() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_| {
            ok(r#"[
                {"name": "Standard_B2s", "numberOfCores": 2, "memoryInMB": 4096, "osDiskSizeInMB": 1047552},
                {"name": "Standard_D4s_v3", "numberOfCores": 4, "memoryInMB": 16384}
            ]"#)
        });

        let azure = Azure::with_runner(credentials(), "prod", "westeurope", Arc::new(runner)).unwrap();
        let spec = azure.vm_spec("Standard_D4s_v3").await.unwrap();
        assert_eq!(spec.cpu, 4);
        assert_eq!(spec.memory_mib, 16384);

        assert!(matches!(
            azure.vm_spec("Standard_X1").await.unwrap_err(),
            CloudProviderError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_upload_blob_retries_until_container_is_ready() {
        let mut runner = MockCommandRunner::new();
        let mut seq = mockall::Sequence::new();
        runner
            .expect_run()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| failed("ContainerNotFound"));
        runner
            .expect_run()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| ok("{}"));

        let azure = Azure::with_runner(credentials(), "prod", "westeurope", Arc::new(runner))
            .unwrap()
            .with_upload_retry_delay(Duration::from_millis(1));
        azure
            .upload_blob("kubeaidprod", "oidc-provider", "openid/v1/jwks", "{}")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_assign_role_accepts_existing_assignment() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .returning(|_| failed("(RoleAssignmentExists) The role assignment already exists."));

        let azure = Azure::with_runner(credentials(), "prod", "westeurope", Arc::new(runner)).unwrap();
        azure
            .assign_role("principal", ROLE_ID_CONTRIBUTOR, "/subscriptions/sub")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_verify_public_blob_detects_mismatch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/oidc-provider/openid/v1/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"keys\":[]}"))
            .mount(&server)
            .await;

        let azure =
            Azure::with_runner(credentials(), "prod", "westeurope", Arc::new(MockCommandRunner::new()))
                .unwrap();
        let url = Url::parse(&format!("{}/oidc-provider/openid/v1/jwks", server.uri())).unwrap();

        azure.verify_public_blob(&url, "{\"keys\":[]}").await.unwrap();
        assert!(azure.verify_public_blob(&url, "{\"keys\":[1]}").await.is_err());
    }
}
