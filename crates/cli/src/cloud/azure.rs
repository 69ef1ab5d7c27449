//! Azure: workload identity through a self-hosted OIDC issuer, either provisioned directly with
//! `az` or through Crossplane claims.

use std::sync::Arc;

use async_trait::async_trait;
use kube::Client;
use kubeaid_cloud::azure::{
    service_account_issuer_url, AzureCredentials, ROLE_ID_CONTRIBUTOR,
    ROLE_ID_STORAGE_BLOB_DATA_OWNER,
};
use kubeaid_cloud::{Azure, CommandRunner};
use serde_json::json;
use tracing::{debug, info};
use url::Url;

use super::{
    recreate_machine_template, set_json_path, CloudProvider, InfrastructureRef,
    MachineImageUpdates,
};
use crate::argocd::ArgoCd;
use crate::config::{AzureConfig, CloudKind, Config};
use crate::constants::{
    APPS_CROSSPLANE, APP_INFRASTRUCTURE, APP_VELERO, BLOB_CONTAINER_OIDC_PROVIDER,
    BLOB_JWKS_DOCUMENT, BLOB_OPENID_CONFIGURATION, CROSSPLANE_POLL, NAMESPACE_CROSSPLANE,
    NAMESPACE_VELERO, SERVICE_ACCOUNT_ASO, SERVICE_ACCOUNT_CAPZ, SERVICE_ACCOUNT_VELERO, UAMI_CAPI,
    UAMI_VELERO,
};
use crate::error::{Error, Result};
use crate::k8s::resources::{
    condition_is_true, disaster_recovery_infrastructure, namespaced,
    workload_identity_infrastructure,
};
use crate::k8s::{connect, secret_value};
use crate::session::{ClusterTarget, Session};
use crate::templates::{set_yaml_path, CloudTemplateValues};

/// Keys of the connection Secrets the Crossplane compositions write.
const SECRET_KEY_CAPI_UAMI_CLIENT_ID: &str = "capiUAMIClientID";
const SECRET_KEY_VELERO_UAMI_CLIENT_ID: &str = "veleroUAMIClientID";
const SECRET_KEY_STORAGE_ACCOUNT_KEY: &str = "storageAccountPrimaryKey";

pub struct AzureProvider {
    azure: Azure,
}

impl AzureProvider {
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the Azure section or credentials are missing.
    pub fn from_config(config: &Config, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let azure_config = config.azure()?;
        let credentials = config
            .secrets
            .azure
            .as_ref()
            .ok_or_else(|| Error::config("azure credentials are missing from secrets.yaml"))?;

        let azure = Azure::with_runner(
            AzureCredentials {
                tenant_id: azure_config.tenant_id.clone(),
                subscription_id: azure_config.subscription_id.clone(),
                client_id: credentials.client_id.clone(),
                client_secret: credentials.client_secret.clone(),
            },
            config.cluster_name(),
            azure_config.location.clone(),
            runner,
        )?;
        Ok(Self { azure })
    }

    fn storage_account_scope(&self, account: &str) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Storage/storageAccounts/{account}",
            self.azure.subscription_id(),
            self.azure.resource_group()
        )
    }

    fn subscription_scope(&self) -> String {
        format!("/subscriptions/{}", self.azure.subscription_id())
    }

    /// The UAMIs workload identity federates to, created when missing.
    async fn ensure_identities(
        &self,
        session: &Session,
        azure_config: &AzureConfig,
    ) -> Result<(String, Option<String>)> {
        let cluster = session.cluster_name();
        let capi = self
            .azure
            .ensure_identity(UAMI_CAPI, cluster, ROLE_ID_CONTRIBUTOR, &self.subscription_scope())
            .await?;

        let velero = if session.config.disaster_recovery().is_some() {
            let identity = self
                .azure
                .ensure_identity(
                    UAMI_VELERO,
                    cluster,
                    ROLE_ID_STORAGE_BLOB_DATA_OWNER,
                    &self.storage_account_scope(&azure_config.storage_account),
                )
                .await?;
            Some(identity.client_id)
        } else {
            None
        };
        Ok((capi.client_id, velero))
    }

    /// Upload the OIDC discovery and JWKS documents and check both are publicly readable.
    async fn publish_oidc_documents(
        &self,
        session: &Session,
        azure_config: &AzureConfig,
    ) -> Result<()> {
        let account = &azure_config.storage_account;
        let issuer = service_account_issuer_url(account, BLOB_CONTAINER_OIDC_PROVIDER)?;
        info!(issuer = %issuer, "Publishing OIDC provider documents");

        self.azure
            .ensure_blob_container(account, BLOB_CONTAINER_OIDC_PROVIDER)
            .await?;

        let discovery = serde_json::to_string_pretty(&openid_configuration(&issuer)?)?;
        self.azure
            .upload_blob(account, BLOB_CONTAINER_OIDC_PROVIDER, BLOB_OPENID_CONFIGURATION, &discovery)
            .await?;
        self.azure
            .verify_public_blob(&blob_url(&issuer, BLOB_OPENID_CONFIGURATION)?, &discovery)
            .await?;

        let jwks_path = session.paths.jwks_document();
        if let Some(parent) = jwks_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let public_key = &azure_config
            .workload_identity
            .openid_provider_ssh_key_pair
            .public_key_file_path;
        self.azure.generate_jwks(public_key, &jwks_path).await?;
        let jwks = std::fs::read_to_string(&jwks_path)?;

        self.azure
            .upload_blob(account, BLOB_CONTAINER_OIDC_PROVIDER, BLOB_JWKS_DOCUMENT, &jwks)
            .await?;
        self.azure
            .verify_public_blob(&blob_url(&issuer, BLOB_JWKS_DOCUMENT)?, &jwks)
            .await?;

        info!("Published OIDC provider documents");
        Ok(())
    }

    async fn claims_ready(&self, client: &Client, session: &Session) -> Result<bool> {
        let mut claims = vec![workload_identity_infrastructure()];
        if session.config.disaster_recovery().is_some() {
            claims.push(disaster_recovery_infrastructure());
        }

        for claim in claims {
            let api = namespaced(client, NAMESPACE_CROSSPLANE, &claim);
            let ready = api
                .get_opt(session.cluster_name())
                .await?
                .is_some_and(|object| condition_is_true(&object, "Ready"));
            if !ready {
                debug!(kind = %claim.kind, "Crossplane claim not ready yet");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Values the Crossplane compositions wrote into their connection Secrets.
    async fn crossplane_values(&self, client: &Client, session: &Session) -> Result<CloudTemplateValues> {
        let cluster = session.cluster_name();
        let workload_identity = format!("{cluster}-workload-identity-infrastructure");
        let disaster_recovery = format!("{cluster}-disaster-recovery-infrastructure");

        let mut values = CloudTemplateValues {
            capi_uami_client_id: secret_value(
                client,
                NAMESPACE_CROSSPLANE,
                &workload_identity,
                SECRET_KEY_CAPI_UAMI_CLIENT_ID,
            )
            .await?,
            service_account_issuer_url: Some(self.issuer(&session.config)?),
            ..CloudTemplateValues::default()
        };
        if session.config.disaster_recovery().is_some() {
            values.velero_uami_client_id = secret_value(
                client,
                NAMESPACE_CROSSPLANE,
                &disaster_recovery,
                SECRET_KEY_VELERO_UAMI_CLIENT_ID,
            )
            .await?;
            values.azure_storage_account_access_key = secret_value(
                client,
                NAMESPACE_CROSSPLANE,
                &disaster_recovery,
                SECRET_KEY_STORAGE_ACCOUNT_KEY,
            )
            .await?;
        }
        Ok(values)
    }

    fn issuer(&self, config: &Config) -> Result<String> {
        let account = &config.azure()?.storage_account;
        Ok(service_account_issuer_url(account, BLOB_CONTAINER_OIDC_PROVIDER)?.to_string())
    }
}

/// The OpenID Connect discovery document Azure AD federation reads.
fn openid_configuration(issuer: &Url) -> Result<serde_json::Value> {
    Ok(json!({
        "issuer": issuer.as_str(),
        "jwks_uri": blob_url(issuer, BLOB_JWKS_DOCUMENT)?.as_str(),
        "response_types_supported": ["id_token"],
        "subject_types_supported": ["public"],
        "id_token_signing_alg_values_supported": ["RS256"]
    }))
}

/// Public URL of `blob` inside the issuer's container.
fn blob_url(issuer: &Url, blob: &str) -> Result<Url> {
    let base = issuer.as_str().trim_end_matches('/');
    Url::parse(&format!("{base}/{blob}"))
        .map_err(|e| Error::config(format!("invalid blob URL for {blob}: {e}")))
}

#[async_trait]
impl CloudProvider for AzureProvider {
    fn kind(&self) -> CloudKind {
        CloudKind::Azure
    }

    async fn hydrate_vm_specs(&self, config: &mut Config) -> Result<()> {
        let Some(azure) = config.general.cloud.azure.as_mut() else {
            return Ok(());
        };
        for node_group in &mut azure.node_groups {
            let spec = self.azure.vm_spec(&node_group.vm_size).await?;
            node_group.autoscaling.cpu = spec.cpu;
            node_group.autoscaling.memory = spec.memory_gib();
        }
        Ok(())
    }

    async fn setup_prerequisites(&self, session: &Session) -> Result<()> {
        let azure_config = session.config.azure()?;
        if azure_config.use_crossplane {
            debug!("Azure infrastructure is provisioned through Crossplane");
            return Ok(());
        }

        let cluster = session.cluster_name();
        let account = &azure_config.storage_account;
        let namespace = session.config.capi_namespace();

        self.azure.login().await?;
        self.azure.ensure_resource_group().await?;
        self.azure.ensure_storage_account(account, cluster).await?;
        self.azure
            .assign_role(
                &azure_config.aad_application.principal_id,
                ROLE_ID_STORAGE_BLOB_DATA_OWNER,
                &self.storage_account_scope(account),
            )
            .await?;

        self.publish_oidc_documents(session, azure_config).await?;

        let issuer = self.issuer(&session.config)?;
        let (_, velero) = self.ensure_identities(session, azure_config).await?;
        self.azure
            .ensure_federated_credential(
                "capz-federated-identity",
                UAMI_CAPI,
                &issuer,
                &namespace,
                SERVICE_ACCOUNT_CAPZ,
            )
            .await?;
        self.azure
            .ensure_federated_credential(
                "aso-federated-identity",
                UAMI_CAPI,
                &issuer,
                &namespace,
                SERVICE_ACCOUNT_ASO,
            )
            .await?;
        if velero.is_some() {
            self.azure
                .ensure_federated_credential(
                    "velero-federated-identity",
                    UAMI_VELERO,
                    &issuer,
                    NAMESPACE_VELERO,
                    SERVICE_ACCOUNT_VELERO,
                )
                .await?;
        }

        info!("Set up Azure workload identity");
        Ok(())
    }

    async fn template_values(&self, session: &Session) -> Result<CloudTemplateValues> {
        let azure_config = session.config.azure()?;

        if azure_config.use_crossplane {
            // Nothing to read before the claims have been provisioned.
            let kubeconfig = session.kubeconfig(ClusterTarget::Management);
            if !kubeconfig.is_file() {
                return Ok(CloudTemplateValues::default());
            }
            let client = connect(&kubeconfig).await?;
            return self.crossplane_values(&client, session).await;
        }

        self.azure.login().await?;
        self.azure.ensure_resource_group().await?;
        self.azure
            .ensure_storage_account(&azure_config.storage_account, session.cluster_name())
            .await?;
        let (capi, velero) = self.ensure_identities(session, azure_config).await?;

        let storage_key = if session.config.disaster_recovery().is_some() {
            Some(
                self.azure
                    .storage_account_key(&azure_config.storage_account)
                    .await?,
            )
        } else {
            None
        };

        Ok(CloudTemplateValues {
            capi_uami_client_id: Some(capi),
            velero_uami_client_id: velero,
            azure_storage_account_access_key: storage_key,
            service_account_issuer_url: Some(self.issuer(&session.config)?),
            ..CloudTemplateValues::default()
        })
    }

    async fn provision_infrastructure(
        &self,
        session: &Session,
        argocd: &mut ArgoCd,
        management: &Client,
    ) -> Result<Option<CloudTemplateValues>> {
        let azure_config = session.config.azure()?;
        if !azure_config.use_crossplane {
            return Ok(None);
        }

        for app in APPS_CROSSPLANE {
            argocd.sync(app, &[]).await?;
        }
        argocd.sync(APP_INFRASTRUCTURE, &[]).await?;

        info!("Waiting for Crossplane to provision the infrastructure");
        while !self.claims_ready(management, session).await? {
            tokio::time::sleep(CROSSPLANE_POLL).await;
        }
        info!("Crossplane provisioned the infrastructure");

        self.azure.login().await?;
        self.publish_oidc_documents(session, azure_config).await?;

        Ok(Some(self.crossplane_values(management, session).await?))
    }

    async fn setup_disaster_recovery(&self, session: &Session, argocd: &mut ArgoCd) -> Result<()> {
        let dr = session
            .config
            .disaster_recovery()
            .ok_or_else(|| Error::config("cloud.disasterRecovery section is missing"))?;
        let account = &session.config.azure()?.storage_account;
        info!("Setting up disaster recovery");

        self.azure
            .ensure_blob_container(account, &dr.velero_backups_bucket_name)
            .await?;
        self.azure
            .ensure_blob_container(account, &dr.sealed_secrets_backups_bucket_name)
            .await?;

        argocd.sync(APP_VELERO, &[]).await?;
        Ok(())
    }

    async fn update_machine_template(
        &self,
        client: &Client,
        namespace: &str,
        template: &InfrastructureRef,
        updates: &MachineImageUpdates,
    ) -> Result<()> {
        let Some(offer) = updates.image_offer.clone() else {
            return Ok(());
        };
        recreate_machine_template(client, namespace, template, move |object| {
            set_json_path(object, "/spec/template/spec/image/marketplace/offer", &offer)
        })
        .await
    }

    fn update_values_file(
        &self,
        document: &mut serde_yaml::Value,
        updates: &MachineImageUpdates,
    ) -> Result<()> {
        if let Some(offer) = updates.image_offer.as_deref() {
            set_yaml_path(
                document,
                &["azure", "canonicalUbuntuImage", "offer"],
                offer.into(),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::generate::{render_sample, SampleKind};
    use crate::config::test_config;
    use kubeaid_cloud::MockCommandRunner;

    fn issuer() -> Url {
        service_account_issuer_url("kubeaiddemo", BLOB_CONTAINER_OIDC_PROVIDER).unwrap()
    }

    #[test]
    fn test_openid_configuration_fields() {
        let document = openid_configuration(&issuer()).unwrap();
        assert_eq!(
            document["issuer"],
            "https://kubeaiddemo.blob.core.windows.net/oidc-provider"
        );
        assert_eq!(
            document["jwks_uri"],
            "https://kubeaiddemo.blob.core.windows.net/oidc-provider/openid/v1/jwks"
        );
        assert_eq!(document["id_token_signing_alg_values_supported"][0], "RS256");
        assert_eq!(document.as_object().unwrap().len(), 5);
    }

    #[test]
    fn test_blob_url_keeps_container() {
        let url = blob_url(&issuer(), BLOB_OPENID_CONFIGURATION).unwrap();
        assert_eq!(
            url.as_str(),
            "https://kubeaiddemo.blob.core.windows.net/oidc-provider/.well-known/openid-configuration"
        );
    }

    #[test]
    fn test_provider_scopes() {
        let (general, secrets) = render_sample(SampleKind::Azure).unwrap();
        let config = test_config(&general, &secrets);
        let provider =
            AzureProvider::from_config(&config, Arc::new(MockCommandRunner::new())).unwrap();

        assert_eq!(provider.azure.resource_group(), "kubeaid-demo-azure");
        assert_eq!(provider.subscription_scope(), "/subscriptions/xxxxxxxxxx");
        assert_eq!(
            provider.storage_account_scope("kubeaiddemo"),
            "/subscriptions/xxxxxxxxxx/resourceGroups/kubeaid-demo-azure/providers/Microsoft.Storage/storageAccounts/kubeaiddemo"
        );
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let (general, _) = render_sample(SampleKind::Azure).unwrap();
        let config = test_config(&general, "");
        let err = AzureProvider::from_config(&config, Arc::new(MockCommandRunner::new()))
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_values_file_image_offer() {
        let (general, secrets) = render_sample(SampleKind::Azure).unwrap();
        let provider = AzureProvider::from_config(
            &test_config(&general, &secrets),
            Arc::new(MockCommandRunner::new()),
        )
        .unwrap();

        let mut document: serde_yaml::Value = serde_yaml::from_str(
            "azure:\n  canonicalUbuntuImage:\n    offer: old\n    sku: 22_04-lts-gen2\n",
        )
        .unwrap();
        let updates = MachineImageUpdates {
            image_offer: Some("ubuntu-24_04-lts".into()),
            ..MachineImageUpdates::default()
        };
        provider.update_values_file(&mut document, &updates).unwrap();

        assert_eq!(document["azure"]["canonicalUbuntuImage"]["offer"], "ubuntu-24_04-lts");
        assert_eq!(document["azure"]["canonicalUbuntuImage"]["sku"], "22_04-lts-gen2");
    }
}
