//! Cloud adapters.
//!
//! Every cloud the CLI provisions on implements [`CloudProvider`]. The orchestrator only talks
//! to the trait; [`Cloud`] picks the implementation from the parsed config.

pub mod aws;
pub mod azure;
pub mod bare_metal;
pub mod hetzner;
pub mod local;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{DeleteParams, PostParams};
use kube::Client;
use kubeaid_cloud::CommandRunner;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::argocd::ArgoCd;
use crate::config::{CloudKind, Config};
use crate::constants::{APP_CAPI_CLUSTER, MACHINE_TEMPLATE_DELETE_POLL, MACHINE_TEMPLATE_DELETE_TIMEOUT};
use crate::error::{Error, Result};
use crate::k8s::is_not_found;
use crate::k8s::resources::{machine_template, namespaced};
use crate::session::Session;
use crate::templates::CloudTemplateValues;

pub use aws::AwsProvider;
pub use azure::AzureProvider;
pub use bare_metal::BareMetalProvider;
pub use hetzner::HetznerProvider;
pub use local::LocalProvider;

/// OS image changes requested by `cluster upgrade`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineImageUpdates {
    /// AWS AMI id.
    pub ami_id: Option<String>,
    /// Azure marketplace image offer.
    pub image_offer: Option<String>,
    /// HCloud image name.
    pub image_name: Option<String>,
    /// Hetzner installimage tarball path.
    pub image_path: Option<String>,
}

/// The `infrastructureRef` of a KubeadmControlPlane or MachineDeployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfrastructureRef {
    pub kind: String,
    pub name: String,
}

/// What each cloud contributes to the workflows.
///
/// Every hook has a no-op default except the ones a cloud must opt into.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    fn kind(&self) -> CloudKind;

    /// Fill in the CPU and memory of autoscaled node groups from the cloud API.
    async fn hydrate_vm_specs(&self, _config: &mut Config) -> Result<()> {
        Ok(())
    }

    /// One-shot infrastructure the management cluster needs before CAPI can run.
    async fn setup_prerequisites(&self, _session: &Session) -> Result<()> {
        Ok(())
    }

    /// Cloud specific values for the KubeAid config templates.
    async fn template_values(&self, _session: &Session) -> Result<CloudTemplateValues> {
        Ok(CloudTemplateValues::default())
    }

    /// Provision infrastructure through the freshly installed ArgoCD of the management cluster.
    ///
    /// Returns new template values when the config repository has to be re-rendered with them.
    async fn provision_infrastructure(
        &self,
        _session: &Session,
        _argocd: &mut ArgoCd,
        _management: &Client,
    ) -> Result<Option<CloudTemplateValues>> {
        Ok(None)
    }

    /// Bring up the main cluster on clouds Cluster API does not manage, writing its kubeconfig
    /// to the main kubeconfig path.
    async fn provision_without_capi(&self, _session: &Session, _cluster_dir: &Path) -> Result<()> {
        Err(Error::Unsupported(format!(
            "provisioning {} without Cluster API",
            self.kind()
        )))
    }

    /// Runs right after the capi-cluster App was synced in the management cluster.
    async fn on_capi_cluster_synced(&self, _session: &Session, _management: &Client) -> Result<()> {
        Ok(())
    }

    /// Runs before `clusterctl move`, against the main cluster.
    async fn before_pivot(&self, _session: &Session, _main_kubeconfig: &Path) -> Result<()> {
        Ok(())
    }

    /// Create backup storage and identities, then sync the backup Apps.
    async fn setup_disaster_recovery(&self, _session: &Session, _argocd: &mut ArgoCd) -> Result<()> {
        Err(Error::Unsupported("disaster recovery".to_string()))
    }

    /// Download and decompress the sealed-secrets controller key backups into `destination`.
    /// Returns how many keys were written.
    async fn download_sealed_secrets_backups(
        &self,
        _session: &Session,
        _destination: &Path,
    ) -> Result<usize> {
        Err(Error::Unsupported("cluster recovery".to_string()))
    }

    /// Swap the OS image of the machine template `template` refers to.
    async fn update_machine_template(
        &self,
        _client: &Client,
        _namespace: &str,
        _template: &InfrastructureRef,
        _updates: &MachineImageUpdates,
    ) -> Result<()> {
        Err(Error::Unsupported("cluster upgrade".to_string()))
    }

    /// Record the image changes in the capi-cluster values document.
    fn update_values_file(
        &self,
        _document: &mut serde_yaml::Value,
        _updates: &MachineImageUpdates,
    ) -> Result<()> {
        Err(Error::Unsupported("cluster upgrade".to_string()))
    }
}

/// The adapter of the configured cloud.
pub enum Cloud {
    Aws(AwsProvider),
    Azure(AzureProvider),
    Hetzner(HetznerProvider),
    BareMetal(BareMetalProvider),
    Local(LocalProvider),
}

impl Cloud {
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the credentials the cloud needs are missing.
    pub fn from_config(config: &Config, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let cloud = match config.cloud {
            CloudKind::Aws => Self::Aws(AwsProvider::from_config(config, runner)?),
            CloudKind::Azure => Self::Azure(AzureProvider::from_config(config, runner)?),
            CloudKind::Hetzner => Self::Hetzner(HetznerProvider::from_config(config)?),
            CloudKind::BareMetal => Self::BareMetal(BareMetalProvider::new(runner)),
            CloudKind::Local => Self::Local(LocalProvider),
        };
        debug!(cloud = %config.cloud, "Constructed cloud adapter");
        Ok(cloud)
    }

    #[must_use]
    pub fn provider(&self) -> &dyn CloudProvider {
        match self {
            Self::Aws(provider) => provider,
            Self::Azure(provider) => provider,
            Self::Hetzner(provider) => provider,
            Self::BareMetal(provider) => provider,
            Self::Local(provider) => provider,
        }
    }
}

/// Replace machine template `kind/name` with a mutated copy.
///
/// Machine templates are immutable, so the object is deleted, its absence confirmed, and a copy
/// with a cleared `resourceVersion` created under the same name.
///
/// # Errors
///
/// Returns [`Error::Unsupported`] for unknown kinds, [`Error::StatePrecondition`] when the
/// template is already gone, [`Error::RemoteTransient`] when it outlives the deletion wait, or
/// the Kubernetes API error.
pub async fn recreate_machine_template<F>(
    client: &Client,
    namespace: &str,
    template: &InfrastructureRef,
    mutate: F,
) -> Result<()>
where
    F: FnOnce(&mut Value) -> Result<()> + Send,
{
    recreate_machine_template_with(
        client,
        namespace,
        template,
        mutate,
        MACHINE_TEMPLATE_DELETE_POLL,
        MACHINE_TEMPLATE_DELETE_TIMEOUT,
    )
    .await
}

async fn recreate_machine_template_with<F>(
    client: &Client,
    namespace: &str,
    template: &InfrastructureRef,
    mutate: F,
    poll: Duration,
    timeout: Duration,
) -> Result<()>
where
    F: FnOnce(&mut Value) -> Result<()> + Send,
{
    let resource = machine_template(&template.kind)
        .ok_or_else(|| Error::Unsupported(format!("machine template kind {}", template.kind)))?;
    let api = namespaced(client, namespace, &resource);

    let mut object = match api.get(&template.name).await {
        Ok(object) => object,
        Err(e) if is_not_found(&e) => {
            return Err(Error::precondition(format!(
                "{} {} not found in namespace {namespace}. If an earlier upgrade stopped after \
                 deleting it, sync the {APP_CAPI_CLUSTER} ArgoCD App to recreate it from the \
                 KubeAid config repository, then re-run the upgrade",
                template.kind, template.name
            )));
        }
        Err(e) => return Err(e.into()),
    };
    mutate(&mut object.data)?;

    api.delete(&template.name, &DeleteParams::default()).await?;

    let deadline = Instant::now() + timeout;
    while api.get_opt(&template.name).await?.is_some() {
        if Instant::now() >= deadline {
            return Err(Error::RemoteTransient(format!(
                "{} {} still exists {}s after deletion",
                template.kind,
                template.name,
                timeout.as_secs()
            )));
        }
        debug!(kind = %template.kind, name = %template.name, "Waiting for machine template deletion");
        tokio::time::sleep(poll).await;
    }
    info!(kind = %template.kind, name = %template.name, "Deleted machine template");

    object.metadata.resource_version = None;
    object.metadata.uid = None;
    object.metadata.creation_timestamp = None;
    object.metadata.deletion_timestamp = None;
    object.metadata.managed_fields = None;
    object.metadata.generation = None;

    api.create(&PostParams::default(), &object).await?;
    info!(kind = %template.kind, name = %template.name, "Recreated machine template");
    Ok(())
}

/// Set the string at JSON pointer `pointer`, creating intermediate objects.
///
/// # Errors
///
/// Returns [`Error::StatePrecondition`] when a non-object sits on the path.
pub fn set_json_path(document: &mut Value, pointer: &str, value: &str) -> Result<()> {
    let mut current = document;
    let keys: Vec<&str> = pointer.trim_start_matches('/').split('/').collect();
    let Some((last, parents)) = keys.split_last() else {
        return Ok(());
    };

    for key in parents {
        if current.is_null() {
            *current = Value::Object(serde_json::Map::new());
        }
        current = current
            .as_object_mut()
            .ok_or_else(|| Error::precondition(format!("expected an object above {key}")))?
            .entry((*key).to_string())
            .or_insert(Value::Null);
    }
    if current.is_null() {
        *current = Value::Object(serde_json::Map::new());
    }
    current
        .as_object_mut()
        .ok_or_else(|| Error::precondition(format!("expected an object above {last}")))?
        .insert((*last).to_string(), Value::from(value));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_json_path_creates_parents() {
        let mut document = json!({ "spec": { "template": {} } });
        set_json_path(&mut document, "/spec/template/spec/ami/id", "ami-NEW").unwrap();
        assert_eq!(document["spec"]["template"]["spec"]["ami"]["id"], "ami-NEW");
    }

    #[test]
    fn test_set_json_path_rejects_scalars() {
        let mut document = json!({ "spec": "oops" });
        assert!(set_json_path(&mut document, "/spec/template", "x").is_err());
    }

    #[test]
    fn test_default_hooks_are_unsupported() {
        let provider = LocalProvider;
        let mut document = serde_yaml::Value::Null;
        let err = provider
            .update_values_file(&mut document, &MachineImageUpdates::default())
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    mod machine_templates {
        use super::*;
        use http::{Method, Request, Response, StatusCode};
        use kube::client::Body;
        use tower_test::mock::{Handle, SendResponse};

        const PATH: &str = "/apis/infrastructure.cluster.x-k8s.io/v1beta2/namespaces/capi-cluster/awsmachinetemplates";

        type ApiHandle = Handle<Request<Body>, Response<Body>>;

        fn template() -> InfrastructureRef {
            InfrastructureRef {
                kind: "AWSMachineTemplate".into(),
                name: "demo-control-plane".into(),
            }
        }

        fn template_object() -> Value {
            json!({
                "apiVersion": "infrastructure.cluster.x-k8s.io/v1beta2",
                "kind": "AWSMachineTemplate",
                "metadata": {
                    "name": "demo-control-plane",
                    "namespace": "capi-cluster",
                    "resourceVersion": "4242",
                    "uid": "0b9b7c2e-1c1f-4d5e-9d68-0d6a0c1f2f11",
                    "generation": 1
                },
                "spec": { "template": { "spec": { "ami": { "id": "ami-OLD" } } } }
            })
        }

        fn not_found() -> Value {
            json!({
                "kind": "Status",
                "apiVersion": "v1",
                "metadata": {},
                "status": "Failure",
                "message": "awsmachinetemplates \"demo-control-plane\" not found",
                "reason": "NotFound",
                "code": 404
            })
        }

        fn respond(send: SendResponse<Response<Body>>, status: StatusCode, body: &Value) {
            let bytes = serde_json::to_vec(body).unwrap();
            send.send_response(Response::builder().status(status).body(Body::from(bytes)).unwrap());
        }

        async fn expect(handle: &mut ApiHandle, verb: Method, path: &str) -> (Request<Body>, SendResponse<Response<Body>>) {
            let (request, send) = handle.next_request().await.expect("no request was sent");
            assert_eq!(request.method(), verb);
            assert_eq!(request.uri().path(), path);
            (request, send)
        }

        async fn recreate(client: &Client, timeout: Duration) -> Result<()> {
            recreate_machine_template_with(
                client,
                "capi-cluster",
                &template(),
                |data| set_json_path(data, "/spec/template/spec/ami/id", "ami-NEW"),
                Duration::from_millis(1),
                timeout,
            )
            .await
        }

        #[tokio::test]
        async fn test_template_is_recreated_once_deletion_completes() {
            let (service, mut handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
            let client = Client::new(service, "default");
            let item = format!("{PATH}/demo-control-plane");

            let server = tokio::spawn(async move {
                let (_, send) = expect(&mut handle, Method::GET, &item).await;
                respond(send, StatusCode::OK, &template_object());

                let (_, send) = expect(&mut handle, Method::DELETE, &item).await;
                respond(send, StatusCode::OK, &template_object());

                // Finalizers keep the object around for a while.
                let (_, send) = expect(&mut handle, Method::GET, &item).await;
                respond(send, StatusCode::OK, &template_object());
                let (_, send) = expect(&mut handle, Method::GET, &item).await;
                respond(send, StatusCode::NOT_FOUND, &not_found());

                let (request, send) = expect(&mut handle, Method::POST, PATH).await;
                let body = request.into_body().collect_bytes().await.unwrap();
                let created: Value = serde_json::from_slice(&body).unwrap();
                assert_eq!(created["spec"]["template"]["spec"]["ami"]["id"], "ami-NEW");
                assert_eq!(created["metadata"]["name"], "demo-control-plane");
                assert!(created["metadata"].get("resourceVersion").is_none());
                assert!(created["metadata"].get("uid").is_none());
                respond(send, StatusCode::CREATED, &created);
            });

            recreate(&client, Duration::from_secs(5)).await.unwrap();
            server.await.unwrap();
        }

        #[tokio::test]
        async fn test_missing_template_asks_for_resync() {
            let (service, mut handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
            let client = Client::new(service, "default");

            let server = tokio::spawn(async move {
                let (_, send) = expect(&mut handle, Method::GET, &format!("{PATH}/demo-control-plane")).await;
                respond(send, StatusCode::NOT_FOUND, &not_found());
            });

            let err = recreate(&client, Duration::from_secs(5)).await.unwrap_err();
            server.await.unwrap();
            assert!(matches!(err, Error::StatePrecondition(_)));
            assert!(err.to_string().contains("sync the capi-cluster ArgoCD App"));
        }

        #[tokio::test]
        async fn test_lingering_template_is_not_recreated() {
            let (service, mut handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
            let client = Client::new(service, "default");
            let item = format!("{PATH}/demo-control-plane");

            let server = tokio::spawn(async move {
                let (_, send) = expect(&mut handle, Method::GET, &item).await;
                respond(send, StatusCode::OK, &template_object());
                let (_, send) = expect(&mut handle, Method::DELETE, &item).await;
                respond(send, StatusCode::OK, &template_object());
                let (_, send) = expect(&mut handle, Method::GET, &item).await;
                respond(send, StatusCode::OK, &template_object());
            });

            let err = recreate(&client, Duration::ZERO).await.unwrap_err();
            server.await.unwrap();
            assert!(matches!(err, Error::RemoteTransient(_)));
        }
    }
}
