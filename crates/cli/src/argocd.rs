//! ArgoCD installation and Application syncing.
//!
//! The driver talks to the ArgoCD REST API. Against a real cluster the API server is reached
//! through a [`PortForward`] to the `argocd-server` pod. Every request failure reconnects, so a
//! restarted ArgoCD server is picked up transparently.

use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::constants::{
    APP_KUBE_PROMETHEUS, APP_ROOT, APP_VELERO, ARGOCD_APPPROJECT_CRD_URL, ARGOCD_IN_PROGRESS_RETRY,
    ARGOCD_INITIAL_ADMIN_SECRET, ARGOCD_LABEL_MANAGED_BY, ARGOCD_PROJECT_KUBEAID,
    ARGOCD_PROJECT_ROLE_SECRET, ARGOCD_ROLE_KUBEAID_AGENT, ARGOCD_ROOT_SETTLE,
    ARGOCD_SERVER_PORT, ARGOCD_SERVER_SELECTOR, ARGOCD_SYNC_POLL, NAMESPACE_ARGOCD,
    NAMESPACE_OBMONDO, RELEASE_NAME_ARGOCD,
};
use crate::error::{Error, Result};
use crate::git::RepoLocation;
use crate::k8s::client::is_conflict;
use crate::k8s::{connect, ensure_namespace, secret_value, ChartSource, HelmRelease, PortForward};
use crate::session::Session;
use crate::state::{retry_transient, RetryConfig};
use crate::templates::TEMPLATE_VALUES_ARGOCD;

const ADMIN_USER: &str = "admin";
const APPPROJECT_CRD: &str = "crd/appprojects.argoproj.io";
const IN_PROGRESS: &str = "another operation is already in progress";
const SYNCED: &str = "Synced";

/// Attempts at reading an Application before giving up on the server.
const MAX_READ_ATTEMPTS: u32 = 30;

/// Kinds the Velero Application owns but never reports as synced.
const VELERO_UNTRACKED_KINDS: [&str; 2] = ["Schedule", "Backup"];

/// A single resource of an Application to sync instead of the whole Application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncResource {
    pub group: String,
    pub kind: String,
    pub name: String,
}

impl SyncResource {
    pub fn new(group: impl Into<String>, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
            name: name.into(),
        }
    }
}

/// Waits between sync requests and status checks.
#[derive(Debug, Clone)]
pub struct SyncTiming {
    /// Delay before re-requesting a sync while another operation runs.
    pub in_progress_retry: Duration,
    /// Settle time after requesting the root Application's sync.
    pub root_settle: Duration,
    /// Interval between sync status checks.
    pub poll: Duration,
}

impl Default for SyncTiming {
    fn default() -> Self {
        Self {
            in_progress_retry: ARGOCD_IN_PROGRESS_RETRY,
            root_settle: ARGOCD_ROOT_SETTLE,
            poll: ARGOCD_SYNC_POLL,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Application {
    metadata: ApplicationMetadata,
    #[serde(default)]
    status: ApplicationStatus,
}

#[derive(Debug, Deserialize)]
struct ApplicationMetadata {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct ApplicationStatus {
    #[serde(default)]
    sync: SyncStatus,
    #[serde(default)]
    resources: Vec<ResourceStatus>,
}

#[derive(Debug, Default, Deserialize)]
struct SyncStatus {
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct ResourceStatus {
    #[serde(default)]
    group: String,
    kind: String,
    name: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct ApplicationList {
    #[serde(default)]
    items: Option<Vec<Application>>,
}

#[derive(Deserialize)]
struct SessionResponse {
    token: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

/// Whether `application` (or the listed subset of its resources) is synced.
fn application_is_synced(application: &Application, resources: &[SyncResource]) -> bool {
    let status = &application.status;

    if !resources.is_empty() {
        return resources.iter().all(|wanted| {
            status.resources.iter().any(|actual| {
                actual.group == wanted.group
                    && actual.kind == wanted.kind
                    && actual.name == wanted.name
                    && actual.status == SYNCED
            })
        });
    }

    if application.metadata.name == APP_VELERO {
        return status
            .resources
            .iter()
            .filter(|r| !VELERO_UNTRACKED_KINDS.contains(&r.kind.as_str()))
            .all(|r| r.status == SYNCED);
    }

    status.sync.status == SYNCED
}

fn sync_request(name: &str, resources: &[SyncResource]) -> Value {
    let mut options = vec!["CreateNamespace=true"];
    if name == APP_KUBE_PROMETHEUS {
        options.push("ServerSideApply=true");
    }

    let mut request = json!({
        "appNamespace": NAMESPACE_ARGOCD,
        "syncOptions": { "items": options },
        "retryStrategy": {
            "limit": 3,
            "backoff": { "duration": "10s" }
        }
    });
    if !resources.is_empty() {
        request["resources"] = json!(resources);
    }
    request
}

/// How the API server is reached.
enum Endpoint {
    /// Through a port-forward into the cluster, re-established on reconnect.
    Cluster {
        client: Client,
        forward: Option<PortForward>,
    },
    /// A fixed address.
    Fixed { base_url: String },
}

/// An authenticated ArgoCD API session.
pub struct ArgoCd {
    http: reqwest::Client,
    endpoint: Endpoint,
    base_url: String,
    password: String,
    token: String,
    timing: SyncTiming,
}

impl ArgoCd {
    /// Log in as admin to the ArgoCD running in the cluster behind `client`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StatePrecondition`] if the initial admin Secret is missing, or the
    /// port-forward or login error.
    pub async fn connect(client: Client) -> Result<Self> {
        let password = secret_value(&client, NAMESPACE_ARGOCD, ARGOCD_INITIAL_ADMIN_SECRET, "password")
            .await?
            .ok_or_else(|| {
                Error::precondition(format!(
                    "Secret {NAMESPACE_ARGOCD}/{ARGOCD_INITIAL_ADMIN_SECRET} has no password"
                ))
            })?;

        let mut argocd = Self::unauthenticated(
            Endpoint::Cluster {
                client,
                forward: None,
            },
            password,
        )?;
        argocd.reconnect().await?;
        Ok(argocd)
    }

    /// Log in to an ArgoCD API server at a fixed address.
    ///
    /// # Errors
    ///
    /// Returns the login error.
    pub async fn with_base_url(base_url: impl Into<String>, password: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let mut argocd = Self::unauthenticated(Endpoint::Fixed { base_url }, password.into())?;
        argocd.reconnect().await?;
        Ok(argocd)
    }

    fn unauthenticated(endpoint: Endpoint, password: String) -> Result<Self> {
        // The server presents its self-signed certificate on the forwarded port.
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            endpoint,
            base_url: String::new(),
            password,
            token: String::new(),
            timing: SyncTiming::default(),
        })
    }

    #[must_use]
    pub fn with_timing(mut self, timing: SyncTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Re-establish the port-forward (if any) and log in again.
    async fn reconnect(&mut self) -> Result<()> {
        match &mut self.endpoint {
            Endpoint::Cluster { client, forward } => {
                drop(forward.take());
                let started = PortForward::start(
                    client.clone(),
                    NAMESPACE_ARGOCD,
                    ARGOCD_SERVER_SELECTOR,
                    ARGOCD_SERVER_PORT,
                )
                .await?;
                self.base_url = started.https_url();
                *forward = Some(started);
            }
            Endpoint::Fixed { base_url } => self.base_url.clone_from(base_url),
        }

        let url = format!("{}/api/v1/session", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&json!({ "username": ADMIN_USER, "password": self.password }))
            .send()
            .await?;
        let session: SessionResponse = handle_response(response).await?;
        self.token = session.token;

        debug!(url = %self.base_url, "Logged in to ArgoCD");
        Ok(())
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<T> {
        let url = format!("{}{path}", self.base_url);
        debug!(method = %method, url = %url, "ArgoCD request");

        let mut request = self.http.request(method, &url).bearer_auth(&self.token);
        if let Some(body) = body {
            request = request.json(body);
        }
        handle_response(request.send().await?).await
    }

    /// Send a request, re-establishing the connection while the server is unreachable.
    ///
    /// Rejections ([`Error::RemoteFatal`]) are returned at once.
    async fn request_with_reconnect<T: serde::de::DeserializeOwned>(
        &mut self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<T> {
        let mut attempt = 0;
        loop {
            match self.request(method.clone(), path, body).await {
                Ok(response) => return Ok(response),
                Err(e) if matches!(e, Error::RemoteFatal(_)) || attempt + 1 >= MAX_READ_ATTEMPTS => {
                    return Err(e);
                }
                Err(e) => {
                    attempt += 1;
                    warn!(method = %method, path = %path, attempt, error = %e, "ArgoCD request failed, reconnecting");
                    tokio::time::sleep(self.timing.in_progress_retry).await;
                    if let Err(e) = self.reconnect().await {
                        debug!(error = %e, "Reconnecting to ArgoCD failed");
                    }
                }
            }
        }
    }

    async fn application(&mut self, name: &str) -> Result<Application> {
        self.request_with_reconnect(
            Method::GET,
            &format!("/api/v1/applications/{name}?appNamespace={NAMESPACE_ARGOCD}"),
            None,
        )
        .await
    }

    /// Whether Application `name`, or the listed subset of its resources, is synced.
    ///
    /// # Errors
    ///
    /// Returns an error if the Application cannot be read.
    pub async fn is_synced(&mut self, name: &str, resources: &[SyncResource]) -> Result<bool> {
        let application = self.application(name).await?;
        Ok(application_is_synced(&application, resources))
    }

    /// Sync Application `name` (or only `resources` of it) and wait until it is synced.
    ///
    /// Already synced Applications are left alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync request is rejected or the status cannot be read.
    pub async fn sync(&mut self, name: &str, resources: &[SyncResource]) -> Result<()> {
        if self.is_synced(name, resources).await? {
            info!(app = %name, "Skipped syncing ArgoCD App, since it's already synced");
            return Ok(());
        }

        let request = sync_request(name, resources);
        loop {
            let path = format!("/api/v1/applications/{name}/sync");
            match self
                .request_with_reconnect::<Value>(Method::POST, &path, Some(&request))
                .await
            {
                Ok(_) => break,
                Err(e) if e.to_string().contains(IN_PROGRESS) => {
                    debug!(app = %name, "Another operation is in progress, retrying sync request");
                    tokio::time::sleep(self.timing.in_progress_retry).await;
                }
                Err(e) => return Err(e),
            }
        }
        info!(app = %name, "Triggered ArgoCD App sync");

        // Root only generates the other Applications; it is never waited on.
        if name == APP_ROOT {
            tokio::time::sleep(self.timing.root_settle).await;
            return Ok(());
        }

        loop {
            tokio::time::sleep(self.timing.poll).await;
            if self.is_synced(name, resources).await? {
                break;
            }
            info!(app = %name, "Waiting for ArgoCD App to be synced");
        }

        info!(app = %name, "Synced ArgoCD App");
        Ok(())
    }

    /// Sync root, then every Application it generated.
    ///
    /// # Errors
    ///
    /// Stops at the first Application that fails to sync.
    pub async fn sync_all(&mut self) -> Result<()> {
        self.sync(APP_ROOT, &[]).await?;

        let list: ApplicationList = self
            .request_with_reconnect(Method::GET, "/api/v1/applications", None)
            .await?;
        let names: Vec<String> = list
            .items
            .unwrap_or_default()
            .into_iter()
            .map(|app| app.metadata.name)
            .filter(|name| name != APP_ROOT)
            .collect();

        for name in names {
            self.sync(&name, &[]).await?;
        }
        Ok(())
    }

    /// Create the `kubeaid` AppProject unless it exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the API rejects the project for any reason other than its existence.
    pub async fn create_project(&self) -> Result<()> {
        let body = json!({
            "project": {
                "metadata": {
                    "name": ARGOCD_PROJECT_KUBEAID,
                    "namespace": NAMESPACE_ARGOCD
                },
                "spec": {
                    "description": "A list of Kubeaid ArgoCD applications",
                    "sourceRepos": ["*"],
                    "destinations": [{ "name": "*", "namespace": "*", "server": "*" }],
                    "clusterResourceWhitelist": [{ "group": "*", "kind": "*" }],
                    "namespaceResourceWhitelist": [{ "group": "*", "kind": "*" }]
                }
            }
        });

        match self.request::<Value>(Method::POST, "/api/v1/projects", Some(&body)).await {
            Ok(_) => {
                info!(project = %ARGOCD_PROJECT_KUBEAID, "Created ArgoCD project");
                Ok(())
            }
            Err(e) if is_already_exists(&e) => {
                debug!(project = %ARGOCD_PROJECT_KUBEAID, "ArgoCD project already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Trust `ca_bundle` for HTTPS connections to `server_name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the certificate upsert is rejected.
    pub async fn upsert_certificate(&self, server_name: &str, ca_bundle: &str) -> Result<()> {
        let body = json!({
            "items": [{
                "serverName": server_name,
                "certType": "https",
                "certData": ca_bundle
            }]
        });
        self.request::<Value>(Method::POST, "/api/v1/certificates?upsert=true", Some(&body))
            .await?;
        info!(server = %server_name, "Added CA certificate to ArgoCD");
        Ok(())
    }

    /// Add the `kubeaid-agent` role to the `kubeaid` project and issue a token for it.
    ///
    /// # Errors
    ///
    /// Returns an error if the project cannot be updated or the token cannot be issued.
    pub async fn kubeaid_agent_token(&self) -> Result<String> {
        let path = format!("/api/v1/projects/{ARGOCD_PROJECT_KUBEAID}");
        let mut project: Value = self.request(Method::GET, &path, None).await?;

        let roles = project["spec"]["roles"].as_array().cloned().unwrap_or_default();
        let has_role = roles
            .iter()
            .any(|role| role["name"] == ARGOCD_ROLE_KUBEAID_AGENT);
        if has_role {
            debug!(role = %ARGOCD_ROLE_KUBEAID_AGENT, "ArgoCD project role already exists");
        } else {
            let mut roles = roles;
            roles.push(json!({
                "name": ARGOCD_ROLE_KUBEAID_AGENT,
                "description": "Allows the KubeAid agent to inspect and sync KubeAid Apps",
                "policies": [format!(
                    "p, proj:{ARGOCD_PROJECT_KUBEAID}:{ARGOCD_ROLE_KUBEAID_AGENT}, applications, get|sync, {ARGOCD_PROJECT_KUBEAID}/*, allow"
                )],
                "groups": [ARGOCD_ROLE_KUBEAID_AGENT]
            }));
            project["spec"]["roles"] = Value::Array(roles);
            self.request::<Value>(Method::PUT, &path, Some(&json!({ "project": project })))
                .await?;
            info!(role = %ARGOCD_ROLE_KUBEAID_AGENT, "Added ArgoCD project role");
        }

        let token: TokenResponse = self
            .request(
                Method::POST,
                &format!("{path}/roles/{ARGOCD_ROLE_KUBEAID_AGENT}/token"),
                Some(&json!({})),
            )
            .await?;
        Ok(token.token)
    }
}

fn is_already_exists(error: &Error) -> bool {
    let message = error.to_string();
    message.contains("already exists") || message.contains("409")
}

async fn handle_response<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v["message"].as_str().map(str::to_string))
        .unwrap_or(body);
    let message = format!("{status}: {message}");

    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Auth(message),
        s if s.is_server_error() => Error::RemoteTransient(message),
        _ => Error::RemoteFatal(message),
    })
}

/// Store the `kubeaid-agent` token where the KubeAid agent reads it.
async fn store_agent_token(client: &Client, token: &str) -> Result<()> {
    ensure_namespace(client, NAMESPACE_OBMONDO).await?;

    let secrets: Api<Secret> = Api::namespaced(client.clone(), NAMESPACE_OBMONDO);
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(ARGOCD_PROJECT_ROLE_SECRET.to_string()),
            namespace: Some(NAMESPACE_OBMONDO.to_string()),
            labels: Some([(ARGOCD_LABEL_MANAGED_BY.to_string(), "kubeaid".to_string())].into()),
            ..ObjectMeta::default()
        },
        string_data: Some([("token".to_string(), token.to_string())].into()),
        ..Secret::default()
    };

    match secrets.create(&PostParams::default(), &secret).await {
        Ok(_) => {
            info!(secret = %ARGOCD_PROJECT_ROLE_SECRET, "Stored kubeaid-agent token");
            Ok(())
        }
        Err(e) if is_conflict(&e) => {
            debug!(secret = %ARGOCD_PROJECT_ROLE_SECRET, "kubeaid-agent token Secret already exists");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Install ArgoCD from the KubeAid clone and point it at the KubeAid config repository.
///
/// Returns a logged in session for syncing.
///
/// # Errors
///
/// Returns an error if any installation step fails.
pub async fn install_and_setup(
    session: &Session,
    kubeconfig: &Path,
    kubeaid_dir: &Path,
    cluster_dir: &Path,
) -> Result<ArgoCd> {
    let kubectl = session.kubectl(kubeconfig);

    // The chart expects to own the AppProject CRD.
    let retry = RetryConfig {
        initial_delay: ARGOCD_IN_PROGRESS_RETRY,
        backoff_multiplier: 1.0,
        ..RetryConfig::default()
    };
    retry_transient(&retry, "apply AppProject CRD", || {
        kubectl.apply(ARGOCD_APPPROJECT_CRD_URL)
    })
    .await?;
    kubectl
        .label(APPPROJECT_CRD, "app.kubernetes.io/managed-by=Helm")
        .await?;
    kubectl
        .annotate(APPPROJECT_CRD, &format!("meta.helm.sh/release-name={RELEASE_NAME_ARGOCD}"))
        .await?;
    kubectl
        .annotate(APPPROJECT_CRD, &format!("meta.helm.sh/release-namespace={NAMESPACE_ARGOCD}"))
        .await?;

    let values = std::fs::read_to_string(cluster_dir.join(TEMPLATE_VALUES_ARGOCD))?;
    session
        .helm(kubeconfig)
        .install(&HelmRelease {
            name: RELEASE_NAME_ARGOCD.to_string(),
            namespace: NAMESPACE_ARGOCD.to_string(),
            chart: ChartSource::Path(kubeaid_dir.join("argocd-helm-charts").join("argo-cd")),
            values: Some(values),
        })
        .await?;

    let client = connect(kubeconfig).await?;
    let argocd = retry_transient(&RetryConfig::default(), "log in to ArgoCD", || {
        ArgoCd::connect(client.clone())
    })
    .await?;

    argocd.create_project().await?;

    kubectl
        .apply(
            &cluster_dir
                .join("sealed-secrets/argocd/kubeaid-config.yaml")
                .display()
                .to_string(),
        )
        .await?;

    let general = &session.config.general;
    if let Some(ca_bundle) = general.git.ca_bundle.as_deref() {
        let location = RepoLocation::parse(&general.forks.kubeaid_config.url)?;
        argocd.upsert_certificate(&location.host, ca_bundle).await?;
    }

    kubectl
        .apply(
            &cluster_dir
                .join("argocd-apps/templates/root.yaml")
                .display()
                .to_string(),
        )
        .await?;

    if session.config.obmondo_monitoring() && !session.flags.skip_monitoring_setup {
        let token = argocd.kubeaid_agent_token().await?;
        store_agent_token(&client, &token).await?;
    }

    info!("Installed and set up ArgoCD");
    Ok(argocd)
}

/// Log in to an already installed ArgoCD.
///
/// # Errors
///
/// Returns an error if the kubeconfig is unusable or login fails.
pub async fn connect_to(kubeconfig: &Path) -> Result<ArgoCd> {
    let client = connect(kubeconfig).await?;
    retry_transient(&RetryConfig::default(), "log in to ArgoCD", || {
        ArgoCd::connect(client.clone())
    })
    .await
}
