//! Kubernetes clients built from explicit kubeconfig paths.

use std::path::Path;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Secret};
use kube::api::{Api, ListParams, ObjectMeta, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Build a client from the kubeconfig at `path`.
///
/// # Errors
///
/// Returns [`Error::Config`] when the file is missing or unusable.
pub async fn connect(path: &Path) -> Result<Client> {
    let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
        Error::config(format!("failed reading kubeconfig {}: {e}", path.display()))
    })?;

    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::config(format!("invalid kubeconfig {}: {e}", path.display()))
        })?;

    Ok(Client::try_from(config)?)
}

/// Whether the cluster answers a Deployment listing in `default`.
pub async fn is_reachable(client: &Client) -> bool {
    let deployments: Api<Deployment> = Api::namespaced(client.clone(), "default");
    match deployments.list(&ListParams::default().limit(1)).await {
        Ok(_) => true,
        Err(e) => {
            debug!(error = %e, "Cluster is not reachable");
            false
        }
    }
}

#[must_use]
pub fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 404)
}

#[must_use]
pub fn is_conflict(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 409)
}

/// Create `name` unless it exists.
///
/// # Errors
///
/// Returns an error if the API rejects the creation for any reason other than a conflict.
pub async fn ensure_namespace(client: &Client, name: &str) -> Result<()> {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    let namespace = Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..ObjectMeta::default()
        },
        ..Namespace::default()
    };

    match namespaces.create(&PostParams::default(), &namespace).await {
        Ok(_) => {
            info!(namespace = %name, "Created namespace");
            Ok(())
        }
        Err(e) if is_conflict(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Decoded value of `key` in Secret `namespace/name`, `None` if the Secret or key is absent.
///
/// # Errors
///
/// Returns an error if the API call fails or the value is not UTF-8.
pub async fn secret_value(
    client: &Client,
    namespace: &str,
    name: &str,
    key: &str,
) -> Result<Option<String>> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let Some(secret) = secrets.get_opt(name).await? else {
        return Ok(None);
    };

    secret
        .data
        .and_then(|mut data| data.remove(key))
        .map(|bytes| {
            String::from_utf8(bytes.0).map_err(|_| {
                Error::precondition(format!("key {key} of Secret {namespace}/{name} is not UTF-8"))
            })
        })
        .transpose()
}

/// Write a kubeconfig readable by the owner only.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be written.
pub fn write_kubeconfig(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    info!(path = %path.display(), "Saved kubeconfig");
    Ok(())
}
