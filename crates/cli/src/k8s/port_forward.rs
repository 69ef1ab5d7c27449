//! Scoped port-forward to a pod selected by label.
//!
//! A local listener accepts connections for as long as the [`PortForward`] lives. Each accepted
//! connection is bridged to a freshly resolved running pod, so a restarted target pod is picked
//! up by the next connection without tearing the forward down.

use std::net::{Ipv4Addr, SocketAddr};

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::Client;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Pods behind a forward.
#[derive(Clone)]
struct Target {
    pods: Api<Pod>,
    namespace: String,
    selector: String,
    remote_port: u16,
}

impl Target {
    async fn running_pod(&self) -> Result<String> {
        let pods = self
            .pods
            .list(&ListParams::default().labels(&self.selector))
            .await?;

        pods.items
            .into_iter()
            .find(|pod| {
                pod.metadata.deletion_timestamp.is_none()
                    && pod
                        .status
                        .as_ref()
                        .and_then(|status| status.phase.as_deref())
                        == Some("Running")
            })
            .and_then(|pod| pod.metadata.name)
            .ok_or_else(|| {
                Error::RemoteTransient(format!(
                    "no running pod matches {} in namespace {}",
                    self.selector, self.namespace
                ))
            })
    }

    async fn bridge(&self, mut local: TcpStream) -> Result<()> {
        let pod = self.running_pod().await?;
        let mut forwarder = self.pods.portforward(&pod, &[self.remote_port]).await?;
        let mut upstream = forwarder.take_stream(self.remote_port).ok_or_else(|| {
            Error::RemoteTransient(format!("port {} of pod {pod} is not forwarded", self.remote_port))
        })?;

        let (sent, received) = tokio::io::copy_bidirectional(&mut local, &mut upstream).await?;
        debug!(pod = %pod, sent, received, "Port-forward connection closed");

        drop(upstream);
        if let Err(e) = forwarder.join().await {
            debug!(pod = %pod, error = %e, "Port-forward stream ended with error");
        }
        Ok(())
    }
}

/// A live port-forward. Dropping it stops the listener and every open connection.
pub struct PortForward {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    supervisor: JoinHandle<()>,
}

impl PortForward {
    /// Forward a random local port to `remote_port` of the pods matching `selector`.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails or no running pod matches the selector.
    pub async fn start(
        client: Client,
        namespace: &str,
        selector: &str,
        remote_port: u16,
    ) -> Result<Self> {
        let target = Target {
            pods: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            selector: selector.to_string(),
            remote_port,
        };
        let pod = target.running_pod().await?;

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let local_addr = listener.local_addr()?;
        info!(pod = %pod, namespace = %namespace, local = %local_addr, remote_port, "Started port-forward");

        let cancel = CancellationToken::new();
        let supervisor = tokio::spawn(supervise(listener, target, cancel.clone()));

        Ok(Self {
            local_addr,
            cancel,
            supervisor,
        })
    }

    /// `https://127.0.0.1:<port>`.
    #[must_use]
    pub fn https_url(&self) -> String {
        format!("https://{}", self.local_addr)
    }
}

impl Drop for PortForward {
    fn drop(&mut self) {
        debug!(local = %self.local_addr, "Stopping port-forward");
        self.cancel.cancel();
        self.supervisor.abort();
    }
}

async fn supervise(listener: TcpListener, target: Target, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            () = cancel.cancelled() => return,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Port-forward listener failed to accept");
                continue;
            }
        };

        let target = target.clone();
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                result = target.bridge(stream) => {
                    if let Err(e) = result {
                        warn!(peer = %peer, selector = %target.selector, error = %e, "Port-forward connection failed");
                    }
                }
            }
        });
    }
}
