//! Failure kinds of every KubeAid workflow.

use kubeaid_cloud::CloudProviderError;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the orchestrator and its collaborators.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or missing configuration, bad SSH keys, missing executables.
    #[error("configuration error: {0}")]
    Config(String),

    /// Git or cloud credentials were rejected.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A remote call failed in a way that may succeed on retry.
    #[error("transient remote failure: {0}")]
    RemoteTransient(String),

    /// A remote call failed permanently.
    #[error("remote failure: {0}")]
    RemoteFatal(String),

    /// The world is not in the state the workflow expects.
    #[error("precondition failed: {0}")]
    StatePrecondition(String),

    /// SIGINT / SIGTERM.
    #[error("aborted by user")]
    UserAbort,

    /// The operation has no implementation for the active cloud.
    #[error("{0} is not supported on this cloud")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Cloud(#[from] CloudProviderError),

    #[error("template error: {0}")]
    Template(#[from] handlebars::RenderError),
}

/// Substrings of error messages that indicate a retryable failure.
const TRANSIENT_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "connection refused",
    "connection reset",
    "rate limit",
    "502",
    "503",
    "504",
    "temporarily unavailable",
    "try again",
    "another operation is already in progress",
    "failed calling webhook",
    "tls handshake",
    "network",
];

impl Error {
    /// Shorthand for [`Error::Config`].
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Shorthand for [`Error::StatePrecondition`].
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::StatePrecondition(message.into())
    }

    /// Whether retrying the failed operation may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RemoteTransient(_) => true,
            Self::Cloud(e) if e.is_transient() => true,
            Self::Http(e) if e.is_timeout() || e.is_connect() => true,
            Self::Config(_)
            | Self::Auth(_)
            | Self::StatePrecondition(_)
            | Self::UserAbort
            | Self::Unsupported(_) => false,
            other => {
                let message = other.to_string().to_lowercase();
                TRANSIENT_PATTERNS.iter().any(|p| message.contains(p))
            }
        }
    }
}
