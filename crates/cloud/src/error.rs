//! Errors shared by every cloud client in this crate.

use thiserror::Error;

/// Errors that can occur during cloud provider operations.
#[derive(Error, Debug)]
pub enum CloudProviderError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Authentication error.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// An external CLI exited unsuccessfully.
    #[error("{program} failed: {stderr}")]
    Command { program: String, stderr: String },

    /// Spawning or talking to a child process failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation has no implementation for this cloud.
    #[error("{0} is not supported on this cloud")]
    Unsupported(String),
}

impl CloudProviderError {
    /// Whether retrying the same call may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::Api { status, .. } => matches!(status, 409 | 429 | 502 | 503 | 504),
            Self::Command { stderr, .. } => {
                let stderr = stderr.to_lowercase();
                [
                    "timeout",
                    "timed out",
                    "throttl",
                    "connection reset",
                    "temporarily unavailable",
                    "try again",
                ]
                .iter()
                .any(|pattern| stderr.contains(pattern))
            }
            _ => false,
        }
    }
}
