//! Error taxonomy for the conversion and reconciliation engine.
//!
//! The variants deliberately map to how the caller must react: a
//! [`SyncError::Mapping`] is permanent and never retried, a
//! [`SyncError::Transient`] is always retried on the next cycle, a
//! [`SyncError::NotFound`] means "nothing to do yet", and a
//! [`SyncError::Configuration`] skips one application for the cycle.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The container's configuration cannot be expressed as a swarm
    /// service spec. Left unconverted; an operator has to intervene.
    #[error("container '{container}' cannot be mapped to a service: {reason}")]
    Mapping { container: String, reason: String },

    /// A Docker or Dokploy call failed for reasons expected to clear up
    /// on their own (connectivity, timeout, version conflict).
    #[error("transient API failure: {0}")]
    Transient(String),

    /// An entity we expected to read is not there (yet).
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    /// Desired state from the metadata store is malformed for this
    /// application.
    #[error("invalid desired state for '{app}': {reason}")]
    Configuration { app: String, reason: String },
}

impl SyncError {
    pub fn mapping(container: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Mapping {
            container: container.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn configuration(app: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            app: app.into(),
            reason: reason.into(),
        }
    }

    /// Whether the failure should be retried on the next scheduled cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<bollard::errors::Error> for SyncError {
    fn from(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => Self::NotFound {
                kind: "docker object",
                name: message,
            },
            other => Self::Transient(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transient(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
