//! Error types for the Buildkit operator

use thiserror::Error;

use crate::merge::MergeError;

/// Main error type for Buildkit operator operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The template an instance refers to does not exist
    #[error("buildkit template {namespace}/{name} not found")]
    TemplateNotFound {
        /// Namespace searched
        namespace: String,
        /// Template name
        name: String,
    },

    /// Layers of the desired pod could not be merged
    #[error("merge error: {0}")]
    Merge(#[from] MergeError),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Validation error for CRD specs
    #[error("validation error: {0}")]
    Validation(String),

    /// A namespaced object arrived without a namespace
    #[error("object has no namespace")]
    MissingNamespace,

    /// Shutdown was requested before a modifying call
    #[error("reconciliation cancelled")]
    Cancelled,

    /// Broken internal assumption
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a template-not-found error
    pub fn template_not_found(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::TemplateNotFound {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether retrying the same reconcile can succeed without a spec change
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Kube(_) | Self::TemplateNotFound { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
