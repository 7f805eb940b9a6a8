//! Error types for the service catalog controller

use thiserror::Error;

use crate::broker::BrokerError;

/// How the dispatcher treats a failed reconcile
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Requeue with backoff
    Transient,
    /// The broker may have acted; the owning reconciler routes to orphan mitigation
    Ambiguous,
    /// User error; a Failed condition is recorded and nothing is retried until the spec changes
    Terminal,
    /// Cannot converge; logged and the key dropped
    Invariant,
}

/// Main error type for service catalog operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Optimistic concurrency failure: the object changed since it was read
    #[error("conflict updating {0}: object was modified")]
    Conflict(String),

    /// Broker call failed
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Invalid spec or catalog content
    #[error("validation error: {0}")]
    Validation(String),

    /// The same parameter key came from more than one source
    #[error("parameter conflict: {0}")]
    ParameterConflict(String),

    /// A referenced object is not (yet) in the cache
    #[error("reference not found: {0}")]
    ReferenceNotFound(String),

    /// Secret read or write failed
    #[error("secret error: {0}")]
    Secret(String),

    /// A Secret with the requested name belongs to another object
    #[error("secret conflict: {0}")]
    SecretConflict(String),

    /// Orphan mitigation changed state; the interrupted operation is retried with backoff
    #[error("orphan mitigation: {0}")]
    OrphanMitigation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// State the controller cannot act on
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl Error {
    /// Create a conflict error for the named object
    pub fn conflict(key: impl Into<String>) -> Self {
        Self::Conflict(key.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a parameter conflict error with the given message
    pub fn parameter_conflict(msg: impl Into<String>) -> Self {
        Self::ParameterConflict(msg.into())
    }

    /// Create a missing-reference error with the given message
    pub fn reference_not_found(msg: impl Into<String>) -> Self {
        Self::ReferenceNotFound(msg.into())
    }

    /// Create a secret error with the given message
    pub fn secret(msg: impl Into<String>) -> Self {
        Self::Secret(msg.into())
    }

    /// Create a secret ownership conflict with the given message
    pub fn secret_conflict(msg: impl Into<String>) -> Self {
        Self::SecretConflict(msg.into())
    }

    /// Create an orphan mitigation error with the given message
    pub fn orphan_mitigation(msg: impl Into<String>) -> Self {
        Self::OrphanMitigation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an invariant violation with the given message
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    /// Classify the error for the dispatcher
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Kube(_)
            | Self::Conflict(_)
            | Self::ReferenceNotFound(_)
            | Self::Secret(_)
            | Self::OrphanMitigation(_) => ErrorClass::Transient,
            Self::Broker(e) => e.class(),
            Self::Validation(_)
            | Self::ParameterConflict(_)
            | Self::SecretConflict(_)
            | Self::Serialization(_) => ErrorClass::Terminal,
            Self::Invariant(_) => ErrorClass::Invariant,
        }
    }

    /// Whether the key should be requeued with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient | ErrorClass::Ambiguous)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
