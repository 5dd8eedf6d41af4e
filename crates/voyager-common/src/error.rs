//! Error types for the Voyager operator
//!
//! Errors are structured with fields to aid debugging in production. The
//! variants follow the controller's failure taxonomy: configuration mistakes
//! and missing references are terminal for a reconciliation pass, while API
//! and internal failures are retried with backoff.

use thiserror::Error;

/// Main error type for Voyager operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Bad or conflicting user configuration (annotation, port, backend name)
    #[error("config error for {ingress}: {message}")]
    Config {
        /// Ingress whose configuration is invalid
        ingress: String,
        /// Description of what's invalid
        message: String,
        /// The offending field or annotation key
        field: Option<String>,
    },

    /// A referenced Service, Secret or ConfigMap does not exist
    #[error("reference error for {ingress}: {kind} '{name}' not found")]
    Reference {
        /// Ingress holding the reference
        ingress: String,
        /// Kind of the missing object
        kind: String,
        /// Namespaced name of the missing object
        name: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "renderer")
        context: String,
    },
}

impl Error {
    /// Create a config error for a specific ingress
    pub fn config_for(ingress: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Config {
            ingress: ingress.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a config error naming the offending field
    pub fn config_for_field(
        ingress: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Config {
            ingress: ingress.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a reference error for a missing object
    pub fn reference(
        ingress: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::Reference {
            ingress: ingress.into(),
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Config and reference errors need a user change (references are
    /// re-triggered through the watch index). Kubernetes client errors are
    /// retried unless the API server rejected the request outright.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => {
                    !(400..500).contains(&ae.code) || ae.code == 409 || ae.code == 429
                }
                _ => true,
            },
            Error::Config { .. } => false,
            Error::Reference { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Short, stable label for metrics (`config`, `reference`, `kube`, ...)
    pub fn class(&self) -> &'static str {
        match self {
            Error::Kube { .. } => "kube",
            Error::Config { .. } => "config",
            Error::Reference { .. } => "reference",
            Error::Serialization { .. } => "serialization",
            Error::Internal { .. } => "internal",
        }
    }
}
