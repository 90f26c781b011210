//! Error types for the deployment manager
//!
//! Errors are structured with fields to aid debugging in production.
//! Kubernetes failures always carry the operation that failed and the
//! identity of the resource it failed on.
//!
//! The reconcile pause signal is not part of this enum: a controller
//! waiting on a monitor has not failed.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for deployment manager operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("{operation} failed for {resource}: {source}")]
    Kube {
        /// Operation being performed (e.g., "update annotations")
        operation: String,
        /// Resource identity (e.g., "Host/ns1/controller-0")
        resource: String,
        /// The underlying kube-rs error
        source: kube::Error,
    },

    /// The platform client for a namespace could not be built
    #[error("platform client error for namespace {namespace}: {message}")]
    PlatformClient {
        /// Namespace whose client failed to build
        namespace: String,
        /// Description of what failed
        message: String,
    },

    /// An object is missing data the coordinator requires
    #[error("invalid object {resource}: {message}")]
    InvalidObject {
        /// Resource identity, as far as it is known
        resource: String,
        /// Description of what's missing
        message: String,
    },

    /// Invalid configuration value
    #[error("invalid configuration {key}: {message}")]
    Configuration {
        /// Configuration key (e.g., an environment variable name)
        key: String,
        /// Description of what's invalid
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "monitor", "dispatcher")
        context: String,
    },
}

impl Error {
    /// Wrap a kube error with the operation and resource it failed on
    pub fn kube(
        operation: impl Into<String>,
        resource: impl Into<String>,
        source: kube::Error,
    ) -> Self {
        Self::Kube {
            operation: operation.into(),
            resource: resource.into(),
            source,
        }
    }

    /// Create a platform client construction error
    pub fn platform_client(namespace: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::PlatformClient {
            namespace: namespace.into(),
            message: msg.into(),
        }
    }

    /// Create an invalid object error
    pub fn invalid_object(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidObject {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error for the given key
    pub fn configuration(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Configuration {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
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
    /// Every API server and platform client failure, including 4xx
    /// responses, is retried with backoff. Only objects missing required
    /// data and bad configuration wait for a change.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { .. } => true,
            Error::PlatformClient { .. } => true,
            Error::InvalidObject { .. } => false,
            Error::Configuration { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// True if the API server rejected an update based on stale data
    pub fn is_conflict(&self) -> bool {
        self.api_code() == Some(409)
    }

    /// True if the API server reported the resource as missing
    pub fn is_not_found(&self) -> bool {
        self.api_code() == Some(404)
    }

    /// Get the resource identity if this error is associated with one
    pub fn resource(&self) -> Option<&str> {
        match self {
            Error::Kube { resource, .. } => Some(resource),
            Error::InvalidObject { resource, .. } => Some(resource),
            _ => None,
        }
    }

    fn api_code(&self) -> Option<u16> {
        match self {
            Error::Kube {
                source: kube::Error::Api(ae),
                ..
            } => Some(ae.code),
            _ => None,
        }
    }
}

/// Attach operation and resource context to raw kube results
pub trait KubeResultExt<T> {
    /// Convert a `kube::Error` into [`Error::Kube`] with context
    fn context(self, operation: &str, resource: &str) -> Result<T, Error>;
}

impl<T> KubeResultExt<T> for Result<T, kube::Error> {
    fn context(self, operation: &str, resource: &str) -> Result<T, Error> {
        self.map_err(|e| Error::kube(operation, resource, e))
    }
}
