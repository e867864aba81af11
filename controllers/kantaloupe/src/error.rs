//! Controller-specific error types.
//!
//! Every failure a reconciler can return is a `ControllerError`. The
//! `kind()` classification decides how the shared error policy treats it:
//! NotFound is success in cascades, Conflict is retried in place, Invalid is
//! logged without requeue and everything else is requeued with backoff.

use crate::port_allocator::PortAllocatorError;
use kube::Error as KubeError;
use kube::config::KubeconfigError;
use prometheus_client::PrometheusError;
use thiserror::Error;

/// Errors that can occur in the Kantaloupe controller manager.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Kubeconfig could not be loaded or resolved
    #[error("Kubeconfig error: {0}")]
    Kubeconfig(#[from] KubeconfigError),

    /// JSON (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML (de)serialization failure
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Prometheus query failure
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] PrometheusError),

    /// Annotation or section name grammar violation
    #[error("Parse error: {0}")]
    Parse(#[from] crds::ParseError),

    /// Listener port allocation failure
    #[error("Port allocation error: {0}")]
    PortAllocation(#[from] PortAllocatorError),

    /// Metrics registry failure
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Local file or socket failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Raw HTTP request could not be built
    #[error("HTTP error: {0}")]
    Http(#[from] http::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Informer caches did not sync in time
    #[error("Cache sync failed: {0}")]
    CacheSync(String),

    /// Member controller manager failed to start
    #[error("Member manager start failed: {0}")]
    ManagerStart(String),

    /// A referenced object is missing
    #[error("Object not found: {0}")]
    MissingObject(String),
}

/// Error categories driving requeue policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The target is gone
    NotFound,
    /// Optimistic concurrency conflict
    Conflict,
    /// The object or configuration can never succeed as is
    Invalid,
    /// Worth retrying with backoff
    Transient,
    /// Member manager could not start
    Fatal,
}

impl ControllerError {
    /// Classifies the error for the requeue policy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ControllerError::Kube(KubeError::Api(ae)) => match ae.code {
                404 => ErrorKind::NotFound,
                409 => ErrorKind::Conflict,
                400 | 422 => ErrorKind::Invalid,
                _ => ErrorKind::Transient,
            },
            ControllerError::InvalidConfig(_) | ControllerError::Parse(_) => ErrorKind::Invalid,
            ControllerError::MissingObject(_) => ErrorKind::NotFound,
            ControllerError::ManagerStart(_) => ErrorKind::Fatal,
            _ => ErrorKind::Transient,
        }
    }
}

/// Whether a kube call failed with 404.
pub fn is_not_found(err: &KubeError) -> bool {
    matches!(err, KubeError::Api(ae) if ae.code == 404)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(ControllerError::InvalidConfig("x".into()).kind(), ErrorKind::Invalid);
        assert_eq!(
            ControllerError::Parse(crds::ParseError::InvalidSectionName("x".into())).kind(),
            ErrorKind::Invalid
        );
        assert_eq!(ControllerError::ManagerStart("x".into()).kind(), ErrorKind::Fatal);
        assert_eq!(ControllerError::CacheSync("x".into()).kind(), ErrorKind::Transient);
        assert_eq!(ControllerError::MissingObject("x".into()).kind(), ErrorKind::NotFound);
    }
}
