//! Prometheus client errors

use thiserror::Error;

/// Errors that can occur when querying the Prometheus API
#[derive(Debug, Error)]
pub enum PrometheusError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Prometheus returned a non-success status
    #[error("Prometheus API error: {0}")]
    Api(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The query returned something other than an instant vector
    #[error("Unexpected result type: {0}")]
    UnexpectedResultType(String),

    /// A sample value was not a float
    #[error("Invalid sample value: {0}")]
    InvalidValue(String),
}
