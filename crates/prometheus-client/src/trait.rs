//! MetricsQuery trait for mocking
//!
//! Abstracts the Prometheus client so controllers can be tested against an
//! in-memory implementation.

use crate::error::PrometheusError;
use crate::models::Sample;

/// Instant-query operations against a Prometheus-compatible API
#[async_trait::async_trait]
pub trait MetricsQuery: Send + Sync {
    /// Get the base URL
    fn base_url(&self) -> &str;

    /// Evaluate an instant query and return the resulting vector
    async fn query(&self, promql: &str) -> Result<Vec<Sample>, PrometheusError>;
}
