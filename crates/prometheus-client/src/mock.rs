//! Mock Prometheus client for unit testing
//!
//! Stores canned query results in memory and records the queries it served.

use crate::error::PrometheusError;
use crate::models::Sample;
use crate::query_trait::MetricsQuery;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Mock Prometheus client for testing
#[derive(Debug, Clone, Default)]
pub struct MockPrometheusClient {
    base_url: String,
    responses: Arc<Mutex<HashMap<String, Vec<Sample>>>>,
    queries: Arc<Mutex<Vec<String>>>,
}

impl MockPrometheusClient {
    /// Create a new mock client
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Register the samples returned for a query
    pub fn set_response(&self, promql: impl Into<String>, samples: Vec<Sample>) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.insert(promql.into(), samples);
        }
    }

    /// Queries served so far
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().map(|q| q.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl MetricsQuery for MockPrometheusClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn query(&self, promql: &str) -> Result<Vec<Sample>, PrometheusError> {
        if let Ok(mut queries) = self.queries.lock() {
            queries.push(promql.to_string());
        }
        let responses = self.responses
            .lock()
            .map_err(|e| PrometheusError::Api(format!("mock poisoned: {e}")))?;
        Ok(responses.get(promql).cloned().unwrap_or_default())
    }
}
