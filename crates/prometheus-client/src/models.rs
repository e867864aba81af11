//! Prometheus API data models
//!
//! Response envelope of `GET /api/v1/query`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Response envelope returned by every Prometheus API endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    /// "success" or "error"
    pub status: String,
    #[serde(default)]
    pub data: Option<QueryData>,
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Query result payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryData {
    /// "vector", "matrix", "scalar" or "string"
    pub result_type: String,
    #[serde(default)]
    pub result: serde_json::Value,
}

/// Raw instant-vector element: labels plus `[timestamp, "value"]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorSample {
    #[serde(default)]
    pub metric: BTreeMap<String, String>,
    pub value: (f64, String),
}

/// A decoded instant-vector sample
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Series labels
    pub labels: BTreeMap<String, String>,
    /// Sample value
    pub value: f64,
}

impl Sample {
    /// Convenience constructor used by tests and mocks
    pub fn new<I, K, V>(labels: I, value: f64) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            labels: labels.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            value,
        }
    }

    /// Returns a label value
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }
}
