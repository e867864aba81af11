//! Prometheus API client
//!
//! Implements the instant-query endpoint: `GET /api/v1/query?query=<promql>`.

use crate::error::PrometheusError;
use crate::models::*;
use crate::query_trait::MetricsQuery;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

/// Prometheus API client
#[derive(Debug, Clone)]
pub struct PrometheusClient {
    client: Client,
    base_url: String,
}

impl PrometheusClient {
    /// Create a new Prometheus client
    ///
    /// # Arguments
    /// * `base_url` - Prometheus base URL (e.g., "http://prometheus:9090")
    pub fn new(base_url: String) -> Result<Self, PrometheusError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Evaluate an instant query
    pub async fn query(&self, promql: &str) -> Result<Vec<Sample>, PrometheusError> {
        let url = format!("{}/api/v1/query", self.base_url);
        debug!("Querying Prometheus: {}", promql);

        let response = self.client
            .get(&url)
            .query(&[("query", promql)])
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        // Prometheus reports query errors (400/422/503) with a JSON envelope
        let parsed: QueryResponse = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(e) if status.is_success() => return Err(PrometheusError::Serialization(e)),
            Err(_) => {
                return Err(PrometheusError::Api(format!(
                    "Query failed: {} - {}",
                    status,
                    body.chars().take(500).collect::<String>()
                )));
            }
        };

        decode_vector(parsed)
    }
}

/// Decodes a query envelope into instant-vector samples
pub fn decode_vector(response: QueryResponse) -> Result<Vec<Sample>, PrometheusError> {
    if response.status != "success" {
        return Err(PrometheusError::Api(format!(
            "{}: {}",
            response.error_type.unwrap_or_default(),
            response.error.unwrap_or_default()
        )));
    }

    let Some(data) = response.data else {
        return Ok(Vec::new());
    };
    if data.result_type != "vector" {
        return Err(PrometheusError::UnexpectedResultType(data.result_type));
    }

    let raw: Vec<VectorSample> = serde_json::from_value(data.result)?;
    raw.into_iter()
        .map(|s| {
            let value = s.value.1.parse::<f64>()
                .map_err(|_| PrometheusError::InvalidValue(s.value.1.clone()))?;
            Ok(Sample { labels: s.metric, value })
        })
        .collect()
}

#[async_trait::async_trait]
impl MetricsQuery for PrometheusClient {
    fn base_url(&self) -> &str {
        self.base_url()
    }

    async fn query(&self, promql: &str) -> Result<Vec<Sample>, PrometheusError> {
        self.query(promql).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_vector() {
        let response: QueryResponse = serde_json::from_value(serde_json::json!({
            "status": "success",
            "data": {
                "resultType": "vector",
                "result": [
                    {"metric": {"podname": "train-0", "podnamespace": "ml"}, "value": [1700000000.5, "7200"]},
                    {"metric": {"podname": "train-1", "podnamespace": "ml"}, "value": [1700000000.5, "12"]},
                ],
            },
        }))
        .unwrap();

        let samples = decode_vector(response).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].label("podname"), Some("train-0"));
        assert!((samples[0].value - 7200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_decode_vector_error_status() {
        let response: QueryResponse = serde_json::from_value(serde_json::json!({
            "status": "error",
            "errorType": "bad_data",
            "error": "parse error",
        }))
        .unwrap();
        assert!(matches!(decode_vector(response), Err(PrometheusError::Api(_))));
    }

    #[test]
    fn test_decode_vector_rejects_matrix() {
        let response: QueryResponse = serde_json::from_value(serde_json::json!({
            "status": "success",
            "data": {"resultType": "matrix", "result": []},
        }))
        .unwrap();
        assert!(matches!(
            decode_vector(response),
            Err(PrometheusError::UnexpectedResultType(_))
        ));
    }

    #[test]
    fn test_client_trims_base_url() {
        let client = PrometheusClient::new("http://prometheus:9090/".to_string()).unwrap();
        assert_eq!(client.base_url(), "http://prometheus:9090");
    }
}
