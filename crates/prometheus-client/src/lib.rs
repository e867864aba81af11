//! Prometheus HTTP API Client
//!
//! A small client for the instant-query endpoint of the Prometheus HTTP API,
//! used by the member controllers to read device activity metrics.
//!
//! # Example
//!
//! ```no_run
//! use prometheus_client::{MetricsQuery, PrometheusClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = PrometheusClient::new("http://prometheus:9090".to_string())?;
//!
//! let samples = client
//!     .query(r#"Device_last_kernel_of_container{cluster="member-1"}"#)
//!     .await?;
//! for sample in samples {
//!     println!("{:?} = {}", sample.labels.get("podname"), sample.value);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod query_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::PrometheusClient;
pub use error::PrometheusError;
pub use models::*;
pub use query_trait::MetricsQuery;
#[cfg(feature = "test-util")]
pub use mock::MockPrometheusClient;
