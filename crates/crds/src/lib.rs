//! Kantaloupe CRD Definitions
//!
//! Kubernetes Custom Resource Definitions owned by the Kantaloupe controllers,
//! the third-party types they manipulate (Gateway API, prometheus-operator)
//! and the annotation wire formats exchanged with the GPU device plugin.

pub mod cluster;
pub mod condition;
pub mod error;
pub mod gateway;
pub mod gpu_allocation;
pub mod kantaloupe_flow;
pub mod monitoring;
pub mod schema;
pub mod well_known;

pub use cluster::*;
pub use condition::*;
pub use error::ParseError;
pub use gateway::*;
pub use gpu_allocation::*;
pub use kantaloupe_flow::*;
pub use monitoring::*;
