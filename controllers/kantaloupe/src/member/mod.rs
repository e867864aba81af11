//! Controllers run against a member cluster.
//!
//! The supervisor starts one set per Ready member. Each controller watches
//! the member with the member client; the flow controller additionally reads
//! its Cluster from the hub to resolve gateway URLs.

pub mod deployment_status;
pub mod flow;
pub mod gateway_section;
pub mod gpumem_pod;
pub mod inactive_cleanup;
pub mod restart_device_plugin;

use crate::config::{FlowSettings, GatewaySettings};
use crate::port_allocator::PortAllocator;
use chrono::{DateTime, Utc};
use crds::Condition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::Client;
use std::sync::Arc;

/// Everything a member controller needs.
pub struct MemberContext {
    /// Name of the member Cluster on the hub
    pub cluster: String,
    pub hub: Client,
    /// Client bound to the member API server
    pub client: Client,
    /// Operator namespace, home of the gateway and the shared configmaps
    pub namespace: String,
    pub gateway: GatewaySettings,
    pub flow: FlowSettings,
    pub ports: Arc<PortAllocator>,
    /// Member Prometheus, queried by the inactive-workload collector
    pub prometheus_address: Option<String>,
}

impl std::fmt::Debug for MemberContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemberContext")
            .field("cluster", &self.cluster)
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

fn to_utc(time: &Time) -> Option<DateTime<Utc>> {
    serde_json::to_value(time).ok().and_then(|v| serde_json::from_value(v).ok())
}

/// Converts a pod or deployment condition into a flow condition.
pub fn convert_condition(
    type_: &str,
    status: &str,
    reason: Option<&str>,
    message: Option<&str>,
    last_transition_time: Option<&Time>,
) -> Condition {
    let mut condition = Condition::new(type_, status, reason.unwrap_or_default(), message.unwrap_or_default());
    condition.last_transition_time = last_transition_time.and_then(to_utc);
    condition
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_condition_keeps_transition_time() {
        let time: Time = serde_json::from_value(serde_json::json!("2024-05-01T10:00:00Z")).unwrap();
        let condition = convert_condition("Available", "True", Some("MinimumReplicasAvailable"), None, Some(&time));
        assert_eq!(condition.type_, "Available");
        assert!(condition.is_true());
        assert_eq!(condition.message, "");
        assert_eq!(condition.last_transition_time.unwrap().to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }
}
