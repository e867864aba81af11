//! Cluster CRD
//!
//! Registers a member cluster on the hub. The referenced secret carries the
//! member kubeconfig under the `config` key.

use crate::condition::Condition;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Condition type reporting member reachability and health.
pub const CLUSTER_CONDITION_READY: &str = "Ready";
/// Condition type reporting whether the member modules are consistent.
pub const CLUSTER_CONDITION_MODULE_READY: &str = "ModuleReady";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "cluster.kantaloupe.dynamia.ai",
    version = "v1alpha1",
    kind = "Cluster",
    plural = "clusters",
    status = "ClusterStatus",
    printcolumn = r#"{"name":"Provider","type":"string","jsonPath":".spec.provider"}"#,
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".status.kubernetesVersion"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Infrastructure provider hosting the cluster
    #[serde(default)]
    pub provider: ClusterProvider,

    /// Accelerator family installed on the cluster nodes
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<ClusterType>,

    /// API server endpoint of the member
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_endpoint: Option<String>,

    /// Secret holding the member kubeconfig under the `config` key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<LocalSecretReference>,

    /// Prometheus address scraped through federation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prometheus_address: Option<String>,

    /// Gateway address used to publish flow URLs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_address: Option<String>,

    /// Expected UID of the member kube-system namespace
    #[serde(default)]
    pub cluster_id: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum ClusterProvider {
    /// Google Kubernetes Engine
    #[serde(rename = "GCP_GKE")]
    GcpGke,
    /// Amazon Elastic Kubernetes Service
    #[serde(rename = "AWS_EKS")]
    AwsEks,
    /// Any other distribution
    #[default]
    #[serde(rename = "GENERIC")]
    Generic,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ClusterType {
    /// NVIDIA GPUs registered through HAMi
    Nvidia,
    /// MetaX GPUs
    Metax,
    /// AWS Neuron devices
    Neuron,
    /// Huawei Ascend NPUs
    Ascend,
}

/// Reference to a secret, defaulting to the operator namespace.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LocalSecretReference {
    /// Namespace of the secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Name of the secret
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Version reported by the member discovery endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,

    /// UID of the member kube-system namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_system_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_summary: Option<NumSummary>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_set_summary: Option<NumSummary>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kantaloupeflow_summary: Option<NumSummary>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_summary: Option<ResourceSummary>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Total and ready counts of a kind of object.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NumSummary {
    pub total_num: i32,
    pub ready_num: i32,
}

/// Aggregated resources of a member cluster.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSummary {
    /// Sum of node allocatable plus GPU totals
    #[serde(default)]
    #[schemars(schema_with = "crate::schema::resource_list_schema")]
    pub allocatable: BTreeMap<String, Quantity>,

    /// Requests of pods waiting to be scheduled
    #[serde(default)]
    #[schemars(schema_with = "crate::schema::resource_list_schema")]
    pub allocating: BTreeMap<String, Quantity>,

    /// Requests of scheduled, non-terminal pods
    #[serde(default)]
    #[schemars(schema_with = "crate::schema::resource_list_schema")]
    pub allocated: BTreeMap<String, Quantity>,
}

impl Cluster {
    /// Whether the Ready condition is currently True.
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| crate::condition::find_condition(&s.conditions, CLUSTER_CONDITION_READY))
            .is_some_and(Condition::is_true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_spec_wire_names() {
        let spec: ClusterSpec = serde_json::from_value(serde_json::json!({
            "provider": "AWS_EKS",
            "type": "NVIDIA",
            "secretRef": {"namespace": "kantaloupe-system", "name": "member-1"},
            "clusterId": "abc",
        }))
        .unwrap();
        assert_eq!(spec.provider, ClusterProvider::AwsEks);
        assert_eq!(spec.type_, Some(ClusterType::Nvidia));
        assert_eq!(spec.secret_ref.unwrap().name, "member-1");
    }

    #[test]
    fn test_cluster_is_ready() {
        let mut cluster = Cluster::new("member-1", ClusterSpec::default());
        assert!(!cluster.is_ready());
        cluster.status = Some(ClusterStatus {
            conditions: vec![Condition::new(CLUSTER_CONDITION_READY, "True", "ClusterReady", "")],
            ..Default::default()
        });
        assert!(cluster.is_ready());
    }
}
