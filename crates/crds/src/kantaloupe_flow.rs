//! KantaloupeFlow CRD
//!
//! A flow is a single GPU workload (deployment or bare pod) plus the plugins,
//! service and gateway routes that expose it.

use crate::condition::Condition;
use k8s_openapi::api::core::v1::{PodTemplateSpec, VolumeMount};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type set when the flow workload is available.
pub const FLOW_CONDITION_AVAILABLE: &str = "Available";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "kantaloupe.dynamia.ai",
    version = "v1alpha1",
    kind = "KantaloupeFlow",
    plural = "kantaloupeflows",
    shortname = "kf",
    namespaced,
    status = "KantaloupeFlowStatus",
    printcolumn = r#"{"name":"Workload","type":"string","jsonPath":".spec.workload"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyReplicas"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KantaloupeFlowSpec {
    /// Builtin plugins injected into the primary container
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plugins: Vec<Plugin>,

    /// Desired replicas (deployment workloads only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Pod template of the workload
    #[schemars(schema_with = "crate::schema::raw_object_schema")]
    pub template: PodTemplateSpec,

    /// Pauses the deployment rollout
    #[serde(default)]
    pub paused: bool,

    /// Endpoints exposed through the gateway
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networking: Vec<Networking>,

    /// Objects the workload depends on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depend_on: Vec<Dependency>,

    /// Workload kind materialised for the flow
    #[serde(default)]
    pub workload: WorkloadKind,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Plugin {
    /// sshd on port 22
    Ssh,
    /// VS Code server
    Vscode,
    /// Jupyter notebook
    Jupyter,
}

impl Plugin {
    /// Environment variable toggling the plugin inside the container.
    pub fn env_name(self) -> &'static str {
        match self {
            Plugin::Ssh => "ENABLE_SSH",
            Plugin::Vscode => "ENABLE_VSCODE",
            Plugin::Jupyter => "ENABLE_JUPYTER",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadKind {
    /// A single bare pod named after the flow
    Pod,
    /// A deployment named after the flow
    #[default]
    Deployment,
}

/// A network endpoint of the flow.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Networking {
    /// Endpoint name, unique within the flow
    pub name: String,

    /// Route kind used to expose the endpoint
    #[serde(rename = "type")]
    pub type_: NetworkType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    /// Container port
    pub port: i32,

    /// Path prefix in spec; resolved URL in status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    /// L7 route under the gateway base path
    #[default]
    Httproute,
    /// L4 route on an allocated listener port
    Tcproute,
}

/// An object the workload consumes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    pub kind: DependencyKind,
    pub resource_ref: ResourceRef,
    #[serde(default)]
    pub effect: DependencyEffect,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum DependencyKind {
    ConfigMap,
    Secret,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DependencyEffect {
    #[serde(rename = "type", default)]
    pub type_: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "crate::schema::raw_object_list_schema")]
    pub volume_mounts: Vec<VolumeMount>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KantaloupeFlowStatus {
    #[serde(default)]
    pub replicas: i32,

    #[serde(default)]
    pub ready_replicas: i32,

    /// Networking entries with their resolved URLs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networking: Vec<Networking>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl KantaloupeFlow {
    /// Whether the flow requests any builtin plugin.
    pub fn has_plugins(&self) -> bool {
        !self.spec.plugins.is_empty()
    }

    /// Whether the given plugin is enabled.
    pub fn has_plugin(&self, plugin: Plugin) -> bool {
        self.spec.plugins.contains(&plugin)
    }
}
