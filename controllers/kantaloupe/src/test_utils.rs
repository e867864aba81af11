//! Test utilities for unit testing reconcilers
//!
//! Builders for the objects the controllers read, plus a client that never
//! reaches a server.

use crds::well_known::FLOW_NAME_LABEL;
use crds::*;
use k8s_openapi::api::core::v1::{
    Container, Node, NodeStatus, Pod, PodSpec, PodStatus, PodTemplateSpec, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Client, Config};
use std::collections::BTreeMap;

/// Token-based kubeconfig pointing at a local API server.
pub const TEST_KUBECONFIG: &str = r#"apiVersion: v1
kind: Config
clusters:
- name: member
  cluster:
    server: https://127.0.0.1:6443
contexts:
- name: member
  context:
    cluster: member
    user: member
current-context: member
users:
- name: member
  user:
    token: eyJhbGciOiJSUzI1NiJ9.eyJleHAiOjQxMDI0NDQ4MDB9.c2ln
"#;

/// Client bound to a port nothing listens on. Needs a tokio runtime.
pub fn unreachable_client() -> Client {
    let url = "http://127.0.0.1:9".parse().unwrap();
    Client::try_from(Config::new(url)).unwrap()
}

/// Quantity map from pairs.
pub fn resources(pairs: &[(&str, &str)]) -> BTreeMap<String, Quantity> {
    pairs.iter().map(|(k, v)| (k.to_string(), Quantity(v.to_string()))).collect()
}

/// Helper to create a test Cluster with a secret reference
pub fn create_test_cluster(name: &str, secret: &str) -> Cluster {
    Cluster {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: ClusterSpec {
            secret_ref: Some(LocalSecretReference {
                namespace: Some("kantaloupe-system".to_string()),
                name: secret.to_string(),
            }),
            prometheus_address: Some(format!("http://prometheus.{name}:9090")),
            gateway_address: Some("http://10.0.0.1/".to_string()),
            ..Default::default()
        },
        status: None,
    }
}

/// Helper to create a test KantaloupeFlow
pub fn create_test_flow(name: &str, namespace: &str, plugins: Vec<Plugin>, workload: WorkloadKind) -> KantaloupeFlow {
    let mut flow = KantaloupeFlow::new(
        name,
        KantaloupeFlowSpec {
            plugins,
            replicas: Some(1),
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "main".to_string(),
                        image: Some("pytorch:2".to_string()),
                        resources: Some(ResourceRequirements {
                            limits: Some(resources(&[("nvidia.com/gpumem", "4096")])),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            workload,
            ..Default::default()
        },
    );
    flow.metadata.namespace = Some(namespace.to_string());
    flow.metadata.uid = Some(format!("uid-{name}"));
    flow
}

/// Helper to create a test Pod with requests and an optional node
pub fn create_test_pod(name: &str, node: Option<&str>, phase: &str, requests: &[(&str, &str)]) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: node.map(str::to_string),
            containers: vec![Container {
                name: "main".to_string(),
                resources: Some(ResourceRequirements {
                    requests: Some(resources(requests)),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        }),
    }
}

/// Helper to create a pod owned by a flow
pub fn create_test_flow_pod(flow: &str, annotations: &[(&str, &str)]) -> Pod {
    let mut pod = create_test_pod(flow, Some("node-1"), "Running", &[]);
    pod.metadata.labels = Some(BTreeMap::from([(FLOW_NAME_LABEL.to_string(), flow.to_string())]));
    pod.metadata.annotations = Some(annotations.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect());
    pod
}

/// Helper to create a test Node
pub fn create_test_node(
    name: &str,
    labels: &[(&str, &str)],
    annotations: &[(&str, &str)],
    allocatable: &[(&str, &str)],
) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
            annotations: Some(annotations.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
            ..Default::default()
        },
        spec: None,
        status: Some(NodeStatus {
            allocatable: Some(resources(allocatable)),
            ..Default::default()
        }),
    }
}

/// Helper to create a TCPRoute attached to the hub gateway
pub fn create_test_tcp_route(name: &str, namespace: &str, section: &str) -> TCPRoute {
    let mut route = TCPRoute::new(
        name,
        TCPRouteSpec {
            parent_refs: vec![ParentReference {
                name: well_known::GATEWAY_NAME.to_string(),
                namespace: Some("kantaloupe-system".to_string()),
                section_name: Some(section.to_string()),
                ..Default::default()
            }],
            rules: vec![],
        },
    );
    route.metadata.namespace = Some(namespace.to_string());
    route
}

/// Helper to create the hub gateway with listeners on the given ports
pub fn create_test_gateway(ports: &[(&str, i32)]) -> Gateway {
    let mut gateway = Gateway::new(
        well_known::GATEWAY_NAME,
        GatewaySpec {
            gateway_class_name: "envoy".to_string(),
            listeners: ports
                .iter()
                .map(|(name, port)| Listener {
                    name: name.to_string(),
                    port: *port,
                    protocol: "TCP".to_string(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        },
    );
    gateway.metadata.namespace = Some("kantaloupe-system".to_string());
    gateway
}
