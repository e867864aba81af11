//! Self-registration of the hub as `local-cluster`.
//!
//! Every 10 s the hub rebuilds its own kubeconfig, stores it in
//! `local-cluster-secret` (subject to the rotation policy in
//! [`super::kubeconfig`]) and upserts the `local-cluster` Cluster.

use super::kubeconfig::{KubeconfigDecision, KubeconfigProbe, TokenCache, decide, hub_kubeconfig};
use crate::error::ControllerError;
use crate::member_client::kubeconfig_from_secret;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use crds::well_known::{
    DEFAULT_PROMETHEUS_ADDRESS, EKS_NODEGROUP_LABEL, GATEWAY_NAME, GKE_NODEPOOL_LABEL, GLOBAL_CLUSTER_NAME,
    GLOBAL_CLUSTER_SECRET, KUBECONFIG_SECRET_KEY, NEURON_RESOURCE, NODE_ASCEND_REGISTER_PREFIX,
    NODE_METAX_DEVICES_ANNOTATION, NODE_NVIDIA_REGISTER_ANNOTATION,
};
use crds::{Cluster, ClusterProvider, ClusterSpec, ClusterType, Gateway, LocalSecretReference};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{Namespace, Node, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{ListParams, PostParams};
use kube::{Api, Client};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

const SA_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const SA_CA_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// Provider from the labels of the first node.
pub fn detect_provider(nodes: &[Node]) -> ClusterProvider {
    let Some(labels) = nodes.first().and_then(|n| n.metadata.labels.as_ref()) else {
        return ClusterProvider::Generic;
    };
    if labels.contains_key(GKE_NODEPOOL_LABEL) {
        ClusterProvider::GcpGke
    } else if labels.contains_key(EKS_NODEGROUP_LABEL) {
        ClusterProvider::AwsEks
    } else {
        ClusterProvider::Generic
    }
}

fn node_type(node: &Node) -> Option<ClusterType> {
    let empty = BTreeMap::new();
    let annotations = node.metadata.annotations.as_ref().unwrap_or(&empty);
    if annotations.keys().any(|k| k.starts_with(NODE_ASCEND_REGISTER_PREFIX)) {
        return Some(ClusterType::Ascend);
    }
    let has_neuron = node
        .status
        .as_ref()
        .and_then(|s| s.allocatable.as_ref())
        .is_some_and(|a| a.contains_key(NEURON_RESOURCE));
    if has_neuron {
        return Some(ClusterType::Neuron);
    }
    if annotations.contains_key(NODE_NVIDIA_REGISTER_ANNOTATION) {
        return Some(ClusterType::Nvidia);
    }
    if annotations.contains_key(NODE_METAX_DEVICES_ANNOTATION) {
        return Some(ClusterType::Metax);
    }
    None
}

/// Accelerator type of the first node that advertises one.
pub fn detect_type(nodes: &[Node]) -> Option<ClusterType> {
    nodes.iter().find_map(node_type)
}

/// Endpoint published for the hub gateway.
///
/// An explicit endpoint wins, otherwise the first gateway address is used.
pub fn gateway_endpoint(configured: &str, gateway: Option<&Gateway>) -> Option<String> {
    if !configured.is_empty() {
        return Some(configured.to_string());
    }
    let address = gateway?.status.as_ref()?.addresses.first()?;
    Some(format!("http://{}", address.value))
}

/// API server URL from the in-cluster service environment.
pub fn in_cluster_server(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("https://[{host}]:{port}")
    } else {
        format!("https://{host}:{port}")
    }
}

/// Spec of the `local-cluster` Cluster.
pub fn local_cluster_spec(
    namespace: &str,
    cluster_id: String,
    provider: ClusterProvider,
    cluster_type: Option<ClusterType>,
    gateway_address: Option<String>,
) -> ClusterSpec {
    ClusterSpec {
        provider,
        type_: cluster_type,
        api_endpoint: None,
        secret_ref: Some(LocalSecretReference {
            namespace: Some(namespace.to_string()),
            name: GLOBAL_CLUSTER_SECRET.to_string(),
        }),
        prometheus_address: Some(DEFAULT_PROMETHEUS_ADDRESS.to_string()),
        gateway_address,
        cluster_id,
    }
}

/// Keeps the hub registered as a member of itself.
pub struct SelfRegistration {
    hub: Client,
    namespace: String,
    gateway_endpoint: String,
    debug_mode: bool,
    tokens: Arc<TokenCache>,
    probe: Arc<dyn KubeconfigProbe>,
}

impl std::fmt::Debug for SelfRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfRegistration")
            .field("namespace", &self.namespace)
            .field("debug_mode", &self.debug_mode)
            .finish_non_exhaustive()
    }
}

impl SelfRegistration {
    /// Creates the registration loop state.
    pub fn new(
        hub: Client,
        namespace: String,
        gateway_endpoint: String,
        debug_mode: bool,
        tokens: Arc<TokenCache>,
        probe: Arc<dyn KubeconfigProbe>,
    ) -> Self {
        Self { hub, namespace, gateway_endpoint, debug_mode, tokens, probe }
    }

    async fn build_kubeconfig(&self) -> Result<String, ControllerError> {
        if self.debug_mode {
            let path = std::env::var_os("KUBECONFIG").map(PathBuf::from).unwrap_or_else(|| {
                let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_default();
                home.join(".kube").join("config")
            });
            debug!("Reading hub kubeconfig from {}", path.display());
            return Ok(tokio::fs::read_to_string(&path).await?);
        }

        let token = tokio::fs::read_to_string(SA_TOKEN_PATH).await?;
        let ca = tokio::fs::read(SA_CA_PATH).await?;
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| ControllerError::InvalidConfig("KUBERNETES_SERVICE_HOST is not set".to_string()))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
        hub_kubeconfig(&STANDARD.encode(ca), &in_cluster_server(&host, &port), &token)
    }

    async fn ensure_secret(&self, kubeconfig: String) -> Result<(), ControllerError> {
        let secrets: Api<Secret> = Api::namespaced(self.hub.clone(), &self.namespace);
        let data = |config: String| BTreeMap::from([(KUBECONFIG_SECRET_KEY.to_string(), ByteString(config.into_bytes()))]);

        let Some(mut existing) = secrets.get_opt(GLOBAL_CLUSTER_SECRET).await? else {
            info!("Creating secret {}/{}", self.namespace, GLOBAL_CLUSTER_SECRET);
            let secret = Secret {
                metadata: ObjectMeta {
                    name: Some(GLOBAL_CLUSTER_SECRET.to_string()),
                    namespace: Some(self.namespace.clone()),
                    ..Default::default()
                },
                data: Some(data(kubeconfig)),
                ..Default::default()
            };
            secrets.create(&PostParams::default(), &secret).await?;
            return Ok(());
        };

        let old = kubeconfig_from_secret(&existing).unwrap_or_default();
        match decide(&kubeconfig, &old, &self.tokens, self.probe.as_ref(), Utc::now()).await? {
            KubeconfigDecision::Replace(updated) => {
                info!("Rotating hub kubeconfig in secret {}/{}", self.namespace, GLOBAL_CLUSTER_SECRET);
                existing.data = Some(data(updated));
                secrets.replace(GLOBAL_CLUSTER_SECRET, &PostParams::default(), &existing).await?;
            }
            decision => debug!("Keeping stored hub kubeconfig: {:?}", decision),
        }
        Ok(())
    }

    async fn upsert_cluster(&self, spec: ClusterSpec) -> Result<(), ControllerError> {
        let clusters: Api<Cluster> = Api::all(self.hub.clone());
        match clusters.get_opt(GLOBAL_CLUSTER_NAME).await? {
            None => {
                info!("Registering hub as cluster {}", GLOBAL_CLUSTER_NAME);
                clusters.create(&PostParams::default(), &Cluster::new(GLOBAL_CLUSTER_NAME, spec)).await?;
            }
            Some(mut existing) if existing.spec != spec => {
                debug!("Updating cluster {}", GLOBAL_CLUSTER_NAME);
                existing.spec = spec;
                clusters.replace(GLOBAL_CLUSTER_NAME, &PostParams::default(), &existing).await?;
            }
            Some(_) => {}
        }
        Ok(())
    }

    /// One registration pass.
    pub async fn sync(&self) -> Result<(), ControllerError> {
        let kubeconfig = self.build_kubeconfig().await?;
        self.ensure_secret(kubeconfig).await?;

        let namespaces: Api<Namespace> = Api::all(self.hub.clone());
        let cluster_id = namespaces.get("kube-system").await?.metadata.uid.unwrap_or_default();

        let gateway = if self.gateway_endpoint.is_empty() {
            let gateways: Api<Gateway> = Api::namespaced(self.hub.clone(), &self.namespace);
            gateways
                .get_opt(GATEWAY_NAME)
                .await
                .map_err(|e| warn!("Failed to get gateway {}: {}", GATEWAY_NAME, e))
                .ok()
                .flatten()
        } else {
            None
        };
        let endpoint = gateway_endpoint(&self.gateway_endpoint, gateway.as_ref());

        let nodes: Api<Node> = Api::all(self.hub.clone());
        let nodes = nodes.list(&ListParams::default()).await?.items;

        let spec = local_cluster_spec(&self.namespace, cluster_id, detect_provider(&nodes), detect_type(&nodes), endpoint);
        self.upsert_cluster(spec).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_gateway, create_test_node};
    use crds::{GatewayStatus, GatewayStatusAddress};

    #[test]
    fn test_detect_provider_from_first_node() {
        let gke = create_test_node("n1", &[(GKE_NODEPOOL_LABEL, "pool")], &[], &[]);
        let eks = create_test_node("n2", &[(EKS_NODEGROUP_LABEL, "ng")], &[], &[]);
        assert_eq!(detect_provider(&[gke.clone(), eks.clone()]), ClusterProvider::GcpGke);
        assert_eq!(detect_provider(&[eks, gke]), ClusterProvider::AwsEks);
        assert_eq!(detect_provider(&[]), ClusterProvider::Generic);
    }

    #[test]
    fn test_detect_type_precedence() {
        let both = create_test_node(
            "n1",
            &[],
            &[(NODE_METAX_DEVICES_ANNOTATION, "x"), (NODE_NVIDIA_REGISTER_ANNOTATION, "y")],
            &[],
        );
        assert_eq!(detect_type(&[both]), Some(ClusterType::Nvidia));

        let neuron = create_test_node("n1", &[], &[(NODE_NVIDIA_REGISTER_ANNOTATION, "y")], &[(NEURON_RESOURCE, "2")]);
        assert_eq!(detect_type(&[neuron]), Some(ClusterType::Neuron));

        let ascend = create_test_node("n1", &[], &[("hami.io/node-register-Ascend910B", "z")], &[(NEURON_RESOURCE, "2")]);
        assert_eq!(detect_type(&[ascend]), Some(ClusterType::Ascend));

        let plain = create_test_node("n1", &[], &[], &[]);
        let metax = create_test_node("n2", &[], &[(NODE_METAX_DEVICES_ANNOTATION, "x")], &[]);
        assert_eq!(detect_type(&[plain.clone(), metax]), Some(ClusterType::Metax));
        assert_eq!(detect_type(&[plain]), None);
    }

    #[test]
    fn test_gateway_endpoint() {
        assert_eq!(gateway_endpoint("http://gw.example", None).as_deref(), Some("http://gw.example"));
        assert_eq!(gateway_endpoint("", None), None);

        let mut gateway = create_test_gateway(&[]);
        assert_eq!(gateway_endpoint("", Some(&gateway)), None);
        gateway.status = Some(GatewayStatus {
            addresses: vec![GatewayStatusAddress { type_: None, value: "10.1.2.3".to_string() }],
            ..Default::default()
        });
        assert_eq!(gateway_endpoint("", Some(&gateway)).as_deref(), Some("http://10.1.2.3"));
    }

    #[test]
    fn test_local_cluster_spec_points_at_secret() {
        let spec = local_cluster_spec("kantaloupe-system", "uid-1".to_string(), ClusterProvider::Generic, None, None);
        assert_eq!(spec.secret_ref.unwrap().name, GLOBAL_CLUSTER_SECRET);
        assert_eq!(spec.prometheus_address.as_deref(), Some(DEFAULT_PROMETHEUS_ADDRESS));
        assert_eq!(spec.cluster_id, "uid-1");
    }

    #[test]
    fn test_in_cluster_server() {
        assert_eq!(in_cluster_server("10.96.0.1", "443"), "https://10.96.0.1:443");
        assert_eq!(in_cluster_server("fd00::1", "443"), "https://[fd00::1]:443");
    }
}
