//! Deletes GPU workloads whose devices have been idle too long.
//!
//! The device exporter reports, per container, the seconds since the last
//! kernel ran. Pods past the threshold are removed together with the
//! deployment that would recreate them.

use crate::error::{ControllerError, is_not_found};
use crate::member::MemberContext;
use crate::periodic::run_every;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::Pod;
use kube::api::DeleteParams;
use kube::{Api, ResourceExt};
use prometheus_client::{MetricsQuery, PrometheusClient, Sample};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const COLLECT_PERIOD: Duration = Duration::from_secs(5);
const POD_NAMESPACE_LABEL: &str = "podnamespace";
const POD_NAME_LABEL: &str = "podname";

/// Idle-time query for a member cluster.
pub fn idle_query(cluster: &str) -> String {
    format!(r#"Device_last_kernel_of_container{{cluster="{cluster}"}}"#)
}

/// `(namespace, name)` of pods idle for longer than `threshold` seconds.
pub fn idle_pods(samples: &[Sample], threshold: f64) -> Vec<(String, String)> {
    samples
        .iter()
        .filter(|s| s.value > threshold)
        .filter_map(|s| Some((s.label(POD_NAMESPACE_LABEL)?.to_string(), s.label(POD_NAME_LABEL)?.to_string())))
        .collect()
}

/// What to delete so an idle pod stays gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupTarget {
    /// A bare pod
    Pod,
    /// The deployment behind this ReplicaSet
    ReplicaSet(String),
    /// Owned by something else, left alone
    Skip,
}

/// Cleanup target of a pod, from its owner references.
pub fn cleanup_target(pod: &Pod) -> CleanupTarget {
    let owners = pod.owner_references();
    if owners.is_empty() {
        return CleanupTarget::Pod;
    }
    owners
        .iter()
        .find(|o| o.kind == "ReplicaSet")
        .map_or(CleanupTarget::Skip, |o| CleanupTarget::ReplicaSet(o.name.clone()))
}

/// Periodic idle-workload collector of one member.
pub struct InactiveCollector {
    ctx: Arc<MemberContext>,
    metrics: Arc<dyn MetricsQuery>,
}

impl std::fmt::Debug for InactiveCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InactiveCollector")
            .field("cluster", &self.ctx.cluster)
            .field("prometheus", &self.metrics.base_url())
            .finish()
    }
}

impl InactiveCollector {
    /// Builds the collector against the member Prometheus.
    pub fn init(ctx: Arc<MemberContext>) -> Result<Self, ControllerError> {
        let address = ctx.prometheus_address.clone().ok_or_else(|| {
            ControllerError::InvalidConfig(format!("cluster {} has no prometheus address", ctx.cluster))
        })?;
        let metrics = Arc::new(PrometheusClient::new(address)?);
        Ok(Self::with_metrics(ctx, metrics))
    }

    /// Builds the collector against any query backend.
    pub fn with_metrics(ctx: Arc<MemberContext>, metrics: Arc<dyn MetricsQuery>) -> Self {
        Self { ctx, metrics }
    }

    /// Collects every five seconds until shutdown.
    pub async fn run(self, shutdown: CancellationToken) {
        let name = format!("inactive-cleanup/{}", self.ctx.cluster);
        run_every(&name, COLLECT_PERIOD, shutdown, || self.collect_once()).await;
    }

    /// One pass: query idle containers and clean up their workloads.
    pub async fn collect_once(&self) -> Result<(), ControllerError> {
        let samples = self.metrics.query(&idle_query(&self.ctx.cluster)).await?;
        for (namespace, name) in idle_pods(&samples, self.ctx.flow.cleanup_inactive_threshold) {
            let pods: Api<Pod> = Api::namespaced(self.ctx.client.clone(), &namespace);
            let Some(pod) = pods.get_opt(&name).await? else {
                debug!("Idle pod {}/{} is already gone", namespace, name);
                continue;
            };
            if let Err(e) = self.cleanup(&pod).await {
                warn!("Failed to clean up idle pod {}/{}: {}", namespace, name, e);
            }
        }
        Ok(())
    }

    async fn cleanup(&self, pod: &Pod) -> Result<(), ControllerError> {
        let namespace = pod.namespace().unwrap_or_default();
        match cleanup_target(pod) {
            CleanupTarget::Pod => {
                info!("Deleting idle pod {}/{}", namespace, pod.name_any());
                let pods: Api<Pod> = Api::namespaced(self.ctx.client.clone(), &namespace);
                ignore_not_found(pods.delete(&pod.name_any(), &DeleteParams::default()).await.map(|_| ()))
            }
            CleanupTarget::ReplicaSet(rs) => {
                let replica_sets: Api<ReplicaSet> = Api::namespaced(self.ctx.client.clone(), &namespace);
                let rs = replica_sets.get(&rs).await?;
                let Some(owner) = rs.owner_references().iter().find(|o| o.kind == "Deployment") else {
                    return Ok(());
                };
                info!("Deleting deployment {}/{} of idle pod {}", namespace, owner.name, pod.name_any());
                let deployments: Api<Deployment> = Api::namespaced(self.ctx.client.clone(), &namespace);
                ignore_not_found(deployments.delete(&owner.name, &DeleteParams::default()).await.map(|_| ()))
            }
            CleanupTarget::Skip => Ok(()),
        }
    }
}

fn ignore_not_found(result: Result<(), kube::Error>) -> Result<(), ControllerError> {
    match result {
        Err(e) if !is_not_found(&e) => Err(e.into()),
        _ => Ok(()),
    }
}
