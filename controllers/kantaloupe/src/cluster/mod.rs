//! Cluster status controller.
//!
//! Runs on the hub. For every Cluster that references a kubeconfig secret it
//! probes the member API server, publishes a Ready condition smoothed by the
//! success and failure thresholds and, while the member is healthy,
//! aggregates node, pod, flow and resource summaries from informer caches.
//!
//! Two background loops live next to it: hub self-registration
//! ([`self_register`]) and federated scrape configs ([`scrape_config`]).

pub mod condition_cache;
pub mod health;
pub mod kubeconfig;
pub mod scrape_config;
pub mod self_register;
pub mod summary;

use crate::backoff::{jitter, retry_on_conflict};
use crate::config::Options;
use crate::error::{ControllerError, is_not_found};
use crate::informer_manager::{ClusterInformers, InformerManager};
use crate::member_client::MemberClientFactory;
use crate::reconcile_helpers::{ensure_finalizer, is_deleting, remove_finalizer};
use crate::watcher::{RunOptions, run_controller};
use chrono::Utc;
use condition_cache::ConditionCache;
use health::ClusterHealth;
use crds::well_known::{CLUSTER_FINALIZER, MEMBER_SERVICE_MONITORS, MONITORING_NAMESPACE};
use crds::{
    CLUSTER_CONDITION_MODULE_READY, CLUSTER_CONDITION_READY, CONDITION_FALSE, CONDITION_TRUE, Cluster,
    ClusterStatus, Condition, KantaloupeFlow, ServiceMonitor, find_condition, set_condition,
};
use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use kube::api::{ApiResource, DeleteParams, ListParams, Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use kube_runtime::Controller;
use kube_runtime::controller::Action;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(30);
const RESYNC_JITTER: f64 = 0.5;

/// Shared state of the cluster status controller.
pub struct ClusterStatusContext {
    /// Hub client
    pub hub: Client,
    pub options: Arc<Options>,
    pub clients: Arc<MemberClientFactory>,
    pub informers: Arc<InformerManager>,
    pub conditions: ConditionCache,
}

impl ClusterStatusContext {
    /// Builds the context from the manager options.
    pub fn new(
        hub: Client,
        options: Arc<Options>,
        clients: Arc<MemberClientFactory>,
        informers: Arc<InformerManager>,
    ) -> Self {
        let conditions = ConditionCache::new(options.cluster_success_threshold, options.cluster_failure_threshold);
        Self { hub, options, clients, informers, conditions }
    }

    fn requeue(&self) -> Action {
        Action::requeue(jitter(self.options.cluster_status_update_frequency, RESYNC_JITTER))
    }

    fn forget(&self, name: &str) {
        self.informers.stop(name);
        self.conditions.delete(name);
        self.clients.invalidate(name);
    }
}

/// Runs the cluster status controller until shutdown.
pub async fn run(ctx: Arc<ClusterStatusContext>, opts: RunOptions) {
    let clusters: Api<Cluster> = Api::all(ctx.hub.clone());
    let controller = Controller::new(clusters, kube_runtime::watcher::Config::default());
    run_controller(controller, ctx, reconcile, opts).await;
}

/// Reconciles the status of one Cluster.
pub async fn reconcile(cluster: Arc<Cluster>, ctx: Arc<ClusterStatusContext>) -> Result<Action, ControllerError> {
    if cluster.spec.secret_ref.is_none() {
        return Ok(Action::await_change());
    }
    let name = cluster.name_any();
    let api: Api<Cluster> = Api::all(ctx.hub.clone());

    let Some(cluster) = api.get_opt(&name).await? else {
        debug!("Cluster {} is gone, stopping its informers", name);
        ctx.forget(&name);
        return Ok(Action::await_change());
    };

    if is_deleting(&cluster) {
        ctx.forget(&name);
        cleanup(&ctx, &cluster).await?;
        remove_finalizer(&api, &cluster, CLUSTER_FINALIZER).await?;
        info!("Cluster {} cleaned up", name);
        return Ok(Action::await_change());
    }

    ensure_finalizer(&api, &cluster, CLUSTER_FINALIZER).await?;
    sync_cluster(&ctx, &api, &cluster).await?;
    Ok(ctx.requeue())
}

/// Removes what the hub created for the member before its finalizer goes.
async fn cleanup(ctx: &ClusterStatusContext, cluster: &Cluster) -> Result<(), ControllerError> {
    if !cluster.finalizers().iter().any(|f| f == CLUSTER_FINALIZER) {
        return Ok(());
    }
    scrape_config::delete_scrape_config(&ctx.hub, &cluster.name_any()).await?;

    let member = ctx.clients.client_for(cluster).await?;
    let monitors: Api<ServiceMonitor> = Api::namespaced(member.client, MONITORING_NAMESPACE);
    for name in MEMBER_SERVICE_MONITORS {
        match monitors.delete(name, &DeleteParams::default()).await {
            Ok(_) => debug!("Deleted service monitor {} of cluster {}", name, cluster.name_any()),
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

async fn sync_cluster(ctx: &ClusterStatusContext, api: &Api<Cluster>, cluster: &Cluster) -> Result<(), ControllerError> {
    let name = cluster.name_any();
    let member = match ctx.clients.client_for(cluster).await {
        Ok(member) => member,
        Err(e) => {
            error!("Failed to create a client for cluster {}: {}", name, e);
            let failed = Condition::new(
                CLUSTER_CONDITION_READY,
                CONDITION_FALSE,
                "StatusCollectionFailed",
                &format!("failed to create a ClusterClient: {e}"),
            );
            return update_status(api, &name, None, vec![failed]).await;
        }
    };
    if member.fresh {
        // informers still watch with the previous credentials
        ctx.informers.stop(&name);
    }

    let health = health::probe(&member.client).await;
    let current = cluster
        .status
        .as_ref()
        .and_then(|s| find_condition(&s.conditions, CLUSTER_CONDITION_READY));
    let ready = ctx
        .conditions
        .threshold_adjusted(&name, current, health.ready_condition(), Instant::now());

    match status_step(health, ready.is_true()) {
        StatusStep::PublishOffline => {
            debug!("Cluster {} is still offline after the failure threshold", name);
            return update_status(api, &name, None, vec![ready]).await;
        }
        StatusStep::Keep => return Ok(()),
        StatusStep::Collect => {}
    }

    let informers = ctx.informers.for_cluster(&name, member.client.clone());
    let status = collect_status(&member.client, &informers).await?;
    let mut conditions = vec![ready];
    if let Some(module) = module_condition(ctx.options.skip_check_cluster_kube_system_id, cluster, &status) {
        conditions.push(module);
    }
    update_status(api, &name, Some(status), conditions).await
}

/// What a status pass does after the Ready verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusStep {
    /// Offline past the threshold: publish only the Ready condition
    PublishOffline,
    /// Healthy and Ready: collect and publish the full status
    Collect,
    /// Leave the published status alone
    Keep,
}

/// Next step of a status pass for the probe outcome and adjusted Ready.
pub fn status_step(health: ClusterHealth, ready: bool) -> StatusStep {
    if !health.online && !ready {
        StatusStep::PublishOffline
    } else if health.online && health.healthy && ready {
        StatusStep::Collect
    } else {
        StatusStep::Keep
    }
}

async fn collect_status(
    client: &Client,
    informers: &ClusterInformers,
) -> Result<ClusterStatus, ControllerError> {
    let version = client.apiserver_version().await?.git_version;

    informers.start(&[
        ApiResource::erase::<Node>(&()),
        ApiResource::erase::<Pod>(&()),
        ApiResource::erase::<Namespace>(&()),
    ]);
    informers.wait_for_cache_sync(CACHE_SYNC_TIMEOUT).await?;

    let kube_system_id = informers
        .get::<Namespace>("kube-system")
        .and_then(|ns| ns.metadata.uid)
        .ok_or_else(|| ControllerError::MissingObject("namespace kube-system".to_string()))?;
    let nodes = informers.list::<Node>();
    let pods = informers.list::<Pod>();
    let flows = list_flows(client).await;
    debug!("Collected {} nodes, {} pods and {} flows", nodes.len(), pods.len(), flows.len());

    Ok(ClusterStatus {
        kubernetes_version: Some(version),
        kube_system_id: Some(kube_system_id),
        node_summary: Some(summary::node_summary(&nodes)),
        pod_set_summary: Some(summary::pod_summary(&pods)),
        kantaloupeflow_summary: Some(summary::flow_summary(&flows)),
        resource_summary: Some(summary::resource_summary(&nodes, &pods)),
        conditions: vec![],
    })
}

/// Flows of the member. A member without the CRD has none.
async fn list_flows(client: &Client) -> Vec<KantaloupeFlow> {
    let api: Api<KantaloupeFlow> = Api::all(client.clone());
    match api.list(&ListParams::default()).await {
        Ok(list) => list.items,
        Err(e) if is_not_found(&e) => vec![],
        Err(e) => {
            warn!("Failed to list flows: {}", e);
            vec![]
        }
    }
}

/// ModuleReady verdict on the member identity, `None` when the check is off.
pub fn module_condition(skip: bool, cluster: &Cluster, status: &ClusterStatus) -> Option<Condition> {
    if skip {
        return None;
    }
    let observed = status.kube_system_id.as_deref().unwrap_or_default();
    let expected = cluster.spec.cluster_id.as_str();
    if !observed.is_empty() && !expected.is_empty() && observed != expected {
        return Some(Condition::new(
            CLUSTER_CONDITION_MODULE_READY,
            CONDITION_FALSE,
            "ClusterIdMismatch",
            &format!("kube-system uid {observed} does not match cluster id {expected}"),
        ));
    }
    Some(Condition::new(CLUSTER_CONDITION_MODULE_READY, CONDITION_TRUE, "ClusterIdMatched", ""))
}

/// Status after applying `collected` and `conditions` onto `current`.
pub fn merged_status(current: Option<&ClusterStatus>, collected: Option<&ClusterStatus>, conditions: &[Condition]) -> ClusterStatus {
    let mut status = current.cloned().unwrap_or_default();
    if let Some(collected) = collected {
        status.kubernetes_version = collected.kubernetes_version.clone();
        status.kube_system_id = collected.kube_system_id.clone();
        status.node_summary = collected.node_summary;
        status.pod_set_summary = collected.pod_set_summary;
        status.kantaloupeflow_summary = collected.kantaloupeflow_summary;
        status.resource_summary = collected.resource_summary.clone();
    }
    let now = Utc::now();
    for condition in conditions {
        set_condition(&mut status.conditions, condition.clone(), now);
    }
    status
}

/// Writes the merged status when it differs from the stored one.
async fn update_status(
    api: &Api<Cluster>,
    name: &str,
    collected: Option<ClusterStatus>,
    conditions: Vec<Condition>,
) -> Result<(), ControllerError> {
    let collected = collected.as_ref();
    let conditions = conditions.as_slice();
    retry_on_conflict(|| async move {
        let Some(latest) = api.get_opt(name).await? else {
            return Ok(());
        };
        let status = merged_status(latest.status.as_ref(), collected, conditions);
        if latest.status.as_ref() == Some(&status) {
            return Ok(());
        }
        debug!("Updating status of cluster {}", name);
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": latest.resource_version() },
            "status": status,
        });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch)).await?;
        Ok::<(), ControllerError>(())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_cluster;
    use crds::NumSummary;

    #[test]
    fn test_status_step() {
        let offline = ClusterHealth { online: false, healthy: false };
        let unhealthy = ClusterHealth { online: true, healthy: false };
        let healthy = ClusterHealth { online: true, healthy: true };

        assert_eq!(status_step(offline, false), StatusStep::PublishOffline);
        // still Ready inside the failure threshold
        assert_eq!(status_step(offline, true), StatusStep::Keep);
        // online but unhealthy never overwrites the published status
        assert_eq!(status_step(unhealthy, false), StatusStep::Keep);
        assert_eq!(status_step(unhealthy, true), StatusStep::Keep);
        assert_eq!(status_step(healthy, false), StatusStep::Keep);
        assert_eq!(status_step(healthy, true), StatusStep::Collect);
    }

    #[test]
    fn test_module_condition_mismatch() {
        let mut cluster = create_test_cluster("m1", "s");
        cluster.spec.cluster_id = "expected".to_string();
        let status = ClusterStatus { kube_system_id: Some("observed".to_string()), ..Default::default() };

        let condition = module_condition(false, &cluster, &status).unwrap();
        assert_eq!(condition.status, CONDITION_FALSE);
        assert_eq!(condition.reason, "ClusterIdMismatch");
        assert!(module_condition(true, &cluster, &status).is_none());
    }

    #[test]
    fn test_module_condition_tolerates_empty_ids() {
        let cluster = create_test_cluster("m1", "s");
        let status = ClusterStatus { kube_system_id: Some("observed".to_string()), ..Default::default() };
        assert!(module_condition(false, &cluster, &status).unwrap().is_true());
    }

    #[test]
    fn test_merged_status_keeps_other_conditions() {
        let mut current = ClusterStatus::default();
        set_condition(
            &mut current.conditions,
            Condition::new(CLUSTER_CONDITION_MODULE_READY, CONDITION_TRUE, "ClusterIdMatched", ""),
            Utc::now(),
        );
        let ready = Condition::new(CLUSTER_CONDITION_READY, CONDITION_FALSE, "ClusterNotReachable", "cluster is not reachable");

        let merged = merged_status(Some(&current), None, &[ready]);
        assert_eq!(merged.conditions.len(), 2);
        assert!(find_condition(&merged.conditions, CLUSTER_CONDITION_MODULE_READY).unwrap().is_true());
        assert_eq!(find_condition(&merged.conditions, CLUSTER_CONDITION_READY).unwrap().reason, "ClusterNotReachable");
    }

    #[test]
    fn test_merged_status_is_stable() {
        let collected = ClusterStatus {
            kubernetes_version: Some("v1.30.1".to_string()),
            node_summary: Some(NumSummary { total_num: 3, ready_num: 3 }),
            ..Default::default()
        };
        let ready = Condition::new(CLUSTER_CONDITION_READY, CONDITION_TRUE, "ClusterReady", "ok");
        let first = merged_status(None, Some(&collected), &[ready.clone()]);
        let second = merged_status(Some(&first), Some(&collected), &[ready]);
        assert_eq!(first, second);
    }
}
