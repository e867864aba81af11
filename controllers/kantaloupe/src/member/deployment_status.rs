//! Mirrors flow deployment status onto the owning flow.

use crate::backoff::retry_on_conflict;
use crate::error::ControllerError;
use crate::member::{MemberContext, convert_condition};
use crate::watcher::{RunOptions, run_controller};
use crds::well_known::FLOW_NAME_LABEL;
use crds::{KantaloupeFlow, KantaloupeFlowStatus};
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Patch, PatchParams};
use kube::{Api, ResourceExt};
use kube_runtime::Controller;
use kube_runtime::controller::Action;
use kube_runtime::watcher::Config;
use std::sync::Arc;
use tracing::debug;

const FLOW_KIND: &str = "KantaloupeFlow";

/// Runs the controller against the member until shutdown.
pub async fn run(ctx: Arc<MemberContext>, opts: RunOptions) {
    let deployments: Api<Deployment> = Api::all(ctx.client.clone());
    let controller = Controller::new(deployments, Config::default().labels(FLOW_NAME_LABEL));
    run_controller(controller, ctx, reconcile, opts).await;
}

/// Name of the flow owning the deployment.
pub fn owning_flow(deployment: &Deployment) -> Option<String> {
    deployment
        .owner_references()
        .iter()
        .find(|o| o.kind == FLOW_KIND)
        .map(|o| o.name.clone())
}

/// Flow status after folding in the deployment status.
///
/// Networking falls back to the spec entries until the flow controller has
/// resolved their URLs.
pub fn merged_status(flow: &KantaloupeFlow, deployment: &Deployment) -> KantaloupeFlowStatus {
    let mut status = flow.status.clone().unwrap_or_default();
    let observed = deployment.status.clone().unwrap_or_default();
    status.replicas = observed.replicas.unwrap_or_default();
    status.ready_replicas = observed.ready_replicas.unwrap_or_default();
    status.conditions = observed
        .conditions
        .unwrap_or_default()
        .iter()
        .map(|c| {
            convert_condition(
                &c.type_,
                &c.status,
                c.reason.as_deref(),
                c.message.as_deref(),
                c.last_transition_time.as_ref(),
            )
        })
        .collect();
    if status.networking.is_empty() {
        status.networking.clone_from(&flow.spec.networking);
    }
    status
}

async fn reconcile(deployment: Arc<Deployment>, ctx: Arc<MemberContext>) -> Result<Action, ControllerError> {
    let Some(flow_name) = owning_flow(&deployment) else {
        return Ok(Action::await_change());
    };
    let namespace = deployment.namespace().unwrap_or_default();
    let flows: Api<KantaloupeFlow> = Api::namespaced(ctx.client.clone(), &namespace);

    let flows = &flows;
    let flow_name = flow_name.as_str();
    let deployment = deployment.as_ref();
    retry_on_conflict(|| async move {
        let Some(flow) = flows.get_opt(flow_name).await? else {
            debug!("Owner flow {} of deployment {} is gone", flow_name, deployment.name_any());
            return Ok(());
        };
        let status = merged_status(&flow, deployment);
        if flow.status.as_ref() == Some(&status) {
            return Ok(());
        }
        debug!("Updating status of flow {}/{}", flow.namespace().unwrap_or_default(), flow_name);
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": flow.resource_version() },
            "status": status,
        });
        flows.patch_status(flow_name, &PatchParams::default(), &Patch::Merge(&patch)).await?;
        Ok::<(), ControllerError>(())
    })
    .await?;
    Ok(Action::await_change())
}
