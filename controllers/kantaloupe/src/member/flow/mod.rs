//! KantaloupeFlow controller.
//!
//! Materialises a flow on its member cluster: the NodePort service and
//! gateway routes for its endpoints, the package-manager configmaps, the
//! pod or deployment itself and the GPU memory allocation handshake.

pub mod annotation;
pub mod networking;
pub mod template;
pub mod workload;

use crate::error::ControllerError;
use crate::member::MemberContext;
use crate::reconcile_helpers::{ensure_finalizer, is_deleting, remove_finalizer};
use crate::watcher::{RunOptions, run_controller};
use crds::well_known::FLOW_FINALIZER;
use crds::{KantaloupeFlow, WorkloadKind};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use kube::{Api, ResourceExt};
use kube_runtime::Controller;
use kube_runtime::controller::Action;
use kube_runtime::watcher::Config;
use std::sync::Arc;
use tracing::debug;

/// Runs the flow controller against the member until shutdown.
pub async fn run(ctx: Arc<MemberContext>, opts: RunOptions) {
    let flows: Api<KantaloupeFlow> = Api::all(ctx.client.clone());
    let controller = Controller::new(flows, Config::default())
        .owns(Api::<Deployment>::all(ctx.client.clone()), Config::default())
        .owns(Api::<Pod>::all(ctx.client.clone()), Config::default())
        .owns(Api::<Service>::all(ctx.client.clone()), Config::default())
        .owns(Api::<ConfigMap>::all(ctx.client.clone()), Config::default());
    run_controller(controller, ctx, reconcile, opts).await;
}

async fn reconcile(flow: Arc<KantaloupeFlow>, ctx: Arc<MemberContext>) -> Result<Action, ControllerError> {
    let namespace = flow.namespace().unwrap_or_default();
    let api: Api<KantaloupeFlow> = Api::namespaced(ctx.client.clone(), &namespace);
    let Some(flow) = api.get_opt(&flow.name_any()).await? else {
        return Ok(Action::await_change());
    };

    if is_deleting(&flow) {
        debug!("Flow {}/{} is being deleted", namespace, flow.name_any());
        remove_finalizer(&api, &flow, FLOW_FINALIZER).await?;
        return Ok(Action::await_change());
    }
    if ensure_finalizer(&api, &flow, FLOW_FINALIZER).await? {
        // the finalizer write triggers another reconcile
        return Ok(Action::await_change());
    }

    if flow.has_plugins() {
        networking::reconcile_networking(&flow, &ctx).await?;
        workload::reconcile_configmaps(&flow, &ctx).await?;
    }

    match flow.spec.workload {
        WorkloadKind::Pod => workload::reconcile_pod(&flow, &ctx).await?,
        WorkloadKind::Deployment => workload::reconcile_deployment(&flow, &ctx).await?,
    }

    annotation::reconcile_annotation(&flow, &ctx).await?;
    Ok(Action::await_change())
}
