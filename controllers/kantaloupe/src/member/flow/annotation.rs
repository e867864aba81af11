//! GPU memory allocation handshake.
//!
//! The flow carries `<requested>,<applied>` in the allocation annotation.
//! Users bump the requested value; the controller rewrites the device
//! record on the running pod and then marks the request as applied.

use super::template::gpu_memory_limit;
use crate::error::ControllerError;
use crate::member::MemberContext;
use crds::well_known::{
    FLOW_NAME_LABEL, OOM_EXPANSION_ANNOTATION, POD_ALLOCATION_MEET_ANNOTATION, VGPU_DEVICES_ALLOCATED_ANNOTATION,
};
use crds::{KantaloupeFlow, rewrite_memory};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ListParams, Patch, PatchParams, PostParams};
use kube::{Api, ResourceExt};
use tracing::{debug, info, warn};

/// What the allocation annotation asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationRequest {
    /// The annotation is missing and must be initialised
    Missing,
    /// Requested and applied values agree
    Applied,
    /// The requested value differs from the applied one
    Pending(String),
}

/// Parses the allocation annotation of a flow.
pub fn allocation_request(value: Option<&str>) -> Result<AllocationRequest, ControllerError> {
    let Some(value) = value else {
        return Ok(AllocationRequest::Missing);
    };
    match value.split(',').collect::<Vec<_>>().as_slice() {
        [requested, applied] if requested == applied => Ok(AllocationRequest::Applied),
        [requested, _] => Ok(AllocationRequest::Pending((*requested).to_string())),
        _ => Err(ControllerError::InvalidConfig(format!(
            "annotation {POD_ALLOCATION_MEET_ANNOTATION} has unexpected format: {value}"
        ))),
    }
}

/// Initial annotation value, the template GPU memory limit twice.
pub fn initial_annotation(flow: &KantaloupeFlow) -> Result<String, ControllerError> {
    let limit = gpu_memory_limit(flow).ok_or_else(|| {
        ControllerError::InvalidConfig(format!("flow {} has no GPU memory limit", flow.name_any()))
    })?;
    Ok(format!("{limit},{limit}"))
}

async fn set_annotation(api: &Api<KantaloupeFlow>, flow: &KantaloupeFlow, value: &str) -> Result<(), ControllerError> {
    let patch = serde_json::json!({
        "metadata": {
            "resourceVersion": flow.resource_version(),
            "annotations": { POD_ALLOCATION_MEET_ANNOTATION: value },
        }
    });
    api.patch(&flow.name_any(), &PatchParams::default(), &Patch::Merge(&patch)).await?;
    Ok(())
}

/// Applies a pending GPU memory request to the flow pod.
///
/// Re-reads the flow since earlier steps of the reconcile may have written it.
pub async fn reconcile_annotation(flow: &KantaloupeFlow, ctx: &MemberContext) -> Result<(), ControllerError> {
    let namespace = flow.namespace().unwrap_or_default();
    let name = flow.name_any();
    let flows: Api<KantaloupeFlow> = Api::namespaced(ctx.client.clone(), &namespace);
    let Some(latest) = flows.get_opt(&name).await? else {
        return Ok(());
    };
    let flow = &latest;

    let requested = match allocation_request(flow.annotations().get(POD_ALLOCATION_MEET_ANNOTATION).map(String::as_str))? {
        AllocationRequest::Applied => return Ok(()),
        AllocationRequest::Missing => {
            let value = initial_annotation(flow)?;
            debug!("Initialising allocation annotation of flow {}/{} to {}", namespace, name, value);
            return set_annotation(&flows, flow, &value).await;
        }
        AllocationRequest::Pending(requested) => requested,
    };
    let memory: i64 = requested
        .parse()
        .map_err(|_| ControllerError::InvalidConfig(format!("requested GPU memory {requested} is not an integer")))?;

    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
    let mut list = pods.list(&ListParams::default().labels(&format!("{FLOW_NAME_LABEL}={name}"))).await?;
    if list.items.len() != 1 {
        warn!("Flow {}/{} has {} pods, expected exactly one", namespace, name, list.items.len());
        return Ok(());
    }
    let mut pod = list.items.remove(0);
    let Some(devices) = pod.annotations().get(VGPU_DEVICES_ALLOCATED_ANNOTATION).cloned() else {
        warn!("Pod {}/{} has no device allocation", namespace, pod.name_any());
        return Ok(());
    };

    info!("Resizing GPU memory of pod {}/{} to {}", namespace, pod.name_any(), memory);
    let annotations = pod.annotations_mut();
    annotations.insert(VGPU_DEVICES_ALLOCATED_ANNOTATION.to_string(), rewrite_memory(&devices, memory)?);
    annotations.remove(OOM_EXPANSION_ANNOTATION);
    pods.replace(&pod.name_any(), &PostParams::default(), &pod).await?;

    set_annotation(&flows, flow, &format!("{requested},{requested}")).await
}
