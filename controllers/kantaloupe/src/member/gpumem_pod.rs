//! Keeps the device allocation of flow pods at the requested GPU memory.
//!
//! A pod restarted by its deployment comes back with the template limit in
//! its device record. This controller rewrites the record to the memory last
//! requested on the flow, and reports OOM expansions back to the flow.

use crate::error::ControllerError;
use crate::member::MemberContext;
use crate::watcher::{RunOptions, run_controller};
use crds::well_known::{
    FLOW_NAME_LABEL, OOM_ANNOTATION, OOM_EXPANSION_ANNOTATION, POD_ALLOCATION_MEET_ANNOTATION,
    VGPU_DEVICES_ALLOCATED_ANNOTATION,
};
use crds::{ContainerDevice, KantaloupeFlow, decode_devices, encode_devices};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Patch, PatchParams};
use kube::{Api, ResourceExt};
use kube_runtime::Controller;
use kube_runtime::controller::Action;
use kube_runtime::watcher::Config;
use std::sync::Arc;
use tracing::{debug, info};

/// Runs the controller against the member until shutdown.
pub async fn run(ctx: Arc<MemberContext>, opts: RunOptions) {
    let pods: Api<Pod> = Api::all(ctx.client.clone());
    let controller = Controller::new(pods, Config::default().labels(FLOW_NAME_LABEL));
    run_controller(controller, ctx, reconcile, opts).await;
}

/// OOM expansion to report on the flow: the allocated memory when the device
/// plugin expanded the pod, empty otherwise.
pub fn oom_expansion(pod: &Pod, devices: &[ContainerDevice]) -> String {
    match devices.first() {
        Some(device) if pod.annotations().contains_key(OOM_ANNOTATION) => device.memory.to_string(),
        _ => String::new(),
    }
}

/// Device record the pod should carry, or `None` when it already matches
/// the request or there is nothing to act on.
pub fn rewritten_devices(meet: Option<&str>, devices: &[ContainerDevice]) -> Option<String> {
    let first = devices.first()?;
    let (requested, applied) = meet?.split_once(',')?;
    if requested == applied || requested == first.memory.to_string() {
        return None;
    }
    let Ok(memory) = requested.parse::<i64>() else {
        debug!("Ignoring malformed allocation request {}", requested);
        return None;
    };
    let rewritten: Vec<ContainerDevice> = devices
        .iter()
        .cloned()
        .map(|mut d| {
            d.memory = memory;
            d
        })
        .collect();
    Some(encode_devices(&rewritten))
}

async fn reconcile(pod: Arc<Pod>, ctx: Arc<MemberContext>) -> Result<Action, ControllerError> {
    let Some(allocated) = pod.annotations().get(VGPU_DEVICES_ALLOCATED_ANNOTATION) else {
        return Ok(Action::await_change());
    };
    let Some(flow_name) = pod.labels().get(FLOW_NAME_LABEL) else {
        return Ok(Action::await_change());
    };
    let namespace = pod.namespace().unwrap_or_default();
    let flows: Api<KantaloupeFlow> = Api::namespaced(ctx.client.clone(), &namespace);
    let Some(flow) = flows.get_opt(flow_name).await? else {
        return Ok(Action::await_change());
    };

    let devices = decode_devices(allocated)?;
    let expansion = oom_expansion(&pod, &devices);
    let current = flow.annotations().get(OOM_EXPANSION_ANNOTATION).map(String::as_str);
    if current != Some(expansion.as_str()) {
        debug!("Setting OOM expansion of flow {}/{} to {:?}", namespace, flow_name, expansion);
        let patch = serde_json::json!({
            "metadata": { "annotations": { OOM_EXPANSION_ANNOTATION: expansion } }
        });
        flows.patch(flow_name, &PatchParams::default(), &Patch::Merge(&patch)).await?;
    }

    let meet = flow.annotations().get(POD_ALLOCATION_MEET_ANNOTATION).map(String::as_str);
    if let Some(record) = rewritten_devices(meet, &devices) {
        info!("Restoring requested GPU memory on pod {}/{}", namespace, pod.name_any());
        let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": pod.resource_version(),
                "annotations": { VGPU_DEVICES_ALLOCATED_ANNOTATION: record },
            }
        });
        pods.patch(&pod.name_any(), &PatchParams::default(), &Patch::Merge(&patch)).await?;
    }
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_flow_pod;

    const RECORD: &str = "GPU-801f670d,NVIDIA,1024,10:;";

    #[test]
    fn test_oom_expansion() {
        let devices = decode_devices(RECORD).unwrap();
        let pod = create_test_flow_pod("demo", &[(VGPU_DEVICES_ALLOCATED_ANNOTATION, RECORD)]);
        assert_eq!(oom_expansion(&pod, &devices), "");

        let expanded = create_test_flow_pod("demo", &[(VGPU_DEVICES_ALLOCATED_ANNOTATION, RECORD), (OOM_ANNOTATION, "1")]);
        assert_eq!(oom_expansion(&expanded, &devices), "1024");
        assert_eq!(oom_expansion(&expanded, &[]), "");
    }

    #[test]
    fn test_rewritten_devices() {
        let devices = decode_devices(RECORD).unwrap();

        let record = rewritten_devices(Some("4096,1024"), &devices).unwrap();
        assert_eq!(decode_devices(&record).unwrap()[0].memory, 4096);

        // applied, already at the request, malformed or absent
        assert_eq!(rewritten_devices(Some("4096,4096"), &devices), None);
        assert_eq!(rewritten_devices(Some("1024,512"), &devices), None);
        assert_eq!(rewritten_devices(Some("4096"), &devices), None);
        assert_eq!(rewritten_devices(Some("lots,1024"), &devices), None);
        assert_eq!(rewritten_devices(None, &devices), None);
        assert_eq!(rewritten_devices(Some("4096,1024"), &[]), None);
    }
}
