//! Workload, package-manager configmaps and pod status of a flow.

use super::template::{apt_configmap_name, mutate, pip_configmap_name, set_gpu_memory_limit};
use crate::backoff::retry_on_conflict;
use crate::error::ControllerError;
use crate::member::{MemberContext, convert_condition};
use crate::reconcile_helpers::{contains_entries, merge_labels, spec_matches};
use crds::well_known::{APT_SOURCE_CONFIGMAP, FLOW_NAME_LABEL, PIP_CONF_CONFIGMAP, POD_ALLOCATION_MEET_ANNOTATION};
use crds::{Condition, KantaloupeFlow};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Resource, ResourceExt};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

fn owned_meta(flow: &KantaloupeFlow, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: flow.namespace(),
        labels: Some(merge_labels(flow.metadata.labels.as_ref(), &[(FLOW_NAME_LABEL, flow.name_any().as_str())])),
        annotations: flow.metadata.annotations.clone(),
        owner_references: flow.controller_owner_ref(&()).map(|o| vec![o]),
        ..Default::default()
    }
}

/// First value of the allocation annotation on the flow, if any.
fn requested_memory(flow: &KantaloupeFlow) -> Option<&str> {
    flow.annotations()
        .get(POD_ALLOCATION_MEET_ANNOTATION)
        .and_then(|v| v.split(',').next())
        .filter(|v| !v.is_empty())
}

/// Bare pod named after the flow, limits as in the template.
pub fn desired_pod(flow: &KantaloupeFlow, init_image: &str, base_url: &str) -> Result<Pod, ControllerError> {
    let template = mutate(flow, init_image, base_url)?;
    Ok(Pod {
        metadata: owned_meta(flow, flow.name_any()),
        spec: template.spec,
        status: None,
    })
}

/// Pod to create for the flow.
///
/// Limits of a running pod cannot change, so the requested GPU memory from
/// the allocation annotation only replaces the template limit here.
pub fn pod_for_creation(flow: &KantaloupeFlow, init_image: &str, base_url: &str) -> Result<Pod, ControllerError> {
    let mut pod = desired_pod(flow, init_image, base_url)?;
    if let (Some(memory), Some(spec)) = (requested_memory(flow), pod.spec.as_mut()) {
        set_gpu_memory_limit(spec, memory);
    }
    Ok(pod)
}

/// The existing pod with the desired image and limits, if either drifted.
pub fn pod_update(desired: &Pod, existing: &Pod) -> Result<Option<Pod>, ControllerError> {
    let want = desired.spec.as_ref().and_then(|s| s.containers.first());
    let want_limits = want.and_then(|c| c.resources.as_ref()).and_then(|r| r.limits.clone());
    let want_image = want.and_then(|c| c.image.clone());

    let mut updated = existing.clone();
    let Some(have) = updated.spec.as_mut().and_then(|s| s.containers.first_mut()) else {
        return Err(ControllerError::InvalidConfig(format!(
            "pod {} has no containers",
            existing.name_any()
        )));
    };
    let have_limits = have.resources.as_ref().and_then(|r| r.limits.as_ref());
    if have.image == want_image && have_limits == want_limits.as_ref() {
        return Ok(None);
    }
    have.image = want_image;
    have.resources.get_or_insert_with(Default::default).limits = want_limits;
    Ok(Some(updated))
}

/// Deployment named after the flow with a recreate strategy.
pub fn desired_deployment(flow: &KantaloupeFlow, init_image: &str, base_url: &str) -> Result<Deployment, ControllerError> {
    let name = flow.name_any();
    Ok(Deployment {
        metadata: owned_meta(flow, name.clone()),
        spec: Some(DeploymentSpec {
            replicas: flow.spec.replicas,
            selector: LabelSelector {
                match_labels: Some(BTreeMap::from([(FLOW_NAME_LABEL.to_string(), name)])),
                ..Default::default()
            },
            paused: Some(flow.spec.paused),
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                rolling_update: None,
            }),
            template: mutate(flow, init_image, base_url)?,
            ..Default::default()
        }),
        status: None,
    })
}

/// Flow conditions mirrored from a pod.
pub fn pod_conditions(pod: &Pod) -> Vec<Condition> {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
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
                .collect()
        })
        .unwrap_or_default()
}

async fn source_data(api: &Api<ConfigMap>, name: &str) -> Result<BTreeMap<String, String>, ControllerError> {
    match api.get_opt(name).await? {
        Some(cm) => Ok(cm.data.unwrap_or_default()),
        None => {
            warn!("Configmap {} not found, using empty data", name);
            Ok(BTreeMap::new())
        }
    }
}

/// Copies the operator apt and pip configmaps next to the flow.
pub async fn reconcile_configmaps(flow: &KantaloupeFlow, ctx: &MemberContext) -> Result<(), ControllerError> {
    let sources: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &ctx.namespace);
    let targets: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &flow.namespace().unwrap_or_default());
    let name = flow.name_any();

    for (source, target) in [
        (APT_SOURCE_CONFIGMAP, apt_configmap_name(&name)),
        (PIP_CONF_CONFIGMAP, pip_configmap_name(&name)),
    ] {
        let data = source_data(&sources, source).await?;
        match targets.get_opt(&target).await? {
            None => {
                debug!("Creating configmap {} for flow {}", target, name);
                let cm = ConfigMap {
                    metadata: owned_meta(flow, target),
                    data: Some(data),
                    ..Default::default()
                };
                targets.create(&PostParams::default(), &cm).await?;
            }
            Some(mut cm) if cm.data.as_ref() != Some(&data) => {
                debug!("Updating configmap {} for flow {}", target, name);
                cm.data = Some(data);
                targets.replace(&target, &PostParams::default(), &cm).await?;
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Ensures the flow pod exists and mirrors its conditions onto the flow.
pub async fn reconcile_pod(flow: &KantaloupeFlow, ctx: &MemberContext) -> Result<(), ControllerError> {
    let namespace = flow.namespace().unwrap_or_default();
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
    let desired = desired_pod(flow, &ctx.flow.init_image, &ctx.gateway.base_url)?;
    let name = flow.name_any();

    let pod = match pods.get_opt(&name).await? {
        None => {
            info!("Creating pod {}/{}", namespace, name);
            let pod = pod_for_creation(flow, &ctx.flow.init_image, &ctx.gateway.base_url)?;
            pods.create(&PostParams::default(), &pod).await?
        }
        Some(existing) => match pod_update(&desired, &existing)? {
            Some(updated) => {
                debug!("Updating image and limits of pod {}/{}", namespace, name);
                pods.replace(&name, &PostParams::default(), &updated).await?
            }
            None => existing,
        },
    };

    let conditions = pod_conditions(&pod);
    let current = flow.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or_default();
    if current != conditions.as_slice() {
        let flows: Api<KantaloupeFlow> = Api::namespaced(ctx.client.clone(), &namespace);
        let patch = serde_json::json!({ "status": { "conditions": conditions } });
        flows.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch)).await?;
    }
    Ok(())
}

/// Creates the flow deployment, or updates it when its spec drifted.
pub async fn reconcile_deployment(flow: &KantaloupeFlow, ctx: &MemberContext) -> Result<(), ControllerError> {
    let namespace = flow.namespace().unwrap_or_default();
    let api: Api<Deployment> = Api::namespaced(ctx.client.clone(), &namespace);
    let desired = desired_deployment(flow, &ctx.flow.init_image, &ctx.gateway.base_url)?;
    let name = flow.name_any();

    if api.get_opt(&name).await?.is_none() {
        info!("Creating deployment {}/{}", namespace, name);
        api.create(&PostParams::default(), &desired).await?;
        return Ok(());
    }

    let api = &api;
    let desired = &desired;
    let name = name.as_str();
    retry_on_conflict(|| async move {
        let Some(existing) = api.get_opt(name).await? else {
            return Ok(());
        };
        if let Some(updated) = deployment_update(desired, &existing) {
            debug!("Updating deployment {}", name);
            api.replace(name, &PostParams::default(), &updated).await?;
        }
        Ok::<(), ControllerError>(())
    })
    .await
}

/// The existing deployment carrying the desired spec and metadata, if it drifted.
///
/// Labels and annotations added by the server, such as the deployment
/// revision, are kept and do not count as drift.
pub fn deployment_update(desired: &Deployment, existing: &Deployment) -> Option<Deployment> {
    if spec_matches(&desired.spec, &existing.spec)
        && contains_entries(desired.metadata.labels.as_ref(), existing.metadata.labels.as_ref())
        && contains_entries(desired.metadata.annotations.as_ref(), existing.metadata.annotations.as_ref())
    {
        return None;
    }
    let mut updated = existing.clone();
    updated.spec.clone_from(&desired.spec);
    for (field, want) in [
        (&mut updated.metadata.labels, &desired.metadata.labels),
        (&mut updated.metadata.annotations, &desired.metadata.annotations),
    ] {
        if let Some(want) = want {
            field.get_or_insert_with(BTreeMap::new).extend(want.clone());
        }
    }
    Some(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::flow::template::INIT_CONTAINER_NAME;
    use crate::test_utils::create_test_flow;
    use crds::well_known::NVIDIA_GPU_MEMORY_RESOURCE;
    use crds::{Plugin, WorkloadKind};
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    #[test]
    fn test_desired_deployment() {
        let mut flow = create_test_flow("demo", "team-a", vec![Plugin::Ssh], WorkloadKind::Deployment);
        flow.spec.replicas = Some(2);
        flow.spec.paused = true;
        flow.metadata.labels = Some(BTreeMap::from([("team".to_string(), "a".to_string())]));

        let deployment = desired_deployment(&flow, "init:1", "/k/").unwrap();
        let labels = deployment.metadata.labels.unwrap();
        assert_eq!(labels["team"], "a");
        assert_eq!(labels[FLOW_NAME_LABEL], "demo");
        assert_eq!(deployment.metadata.owner_references.unwrap()[0].kind, "KantaloupeFlow");

        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(2));
        assert_eq!(spec.paused, Some(true));
        assert_eq!(spec.strategy.unwrap().type_.as_deref(), Some("Recreate"));
        assert_eq!(spec.selector.match_labels.unwrap()[FLOW_NAME_LABEL], "demo");
        let init = spec.template.spec.unwrap().init_containers.unwrap();
        assert_eq!(init[0].name, INIT_CONTAINER_NAME);
    }

    fn gpu_limit(pod: &Pod) -> Quantity {
        let limits = pod.spec.as_ref().unwrap().containers[0].resources.clone().unwrap().limits.unwrap();
        limits[NVIDIA_GPU_MEMORY_RESOURCE].clone()
    }

    fn with_meet(mut flow: KantaloupeFlow, meet: &str) -> KantaloupeFlow {
        flow.metadata.annotations = Some(BTreeMap::from([(POD_ALLOCATION_MEET_ANNOTATION.to_string(), meet.to_string())]));
        flow
    }

    #[test]
    fn test_requested_memory_applies_on_creation_only() {
        let flow = create_test_flow("demo", "team-a", vec![], WorkloadKind::Pod);
        assert_eq!(gpu_limit(&pod_for_creation(&flow, "init:1", "/k/").unwrap()), Quantity("4096".to_string()));

        let flow = with_meet(flow, "6144,4096");
        let created = pod_for_creation(&flow, "init:1", "/k/").unwrap();
        assert_eq!(created.metadata.name.as_deref(), Some("demo"));
        assert_eq!(created.metadata.labels.clone().unwrap()[FLOW_NAME_LABEL], "demo");
        assert_eq!(gpu_limit(&created), Quantity("6144".to_string()));

        let desired = desired_pod(&flow, "init:1", "/k/").unwrap();
        assert_eq!(gpu_limit(&desired), Quantity("4096".to_string()));
    }

    #[test]
    fn test_pending_rescale_leaves_running_pod_alone() {
        let flow = create_test_flow("demo", "team-a", vec![], WorkloadKind::Pod);
        let running = pod_for_creation(&flow, "init:1", "/k/").unwrap();

        let flow = with_meet(flow, "8192,4096");
        let desired = desired_pod(&flow, "init:1", "/k/").unwrap();
        assert!(pod_update(&desired, &running).unwrap().is_none());
    }

    #[test]
    fn test_pod_update_on_image_drift() {
        let flow = create_test_flow("demo", "team-a", vec![], WorkloadKind::Pod);
        let desired = desired_pod(&flow, "init:1", "/k/").unwrap();
        let mut running = desired.clone();
        running.spec.as_mut().unwrap().containers[0].image = Some("old:0".to_string());

        let updated = pod_update(&desired, &running).unwrap().unwrap();
        let want = desired.spec.as_ref().unwrap().containers[0].image.clone();
        assert_eq!(updated.spec.as_ref().unwrap().containers[0].image, want);
        assert_eq!(gpu_limit(&updated), Quantity("4096".to_string()));

        let mut empty = desired.clone();
        empty.spec.as_mut().unwrap().containers.clear();
        assert!(pod_update(&desired, &empty).is_err());
    }

    #[test]
    fn test_deployment_with_server_metadata_is_up_to_date() {
        let mut flow = create_test_flow("demo", "team-a", vec![], WorkloadKind::Deployment);
        flow.metadata.annotations = Some(BTreeMap::from([("note".to_string(), "x".to_string())]));
        let desired = desired_deployment(&flow, "init:1", "/k/").unwrap();

        let mut existing = desired.clone();
        existing.metadata.resource_version = Some("42".to_string());
        existing
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert("deployment.kubernetes.io/revision".to_string(), "3".to_string());
        existing.spec.as_mut().unwrap().revision_history_limit = Some(10);
        existing.spec.as_mut().unwrap().progress_deadline_seconds = Some(600);
        assert!(deployment_update(&desired, &existing).is_none());
    }

    #[test]
    fn test_deployment_update_keeps_server_metadata() {
        let mut flow = create_test_flow("demo", "team-a", vec![], WorkloadKind::Deployment);
        let stale = desired_deployment(&flow, "init:1", "/k/").unwrap();
        let mut existing = stale.clone();
        existing
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert("deployment.kubernetes.io/revision".to_string(), "3".to_string());

        flow.spec.replicas = Some(3);
        flow.metadata.labels = Some(BTreeMap::from([("team".to_string(), "a".to_string())]));
        let desired = desired_deployment(&flow, "init:1", "/k/").unwrap();

        let updated = deployment_update(&desired, &existing).unwrap();
        assert_eq!(updated.spec.as_ref().unwrap().replicas, Some(3));
        let labels = updated.metadata.labels.clone().unwrap();
        assert_eq!(labels["team"], "a");
        assert_eq!(labels[FLOW_NAME_LABEL], "demo");
        assert_eq!(updated.metadata.annotations.as_ref().unwrap()["deployment.kubernetes.io/revision"], "3");
        assert!(deployment_update(&desired, &updated).is_none());
    }

    #[test]
    fn test_pod_conditions() {
        let mut pod = Pod::default();
        assert!(pod_conditions(&pod).is_empty());

        pod.status = Some(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        let conditions = pod_conditions(&pod);
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].type_, "Ready");
        assert!(conditions[0].is_true());
    }
}
