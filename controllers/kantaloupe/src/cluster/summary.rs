//! Status aggregation for a member cluster.

use crate::quantity::{ResourceTotals, pod_requests};
use crds::well_known::{NODE_NVIDIA_REGISTER_ANNOTATION, NVIDIA_GPU_COUNT_RESOURCE, NVIDIA_GPU_MEMORY_COUNT_RESOURCE};
use crds::{FLOW_CONDITION_AVAILABLE, KantaloupeFlow, NumSummary, ResourceSummary, find_condition};
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;
use tracing::warn;

const PODS_RESOURCE: &str = "pods";
const REGISTER_FIELDS: usize = 7;

fn count(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

/// Total nodes and nodes whose Ready condition is True.
pub fn node_summary(nodes: &[Node]) -> NumSummary {
    let ready = nodes
        .iter()
        .filter(|node| {
            node.status
                .as_ref()
                .and_then(|s| s.conditions.as_ref())
                .and_then(|c| c.iter().find(|c| c.type_ == "Ready"))
                .is_some_and(|c| c.status == "True")
        })
        .count();
    NumSummary { total_num: count(nodes.len()), ready_num: count(ready) }
}

/// Total pods and running pods with a True Ready condition.
pub fn pod_summary(pods: &[Pod]) -> NumSummary {
    let ready = pods
        .iter()
        .filter(|pod| {
            let Some(status) = pod.status.as_ref() else {
                return false;
            };
            status.phase.as_deref() == Some("Running")
                && status
                    .conditions
                    .iter()
                    .flatten()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .count();
    NumSummary { total_num: count(pods.len()), ready_num: count(ready) }
}

/// Total flows and flows whose Available condition is True.
pub fn flow_summary(flows: &[KantaloupeFlow]) -> NumSummary {
    let ready = flows
        .iter()
        .filter(|flow| {
            flow.status
                .as_ref()
                .and_then(|s| find_condition(&s.conditions, FLOW_CONDITION_AVAILABLE))
                .is_some_and(|c| c.is_true())
        })
        .count();
    NumSummary { total_num: count(flows.len()), ready_num: count(ready) }
}

/// GPU count and memory total from a node registration annotation.
///
/// Devices are `:`-separated; only 7-field records count and the third
/// field is the device memory.
pub fn parse_gpu_register(node: &str, value: &str) -> (i64, i64) {
    let mut gpus = 0;
    let mut memory = 0;
    for info in value.split(':') {
        let fields: Vec<&str> = info.split(',').collect();
        if fields.len() != REGISTER_FIELDS {
            continue;
        }
        match fields[2].parse::<i64>() {
            Ok(m) => memory += m,
            Err(e) => warn!("Failed to parse GPU memory {:?} of node {}: {}", fields[2], node, e),
        }
        gpus += 1;
    }
    (gpus, memory)
}

/// Sum of node allocatable plus the NVIDIA GPU totals.
pub fn allocatable(nodes: &[Node]) -> BTreeMap<String, Quantity> {
    let mut totals = ResourceTotals::default();
    let mut gpus = 0;
    let mut gpu_memory = 0;
    for node in nodes {
        if let Some(list) = node.status.as_ref().and_then(|s| s.allocatable.as_ref()) {
            totals.add_list(list);
        }
        let register = node
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(NODE_NVIDIA_REGISTER_ANNOTATION));
        if let Some(value) = register {
            let name = node.metadata.name.as_deref().unwrap_or_default();
            let (n, m) = parse_gpu_register(name, value);
            gpus += n;
            gpu_memory += m;
        }
    }
    let mut list = totals.to_list();
    list.insert(NVIDIA_GPU_COUNT_RESOURCE.to_string(), Quantity(gpus.to_string()));
    list.insert(NVIDIA_GPU_MEMORY_COUNT_RESOURCE.to_string(), Quantity(gpu_memory.to_string()));
    list
}

fn node_name(pod: &Pod) -> &str {
    pod.spec.as_ref().and_then(|s| s.node_name.as_deref()).unwrap_or_default()
}

fn sum_requests<'a>(pods: impl Iterator<Item = &'a Pod>) -> BTreeMap<String, Quantity> {
    let mut totals = ResourceTotals::default();
    let mut n: i128 = 0;
    for pod in pods {
        totals.add_totals(&pod_requests(pod));
        n += 1;
    }
    totals.add(PODS_RESOURCE, n * 1000);
    totals.to_list()
}

/// Requests of pods not yet bound to a node.
pub fn allocating(pods: &[Pod]) -> BTreeMap<String, Quantity> {
    sum_requests(pods.iter().filter(|p| node_name(p).is_empty()))
}

/// Requests of bound pods that still hold their resources.
pub fn allocated(pods: &[Pod]) -> BTreeMap<String, Quantity> {
    sum_requests(pods.iter().filter(|p| {
        let phase = p.status.as_ref().and_then(|s| s.phase.as_deref());
        !node_name(p).is_empty() && !matches!(phase, Some("Succeeded" | "Failed"))
    }))
}

/// Allocatable, allocating and allocated totals.
pub fn resource_summary(nodes: &[Node], pods: &[Pod]) -> ResourceSummary {
    ResourceSummary {
        allocatable: allocatable(nodes),
        allocating: allocating(pods),
        allocated: allocated(pods),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_node, create_test_pod};
    use k8s_openapi::api::core::v1::{NodeCondition, PodCondition};

    fn q(v: &str) -> Quantity {
        Quantity(v.to_string())
    }

    #[test]
    fn test_gpu_register_counts_seven_field_records() {
        let value = "GPU-1,10,24576,100,NVIDIA-A10,0,true:GPU-2,10,24576,100,NVIDIA-A10,0,true:broken,1:";
        assert_eq!(parse_gpu_register("n1", value), (2, 49152));
        assert_eq!(parse_gpu_register("n1", ""), (0, 0));
    }

    #[test]
    fn test_allocatable_adds_gpu_totals() {
        let nodes = vec![
            create_test_node(
                "n1",
                &[],
                &[(NODE_NVIDIA_REGISTER_ANNOTATION, "GPU-1,10,16384,100,A10,0,true:")],
                &[("cpu", "4"), ("memory", "8Gi")],
            ),
            create_test_node("n2", &[], &[], &[("cpu", "2")]),
        ];
        let list = allocatable(&nodes);
        assert_eq!(list["cpu"], q("6"));
        assert_eq!(list[NVIDIA_GPU_COUNT_RESOURCE], q("1"));
        assert_eq!(list[NVIDIA_GPU_MEMORY_COUNT_RESOURCE], q("16384"));
    }

    #[test]
    fn test_allocatable_without_gpus_reports_zero() {
        let list = allocatable(&[]);
        assert_eq!(list[NVIDIA_GPU_COUNT_RESOURCE], q("0"));
        assert_eq!(list[NVIDIA_GPU_MEMORY_COUNT_RESOURCE], q("0"));
    }

    #[test]
    fn test_allocating_and_allocated_split_on_node_name() {
        let pods = vec![
            create_test_pod("pending", None, "Pending", &[("cpu", "500m")]),
            create_test_pod("running", Some("n1"), "Running", &[("cpu", "1")]),
            create_test_pod("done", Some("n1"), "Succeeded", &[("cpu", "8")]),
        ];
        let allocating = allocating(&pods);
        assert_eq!(allocating["cpu"], q("500m"));
        assert_eq!(allocating["pods"], q("1"));

        let allocated = allocated(&pods);
        assert_eq!(allocated["cpu"], q("1"));
        assert_eq!(allocated["pods"], q("1"));
    }

    #[test]
    fn test_num_summaries() {
        let mut ready_node = create_test_node("n1", &[], &[], &[]);
        ready_node.status.as_mut().unwrap().conditions = Some(vec![NodeCondition {
            type_: "Ready".to_string(),
            status: "True".to_string(),
            ..Default::default()
        }]);
        let nodes = vec![ready_node, create_test_node("n2", &[], &[], &[])];
        assert_eq!(node_summary(&nodes), NumSummary { total_num: 2, ready_num: 1 });

        let mut ready_pod = create_test_pod("a", Some("n1"), "Running", &[]);
        ready_pod.status.as_mut().unwrap().conditions = Some(vec![PodCondition {
            type_: "Ready".to_string(),
            status: "True".to_string(),
            ..Default::default()
        }]);
        let pods = vec![ready_pod, create_test_pod("b", Some("n1"), "Running", &[])];
        assert_eq!(pod_summary(&pods), NumSummary { total_num: 2, ready_num: 1 });

        assert_eq!(flow_summary(&[]), NumSummary::default());
    }
}
