//! Cache transforms.
//!
//! Member informers hold every node and pod of a cluster, so objects are
//! trimmed to the fields the status aggregation reads before they are stored.

use kube::api::{ApiResource, DynamicObject};
use serde_json::{Map, Value};

/// Function applied to every object before it enters a store.
pub type Transform = fn(&mut DynamicObject);

/// Picks the transform for a resource kind. Unknown kinds are stored untouched.
pub fn for_resource(ar: &ApiResource) -> Transform {
    match (ar.group.as_str(), ar.kind.as_str()) {
        ("", "Pod") => strip_pod,
        ("", "Node") => strip_node,
        ("apps", "Deployment" | "StatefulSet") => strip_replicated,
        ("apps", "DaemonSet") => strip_daemon_set,
        _ => keep,
    }
}

fn keep(_: &mut DynamicObject) {}

fn strip_common(obj: &mut DynamicObject, keep_labels: bool) {
    let meta = &mut obj.metadata;
    meta.uid = None;
    meta.creation_timestamp = None;
    meta.managed_fields = None;
    meta.resource_version = None;
    meta.finalizers = None;
    meta.owner_references = None;
    if !keep_labels {
        meta.labels = None;
        meta.annotations = None;
    }
}

fn object_mut<'a>(data: &'a mut Value, key: &str) -> Option<&'a mut Map<String, Value>> {
    data.get_mut(key).and_then(Value::as_object_mut)
}

fn retain_keys(map: &mut Map<String, Value>, keys: &[&str]) {
    map.retain(|k, _| keys.contains(&k.as_str()));
}

fn strip_pod(obj: &mut DynamicObject) {
    strip_common(obj, false);
    if let Some(spec) = object_mut(&mut obj.data, "spec") {
        retain_keys(spec, &["containers", "initContainers", "nodeName", "overhead"]);
        for key in ["containers", "initContainers"] {
            if let Some(containers) = spec.get_mut(key).and_then(Value::as_array_mut) {
                for container in containers.iter_mut().filter_map(Value::as_object_mut) {
                    retain_keys(container, &["name", "image", "resources"]);
                }
            }
        }
    }
    if let Some(status) = object_mut(&mut obj.data, "status") {
        for key in [
            "message",
            "reason",
            "podIP",
            "podIPs",
            "hostIP",
            "hostIPs",
            "nominatedNodeName",
            "containerStatuses",
            "initContainerStatuses",
            "ephemeralContainerStatuses",
        ] {
            status.remove(key);
        }
    }
}

fn strip_node(obj: &mut DynamicObject) {
    // labels and annotations carry the provider and GPU registration
    strip_common(obj, true);
    if let Some(data) = obj.data.as_object_mut() {
        data.remove("spec");
    }
    if let Some(status) = object_mut(&mut obj.data, "status") {
        for key in ["images", "addresses", "nodeInfo", "volumesInUse", "volumesAttached", "daemonEndpoints"] {
            status.remove(key);
        }
    }
}

fn strip_replicated(obj: &mut DynamicObject) {
    strip_common(obj, false);
    let replicas = obj.data.get("spec").and_then(|s| s.get("replicas")).cloned();
    if let Some(data) = obj.data.as_object_mut() {
        data.remove("status");
        match replicas {
            Some(r) => {
                data.insert("spec".to_string(), serde_json::json!({ "replicas": r }));
            }
            None => {
                data.remove("spec");
            }
        }
    }
}

fn strip_daemon_set(obj: &mut DynamicObject) {
    strip_common(obj, false);
    if let Some(data) = obj.data.as_object_mut() {
        data.remove("spec");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
    use serde_json::json;

    fn dynamic(ar: &ApiResource, value: Value) -> DynamicObject {
        let mut obj: DynamicObject = serde_json::from_value(value).unwrap();
        for_resource(ar)(&mut obj);
        obj
    }

    #[test]
    fn test_pod_keeps_resources_and_phase() {
        let ar = ApiResource::erase::<Pod>(&());
        let obj = dynamic(&ar, json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "p", "namespace": "ns", "uid": "u", "labels": {"a": "b"}},
            "spec": {
                "nodeName": "n1",
                "serviceAccountName": "sa",
                "containers": [{"name": "c", "image": "i", "env": [], "resources": {"requests": {"cpu": "1"}}}]
            },
            "status": {"phase": "Running", "podIP": "10.0.0.1", "conditions": [{"type": "Ready", "status": "True"}]}
        }));
        assert!(obj.metadata.uid.is_none());
        assert!(obj.metadata.labels.is_none());
        assert_eq!(obj.data["spec"]["nodeName"], "n1");
        assert!(obj.data["spec"].get("serviceAccountName").is_none());
        assert!(obj.data["spec"]["containers"][0].get("env").is_none());
        assert_eq!(obj.data["spec"]["containers"][0]["resources"]["requests"]["cpu"], "1");
        assert!(obj.data["status"].get("podIP").is_none());
        assert_eq!(obj.data["status"]["phase"], "Running");
    }

    #[test]
    fn test_node_keeps_annotations() {
        let ar = ApiResource::erase::<Node>(&());
        let obj = dynamic(&ar, json!({
            "apiVersion": "v1",
            "kind": "Node",
            "metadata": {"name": "n1", "annotations": {"hami.io/node-nvidia-register": "x"}},
            "spec": {"podCIDR": "10.0.0.0/24"},
            "status": {"images": [], "allocatable": {"cpu": "8"}}
        }));
        assert!(obj.metadata.annotations.unwrap().contains_key("hami.io/node-nvidia-register"));
        assert!(obj.data.get("spec").is_none());
        assert!(obj.data["status"].get("images").is_none());
        assert_eq!(obj.data["status"]["allocatable"]["cpu"], "8");
    }

    #[test]
    fn test_deployment_keeps_only_replicas() {
        let ar = ApiResource::erase::<Deployment>(&());
        let obj = dynamic(&ar, json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "d"},
            "spec": {"replicas": 2, "template": {}},
            "status": {"readyReplicas": 2}
        }));
        assert_eq!(obj.data["spec"], json!({"replicas": 2}));
        assert!(obj.data.get("status").is_none());
    }

    #[test]
    fn test_namespace_is_untouched() {
        let ar = ApiResource::erase::<Namespace>(&());
        let obj = dynamic(&ar, json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {"name": "kube-system", "uid": "abc"}
        }));
        assert_eq!(obj.metadata.uid.as_deref(), Some("abc"));
    }
}
