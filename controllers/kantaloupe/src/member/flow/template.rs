//! Pod template mutation for flow workloads.
//!
//! Flows with plugins get an init container that stages the plugin scripts
//! and package-manager configuration into shared volumes, and their primary
//! container is rewired to use them.

use crate::error::ControllerError;
use crate::quantity::parse_milli;
use crds::well_known::{FLOW_NAME_LABEL, METAX_GPU_MEMORY_RESOURCE, NVIDIA_GPU_MEMORY_RESOURCE};
use crds::{KantaloupeFlow, Networking, Plugin};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, ExecAction, Lifecycle, LifecycleHandler, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, TCPSocketAction, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use std::collections::BTreeMap;

/// Name of the injected init container.
pub const INIT_CONTAINER_NAME: &str = "init-container";

const SHARED_DATA: &str = "shared-data";
const PIP_CONFIG: &str = "pip-config-volume";
const APT_SOURCES: &str = "apt-sources";
const CUSTOM_PIP_CONFIG: &str = "custom-pip-config-volume";
const CUSTOM_APT_SOURCES: &str = "custom-apt-sources";

const BUILTIN_SCRIPT_DIR: &str = "/usr/local/builtin-script/copy";
const SSH_PORT: i32 = 22;
const JUPYTER_NETWORK: &str = "jupyter";
const VSCODE_NETWORK: &str = "vscode";

/// Name of the apt sources configmap of a flow.
pub fn apt_configmap_name(flow: &str) -> String {
    format!("{flow}-apt")
}

/// Name of the pip configuration configmap of a flow.
pub fn pip_configmap_name(flow: &str) -> String {
    format!("{flow}-pip")
}

/// Path prefix an HTTP endpoint is served under.
///
/// An explicit `url` wins; otherwise `<base><namespace>/<flow>/<network>`.
/// VS Code gets a trailing slash since its route rewrites the prefix to `/`.
pub fn match_path(flow: &KantaloupeFlow, network: &Networking, base_url: &str) -> String {
    let mut path = match network.url.as_deref() {
        Some(url) if !url.is_empty() => url.to_string(),
        _ => format!(
            "{base_url}{}/{}/{}",
            flow.namespace().unwrap_or_default(),
            flow.name_any(),
            network.name
        ),
    };
    if network.name == VSCODE_NETWORK {
        path.push('/');
    }
    path
}

fn jupyter_base_url(flow: &KantaloupeFlow, base_url: &str) -> String {
    flow.spec
        .networking
        .iter()
        .find(|n| n.name == JUPYTER_NETWORK)
        .map(|n| match_path(flow, n, base_url))
        .unwrap_or_default()
}

fn mount(name: &str, path: &str, sub_path: Option<&str>) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        sub_path: sub_path.map(str::to_string),
        ..Default::default()
    }
}

fn shell(script: &str) -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
}

fn init_container(image: &str) -> Container {
    let limits = BTreeMap::from([
        ("cpu".to_string(), Quantity("200m".to_string())),
        ("memory".to_string(), Quantity("200Mi".to_string())),
    ]);
    Container {
        name: INIT_CONTAINER_NAME.to_string(),
        image: Some(image.to_string()),
        command: Some(shell("/app/init_image.sh")),
        resources: Some(ResourceRequirements {
            limits: Some(limits.clone()),
            requests: Some(limits),
            ..Default::default()
        }),
        volume_mounts: Some(vec![
            mount(SHARED_DATA, "/copy", None),
            mount(PIP_CONFIG, "/pip-config-volume", None),
            mount(APT_SOURCES, "/apt-resources", None),
            mount(CUSTOM_PIP_CONFIG, "/custom-pip-config-volume", None),
            mount(CUSTOM_APT_SOURCES, "/custom-apt-resources", None),
        ]),
        ..Default::default()
    }
}

fn init_volumes(flow: &str) -> Result<Vec<Volume>, ControllerError> {
    let volumes = serde_json::json!([
        {"name": SHARED_DATA, "emptyDir": {}},
        {"name": PIP_CONFIG, "emptyDir": {}},
        {"name": APT_SOURCES, "emptyDir": {}},
        {"name": CUSTOM_PIP_CONFIG, "configMap": {"name": pip_configmap_name(flow)}},
        {"name": CUSTOM_APT_SOURCES, "configMap": {"name": apt_configmap_name(flow)}},
    ]);
    Ok(serde_json::from_value(volumes)?)
}

fn complete_container(container: &mut Container, flow: &KantaloupeFlow, base_url: &str) {
    container.volume_mounts = Some(vec![
        mount(SHARED_DATA, BUILTIN_SCRIPT_DIR, None),
        mount(PIP_CONFIG, "/root/.pip/pip.conf", Some("pip.conf")),
        mount(APT_SOURCES, "/etc/apt/sources.list", Some("sources.list")),
    ]);

    if flow.has_plugin(Plugin::Ssh) {
        container.readiness_probe = Some(Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::Int(SSH_PORT),
                ..Default::default()
            }),
            initial_delay_seconds: Some(1),
            period_seconds: Some(3),
            success_threshold: Some(1),
            failure_threshold: Some(240),
            ..Default::default()
        });
    }

    container.liveness_probe = Some(Probe {
        exec: Some(ExecAction { command: Some(shell(&format!("{BUILTIN_SCRIPT_DIR}/check_s6.sh"))) }),
        initial_delay_seconds: Some(10),
        period_seconds: Some(10),
        ..Default::default()
    });

    container.lifecycle = Some(Lifecycle {
        post_start: Some(LifecycleHandler {
            exec: Some(ExecAction {
                command: Some(shell(&format!(
                    "{BUILTIN_SCRIPT_DIR}/set_s6.sh > {BUILTIN_SCRIPT_DIR}/postStart.log 2>&1"
                ))),
            }),
            ..Default::default()
        }),
        ..Default::default()
    });

    let env = container.env.get_or_insert_with(Vec::new);
    for plugin in &flow.spec.plugins {
        env.push(EnvVar {
            name: plugin.env_name().to_string(),
            ..Default::default()
        });
    }
    if flow.has_plugin(Plugin::Jupyter) {
        env.push(EnvVar {
            name: "JUPYTER_BASE_URL".to_string(),
            value: Some(jupyter_base_url(flow, base_url)),
            ..Default::default()
        });
    }
}

fn pod_spec(flow: &KantaloupeFlow) -> Result<&PodSpec, ControllerError> {
    flow.spec
        .template
        .spec
        .as_ref()
        .filter(|s| !s.containers.is_empty())
        .ok_or_else(|| ControllerError::InvalidConfig(format!("flow {} has no containers", flow.name_any())))
}

/// Pod template of the flow workload.
///
/// Always carries the flow label. Plugin flows also get the init container,
/// the staging volumes and the rewired primary container.
pub fn mutate(flow: &KantaloupeFlow, init_image: &str, base_url: &str) -> Result<PodTemplateSpec, ControllerError> {
    let mut spec = pod_spec(flow)?.clone();
    let mut template = flow.spec.template.clone();
    template
        .metadata
        .get_or_insert_with(Default::default)
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(FLOW_NAME_LABEL.to_string(), flow.name_any());

    if flow.has_plugins() {
        spec.init_containers = Some(vec![init_container(init_image)]);
        spec.volumes.get_or_insert_with(Vec::new).extend(init_volumes(&flow.name_any())?);
        if let Some(primary) = spec.containers.first_mut() {
            complete_container(primary, flow, base_url);
        }
    }
    template.spec = Some(spec);
    Ok(template)
}

/// Memory limit of the primary container in the flow template, in MiB.
///
/// MetaX memory wins when both vendors are present.
pub fn gpu_memory_limit(flow: &KantaloupeFlow) -> Option<i64> {
    let limits = pod_spec(flow).ok()?.containers[0].resources.as_ref()?.limits.as_ref()?;
    [METAX_GPU_MEMORY_RESOURCE, NVIDIA_GPU_MEMORY_RESOURCE]
        .iter()
        .find_map(|r| limits.get(*r))
        .and_then(|q| parse_milli(&q.0))
        .and_then(|milli| i64::try_from(milli / 1000).ok())
}

/// Overrides the GPU memory limit of the primary container with `memory`.
pub fn set_gpu_memory_limit(spec: &mut PodSpec, memory: &str) {
    let Some(limits) = spec
        .containers
        .first_mut()
        .and_then(|c| c.resources.as_mut())
        .and_then(|r| r.limits.as_mut())
    else {
        return;
    };
    for resource in [NVIDIA_GPU_MEMORY_RESOURCE, METAX_GPU_MEMORY_RESOURCE] {
        if let Some(limit) = limits.get_mut(resource) {
            *limit = Quantity(memory.to_string());
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_flow;
    use crds::{NetworkType, WorkloadKind};

    const BASE: &str = "/kantaloupe.dynamia.ai/";

    fn network(name: &str, port: i32) -> Networking {
        Networking {
            name: name.to_string(),
            type_: NetworkType::Httproute,
            port,
            ..Default::default()
        }
    }

    #[test]
    fn test_mutate_without_plugins_only_labels() {
        let flow = create_test_flow("demo", "team-a", vec![], WorkloadKind::Deployment);
        let template = mutate(&flow, "init:1", BASE).unwrap();

        let labels = template.metadata.unwrap().labels.unwrap();
        assert_eq!(labels[FLOW_NAME_LABEL], "demo");
        let spec = template.spec.unwrap();
        assert!(spec.init_containers.is_none());
        assert!(spec.volumes.is_none());
        assert!(spec.containers[0].liveness_probe.is_none());
    }

    #[test]
    fn test_mutate_with_plugins() {
        let mut flow = create_test_flow("demo", "team-a", vec![Plugin::Ssh, Plugin::Jupyter], WorkloadKind::Deployment);
        flow.spec.networking = vec![network("jupyter", 8888)];
        let spec = mutate(&flow, "init:1", BASE).unwrap().spec.unwrap();

        let init = &spec.init_containers.unwrap()[0];
        assert_eq!(init.name, INIT_CONTAINER_NAME);
        assert_eq!(init.image.as_deref(), Some("init:1"));
        assert_eq!(init.volume_mounts.as_ref().unwrap().len(), 5);

        let volumes = spec.volumes.unwrap();
        assert_eq!(volumes.len(), 5);
        assert!(volumes.iter().any(|v| v.name == CUSTOM_APT_SOURCES));

        let main = &spec.containers[0];
        let readiness = main.readiness_probe.as_ref().unwrap();
        assert_eq!(readiness.tcp_socket.as_ref().unwrap().port, IntOrString::Int(22));
        assert_eq!(readiness.failure_threshold, Some(240));
        let env = main.env.as_ref().unwrap();
        assert!(env.iter().any(|e| e.name == "ENABLE_SSH"));
        let base_url = env.iter().find(|e| e.name == "JUPYTER_BASE_URL").unwrap();
        assert_eq!(base_url.value.as_deref(), Some("/kantaloupe.dynamia.ai/team-a/demo/jupyter"));
    }

    #[test]
    fn test_match_path() {
        let flow = create_test_flow("demo", "team-a", vec![Plugin::Vscode], WorkloadKind::Pod);
        assert_eq!(match_path(&flow, &network("vscode", 8080), BASE), "/kantaloupe.dynamia.ai/team-a/demo/vscode/");

        let mut explicit = network("jupyter", 8888);
        explicit.url = Some("/custom".to_string());
        assert_eq!(match_path(&flow, &explicit, BASE), "/custom");
    }

    #[test]
    fn test_gpu_memory_limit() {
        let mut flow = create_test_flow("demo", "team-a", vec![], WorkloadKind::Pod);
        assert_eq!(gpu_memory_limit(&flow), Some(4096));

        let spec = flow.spec.template.spec.as_mut().unwrap();
        set_gpu_memory_limit(spec, "8192");
        assert_eq!(gpu_memory_limit(&flow), Some(8192));

        flow.spec.template.spec.as_mut().unwrap().containers[0].resources = None;
        assert_eq!(gpu_memory_limit(&flow), None);
    }
}
