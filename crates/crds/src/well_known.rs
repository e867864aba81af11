//! Stable names shared between the hub and member controllers.

/// Name of the Cluster object representing the hub itself.
pub const GLOBAL_CLUSTER_NAME: &str = "local-cluster";
/// Secret holding the hub kubeconfig.
pub const GLOBAL_CLUSTER_SECRET: &str = "local-cluster-secret";
/// Key of the kubeconfig inside cluster secrets.
pub const KUBECONFIG_SECRET_KEY: &str = "config";
/// Namespace used when no other source names one.
pub const DEFAULT_NAMESPACE: &str = "kantaloupe-system";

/// Label tying children and pods to their flow.
pub const FLOW_NAME_LABEL: &str = "katanloupeflow-name";
/// Flow annotation `<requested>,<applied>` GPU memory.
pub const POD_ALLOCATION_MEET_ANNOTATION: &str = "kantaloupe.dynamia.io/pod-allocation-meet";
/// Flow annotation carrying the memory an OOM-ed pod should grow to.
pub const OOM_EXPANSION_ANNOTATION: &str = "kantaloupe.dynamia.io/oom-expansion-to";

/// Pod annotation listing the GPU devices bound by the device plugin.
pub const VGPU_DEVICES_ALLOCATED_ANNOTATION: &str = "hami.io/vgpu-devices-allocated";
/// Pod annotation set by the device plugin when a container hits OOM.
pub const OOM_ANNOTATION: &str = "hami.io/nvidia-initial-device-memory";
/// Node annotation listing registered NVIDIA devices.
pub const NODE_NVIDIA_REGISTER_ANNOTATION: &str = "hami.io/node-nvidia-register";
/// Node annotation prefix for registered Ascend devices.
pub const NODE_ASCEND_REGISTER_PREFIX: &str = "hami.io/node-register-Ascend";
/// Node annotation listing MetaX devices.
pub const NODE_METAX_DEVICES_ANNOTATION: &str = "metax-tech.com/node-gpu-devices";
/// Allocatable resource advertised by Neuron nodes.
pub const NEURON_RESOURCE: &str = "aws.amazon.com/neuron";

/// NVIDIA GPU memory resource.
pub const NVIDIA_GPU_MEMORY_RESOURCE: &str = "nvidia.com/gpumem";
/// MetaX GPU memory resource.
pub const METAX_GPU_MEMORY_RESOURCE: &str = "metax-tech.com/sgpumem";
/// Published total of registered NVIDIA GPUs.
pub const NVIDIA_GPU_COUNT_RESOURCE: &str = "nvidia.com/gpu.count";
/// Published total of registered NVIDIA GPU memory.
pub const NVIDIA_GPU_MEMORY_COUNT_RESOURCE: &str = "nvidia.com/gpu-memory.count";

/// Node label set by GKE node pools.
pub const GKE_NODEPOOL_LABEL: &str = "cloud.google.com/gke-nodepool";
/// Node label set by EKS node groups.
pub const EKS_NODEGROUP_LABEL: &str = "eks.amazonaws.com/nodegroup";

/// Gateway every flow route attaches to.
pub const GATEWAY_NAME: &str = "kantaloupe";
/// Namespace of the prometheus-operator objects.
pub const MONITORING_NAMESPACE: &str = "monitoring";
/// Template ScrapeConfig cloned per member.
pub const SCRAPE_CONFIG_TEMPLATE: &str = "kantaloupe-local-cluster";
/// Prefix of per-member federated ScrapeConfigs.
pub const SCRAPE_CONFIG_PREFIX: &str = "kantaloupe-federate-";
/// Prometheus address assigned to the hub cluster.
pub const DEFAULT_PROMETHEUS_ADDRESS: &str =
    "http://prometheus-kube-prometheus-prometheus.monitoring.svc.cluster.local:9090";
/// ServiceMonitors installed on members and removed with them.
pub const MEMBER_SERVICE_MONITORS: [&str; 5] = [
    "hami-device-plugin",
    "hami-scheduler",
    "metax-mx-exporter-monitor",
    "nvidia-dcgm-exporter",
    "npu-exporter",
];

/// Finalizer guarding cluster status teardown.
pub const CLUSTER_FINALIZER: &str = "kantaloupe.dynamia.ai/cluster-controller";
/// Finalizer guarding member manager teardown.
pub const MULTI_CLUSTER_FINALIZER: &str = "kantaloupe.dynamia.ai/multi-controller";
/// Finalizer on flows.
pub const FLOW_FINALIZER: &str = "kantaloupe.dynamia.ai/kantaloupe-controller";
/// Finalizer on TCPRoutes guarding listener release.
pub const TCPROUTE_FINALIZER: &str = "kantaloupe.dynamia.ai/tcproute-controller";

/// ConfigMap holding apt sources copied into each flow.
pub const APT_SOURCE_CONFIGMAP: &str = "kantaloupe-apt-resources";
/// ConfigMap holding the pip config copied into each flow.
pub const PIP_CONF_CONFIGMAP: &str = "kantaloupe-pip-conf";
