//! Manager configuration.
//!
//! All settings come from environment variables with defaults, read once at
//! startup and threaded through constructors.

use crate::error::ControllerError;
use crds::well_known::DEFAULT_NAMESPACE;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;

const SERVICE_ACCOUNT_NAMESPACE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Default member controller selection.
pub const DEFAULT_MULTI_CONTROLLERS: &str = "-cleanupInactiveWorkloadController,*";

/// Flags of the controller manager.
#[derive(Debug, Clone)]
pub struct Options {
    /// Duration of successes before a recovered cluster is reported healthy
    pub cluster_success_threshold: Duration,
    /// Duration of failures before a cluster is reported unhealthy
    pub cluster_failure_threshold: Duration,
    /// How often cluster status is recomputed
    pub cluster_status_update_frequency: Duration,
    /// Concurrent reconciles per controller
    pub concurrent_work_syncs: u16,
    /// Listen address of the probe and metrics server
    pub health_probe_bind_address: SocketAddr,
    /// Lowers the log level and reads the hub kubeconfig from disk
    pub debug_mode: bool,
    /// Member controller selection (`name`, `-name`, `*`)
    pub multi_controllers: Vec<String>,
    /// Timeout of requests sent to member API servers
    pub cluster_api_timeout: Duration,
    /// Leaves the kube-system identity check disabled
    pub skip_check_cluster_kube_system_id: bool,
    /// Namespace the manager runs in
    pub namespace: String,
    /// Gateway settings shared by member controllers
    pub gateway: GatewaySettings,
    /// Flow workload settings
    pub flow: FlowSettings,
}

/// Settings of the hub gateway and its listener port range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewaySettings {
    /// Path prefix of generated HTTP routes
    pub base_url: String,
    /// Explicit endpoint published for the hub; empty means derive it from the Gateway
    pub endpoint: String,
    /// First listener port
    pub port_start: i32,
    /// Number of listener ports
    pub port_count: i32,
}

/// Settings applied to flow workloads.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowSettings {
    /// Image of the injected init container
    pub init_image: String,
    /// Seconds of GPU inactivity before a workload is collected
    pub cleanup_inactive_threshold: f64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            base_url: "/kantaloupe.dynamia.ai/".to_string(),
            endpoint: String::new(),
            port_start: 30000,
            port_count: 30000,
        }
    }
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            init_image: "ghcr.io/dynamia-ai/init-image:v0.0.2".to_string(),
            cleanup_inactive_threshold: 3600.0,
        }
    }
}

impl Options {
    /// Reads options from the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        let namespace = current_namespace();
        Self::from_lookup(|key| env::var(key).ok(), namespace)
    }

    /// Reads options through an arbitrary lookup, used by tests.
    pub fn from_lookup<F>(lookup: F, namespace: String) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let gateway_defaults = GatewaySettings::default();
        let flow_defaults = FlowSettings::default();

        let multi_controllers = get("MULTI_CONTROLLERS")
            .unwrap_or_else(|| DEFAULT_MULTI_CONTROLLERS.to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let health_probe_bind_address = get("HEALTH_PROBE_BIND_ADDRESS")
            .unwrap_or_else(|| "0.0.0.0:10357".to_string());
        let health_probe_bind_address = health_probe_bind_address.parse::<SocketAddr>().map_err(|e| {
            ControllerError::InvalidConfig(format!("HEALTH_PROBE_BIND_ADDRESS {health_probe_bind_address}: {e}"))
        })?;

        Ok(Self {
            cluster_success_threshold: parse_duration("CLUSTER_SUCCESS_THRESHOLD", get("CLUSTER_SUCCESS_THRESHOLD"), 30)?,
            cluster_failure_threshold: parse_duration("CLUSTER_FAILURE_THRESHOLD", get("CLUSTER_FAILURE_THRESHOLD"), 30)?,
            cluster_status_update_frequency: parse_duration(
                "CLUSTER_STATUS_UPDATE_FREQUENCY",
                get("CLUSTER_STATUS_UPDATE_FREQUENCY"),
                10,
            )?,
            concurrent_work_syncs: parse_number("CONCURRENT_WORK_SYNCS", get("CONCURRENT_WORK_SYNCS"), 5)?,
            health_probe_bind_address,
            debug_mode: parse_bool("DEBUG_MODE", get("DEBUG_MODE"))?,
            multi_controllers,
            cluster_api_timeout: parse_duration("CLUSTER_API_TIMEOUT", get("CLUSTER_API_TIMEOUT"), 30)?,
            skip_check_cluster_kube_system_id: parse_bool(
                "SKIP_CHECK_CLUSTER_KUBESYSTEMID",
                get("SKIP_CHECK_CLUSTER_KUBESYSTEMID"),
            )?,
            namespace,
            gateway: GatewaySettings {
                base_url: get("GATEEAY_BASE_URL").unwrap_or(gateway_defaults.base_url),
                endpoint: get("GATEEAY_ENDPOINT").unwrap_or(gateway_defaults.endpoint),
                port_start: parse_number("GATEWAY_PORT_START", get("GATEWAY_PORT_START"), gateway_defaults.port_start)?,
                port_count: parse_number("GATEWAY_PORT_COUNT", get("GATEWAY_PORT_COUNT"), gateway_defaults.port_count)?,
            },
            flow: FlowSettings {
                init_image: get("INIT_IMAGE").unwrap_or(flow_defaults.init_image),
                cleanup_inactive_threshold: parse_number(
                    "CLEANUP_INACTIVE_WORKLOAD_THRESHOLD",
                    get("CLEANUP_INACTIVE_WORKLOAD_THRESHOLD"),
                    flow_defaults.cleanup_inactive_threshold,
                )?,
            },
        })
    }
}

/// Namespace the manager runs in.
///
/// `POD_NAMESPACE` wins, then the service account mount, then the default.
pub fn current_namespace() -> String {
    if let Ok(ns) = env::var("POD_NAMESPACE") {
        if !ns.is_empty() {
            return ns;
        }
    }
    match std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE) {
        Ok(ns) if !ns.trim().is_empty() => ns.trim().to_string(),
        _ => DEFAULT_NAMESPACE.to_string(),
    }
}

/// Parses `30s`, `5m`, `1h`, `250ms` or a bare number of seconds.
pub fn parse_duration(key: &str, value: Option<String>, default_secs: u64) -> Result<Duration, ControllerError> {
    let Some(raw) = value else {
        return Ok(Duration::from_secs(default_secs));
    };
    let raw = raw.trim();
    let invalid = || ControllerError::InvalidConfig(format!("{key}: invalid duration {raw:?}"));

    let (number, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => raw.split_at(idx),
        None => (raw, "s"),
    };
    let n: u64 = number.parse().map_err(|_| invalid())?;
    match unit {
        "ms" => Ok(Duration::from_millis(n)),
        "s" => Ok(Duration::from_secs(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        "h" => Ok(Duration::from_secs(n * 3600)),
        _ => Err(invalid()),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: Option<String>, default: T) -> Result<T, ControllerError> {
    match value {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ControllerError::InvalidConfig(format!("{key}: invalid number {raw:?}"))),
    }
}

fn parse_bool(key: &str, value: Option<String>) -> Result<bool, ControllerError> {
    match value.as_deref().map(str::trim) {
        None => Ok(false),
        Some("1" | "true" | "TRUE" | "True") => Ok(true),
        Some("0" | "false" | "FALSE" | "False") => Ok(false),
        Some(other) => Err(ControllerError::InvalidConfig(format!("{key}: invalid bool {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn options(vars: &[(&str, &str)]) -> Result<Options, ControllerError> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Options::from_lookup(|k| vars.get(k).cloned(), "kantaloupe-system".to_string())
    }

    #[test]
    fn test_defaults() {
        let opts = options(&[]).unwrap();
        assert_eq!(opts.cluster_success_threshold, Duration::from_secs(30));
        assert_eq!(opts.cluster_status_update_frequency, Duration::from_secs(10));
        assert_eq!(opts.concurrent_work_syncs, 5);
        assert_eq!(opts.health_probe_bind_address.port(), 10357);
        assert_eq!(opts.multi_controllers, vec!["-cleanupInactiveWorkloadController", "*"]);
        assert_eq!(opts.gateway, GatewaySettings::default());
        assert_eq!(opts.flow.cleanup_inactive_threshold, 3600.0);
        assert!(!opts.debug_mode);
    }

    #[test]
    fn test_overrides() {
        let opts = options(&[
            ("CLUSTER_FAILURE_THRESHOLD", "2m"),
            ("GATEWAY_PORT_START", "40000"),
            ("GATEEAY_BASE_URL", "/gw/"),
            ("MULTI_CONTROLLERS", "*"),
            ("DEBUG_MODE", "true"),
        ])
        .unwrap();
        assert_eq!(opts.cluster_failure_threshold, Duration::from_secs(120));
        assert_eq!(opts.gateway.port_start, 40000);
        assert_eq!(opts.gateway.base_url, "/gw/");
        assert_eq!(opts.multi_controllers, vec!["*"]);
        assert!(opts.debug_mode);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(matches!(
            options(&[("CONCURRENT_WORK_SYNCS", "many")]),
            Err(ControllerError::InvalidConfig(_))
        ));
        assert!(matches!(
            options(&[("CLUSTER_API_TIMEOUT", "5 days")]),
            Err(ControllerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("k", Some("250ms".into()), 0).unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("k", Some("15".into()), 0).unwrap(), Duration::from_secs(15));
        assert_eq!(parse_duration("k", Some("1h".into()), 0).unwrap(), Duration::from_secs(3600));
    }
}
