//! Restarts the GPU device plugin when its configuration changes.

use crate::error::ControllerError;
use crate::member::MemberContext;
use crate::reconcile_helpers::object_key;
use crate::watcher::{RunOptions, run_controller};
use chrono::Utc;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, ResourceExt};
use kube_runtime::Controller;
use kube_runtime::controller::Action;
use kube_runtime::watcher::Config;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

const CONFIG_SELECTOR: &str = "app.kubernetes.io/component in (hami-device-plugin,hami-scheduler)";
const DEVICE_PLUGIN_SELECTOR: &str = "app.kubernetes.io/component=hami-device-plugin";
const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// Last seen configuration digest per configmap.
#[derive(Debug, Default)]
pub struct ConfigDigests(Mutex<HashMap<String, u64>>);

/// Outcome of observing a configmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Seen for the first time since start
    First,
    Unchanged,
    Changed,
}

impl ConfigDigests {
    /// Records the digest of `data` under `key`.
    pub fn observe(&self, key: &str, data: Option<&BTreeMap<String, String>>) -> Observation {
        let mut hasher = DefaultHasher::new();
        data.hash(&mut hasher);
        let digest = hasher.finish();

        let Ok(mut digests) = self.0.lock() else {
            return Observation::Unchanged;
        };
        match digests.insert(key.to_string(), digest) {
            None => Observation::First,
            Some(previous) if previous == digest => Observation::Unchanged,
            Some(_) => Observation::Changed,
        }
    }

    /// Forgets a deleted configmap.
    pub fn forget(&self, key: &str) {
        if let Ok(mut digests) = self.0.lock() {
            digests.remove(key);
        }
    }
}

struct RestartContext {
    member: Arc<MemberContext>,
    digests: ConfigDigests,
}

/// Runs the controller against the member until shutdown.
pub async fn run(ctx: Arc<MemberContext>, opts: RunOptions) {
    let configmaps: Api<ConfigMap> = Api::all(ctx.client.clone());
    let controller = Controller::new(configmaps, Config::default().labels(CONFIG_SELECTOR));
    let ctx = Arc::new(RestartContext {
        member: ctx,
        digests: ConfigDigests::default(),
    });
    run_controller(controller, ctx, reconcile, opts).await;
}

/// Merge patch rolling the pods of a DaemonSet.
pub fn restart_patch(now: &str) -> serde_json::Value {
    serde_json::json!({
        "spec": { "template": { "metadata": { "annotations": { RESTARTED_AT_ANNOTATION: now } } } }
    })
}

async fn restart_device_plugins(client: &kube::Client, namespace: &str) -> Result<(), ControllerError> {
    let api: Api<DaemonSet> = Api::namespaced(client.clone(), namespace);
    let daemonsets = api.list(&ListParams::default().labels(DEVICE_PLUGIN_SELECTOR)).await?;
    let now = Utc::now().to_rfc3339();
    for ds in daemonsets {
        let ready = ds.status.as_ref().map_or(0, |s| s.number_ready);
        if ready == 0 {
            debug!("Skipping device plugin {} with no ready pods", object_key(&ds));
            continue;
        }
        info!("Restarting device plugin {}", object_key(&ds));
        api.patch(&ds.name_any(), &PatchParams::default(), &Patch::Merge(&restart_patch(&now))).await?;
    }
    Ok(())
}

async fn reconcile(cm: Arc<ConfigMap>, ctx: Arc<RestartContext>) -> Result<Action, ControllerError> {
    let key = object_key(cm.as_ref());
    let namespace = cm.namespace().unwrap_or_default();
    let api: Api<ConfigMap> = Api::namespaced(ctx.member.client.clone(), &namespace);
    let Some(cm) = api.get_opt(&cm.name_any()).await? else {
        ctx.digests.forget(&key);
        return Ok(Action::await_change());
    };

    if ctx.digests.observe(&key, cm.data.as_ref()) == Observation::Changed {
        info!("Device plugin configuration {} changed", key);
        restart_device_plugins(&ctx.member.client, &namespace).await?;
    }
    Ok(Action::await_change())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_observation_does_not_restart() {
        let digests = ConfigDigests::default();
        let v1 = BTreeMap::from([("config.json".to_string(), "{\"nodeconfig\":[]}".to_string())]);
        let v2 = BTreeMap::from([("config.json".to_string(), "{\"nodeconfig\":[1]}".to_string())]);

        assert_eq!(digests.observe("hami/device-plugin", Some(&v1)), Observation::First);
        assert_eq!(digests.observe("hami/device-plugin", Some(&v1)), Observation::Unchanged);
        assert_eq!(digests.observe("hami/device-plugin", Some(&v2)), Observation::Changed);
        assert_eq!(digests.observe("hami/device-plugin", Some(&v2)), Observation::Unchanged);

        digests.forget("hami/device-plugin");
        assert_eq!(digests.observe("hami/device-plugin", Some(&v1)), Observation::First);
    }

    #[test]
    fn test_restart_patch() {
        let patch = restart_patch("2024-05-01T10:00:00+00:00");
        assert_eq!(
            patch["spec"]["template"]["metadata"]["annotations"][RESTARTED_AT_ANNOTATION],
            "2024-05-01T10:00:00+00:00"
        );
    }
}
