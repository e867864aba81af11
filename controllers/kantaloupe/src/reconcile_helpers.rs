//! Helper functions for common reconciliation patterns
//!
//! Finalizer bookkeeping, object keys and metadata hygiene shared by the hub
//! and member reconcilers.

use crate::error::ControllerError;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Patch, PatchParams};
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt::Debug;
use tracing::debug;

/// Annotation written by `kubectl apply`, never propagated.
pub const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// `namespace/name`, or just `name` for cluster-scoped objects.
pub fn object_key<K: Resource>(obj: &K) -> String {
    let name = obj.meta().name.clone().unwrap_or_default();
    match obj.meta().namespace.as_deref() {
        Some(ns) if !ns.is_empty() => format!("{ns}/{name}"),
        _ => name,
    }
}

/// Whether the object has a deletion timestamp.
pub fn is_deleting<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

/// Adds `finalizer` when absent. Returns true when the list changed.
pub fn add_finalizer(finalizers: &mut Vec<String>, finalizer: &str) -> bool {
    if finalizers.iter().any(|f| f == finalizer) {
        return false;
    }
    finalizers.push(finalizer.to_string());
    true
}

/// Removes every occurrence of `finalizer`. Returns true when the list changed.
pub fn remove_finalizer_from(finalizers: &mut Vec<String>, finalizer: &str) -> bool {
    let before = finalizers.len();
    finalizers.retain(|f| f != finalizer);
    before != finalizers.len()
}

/// Ensures `finalizer` is on the object, patching only when it is missing.
pub async fn ensure_finalizer<K>(api: &Api<K>, obj: &K, finalizer: &str) -> Result<bool, ControllerError>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let mut finalizers = obj.finalizers().to_vec();
    if !add_finalizer(&mut finalizers, finalizer) {
        return Ok(false);
    }
    debug!("Adding finalizer {} to {}", finalizer, object_key(obj));
    patch_finalizers(api, obj, finalizers).await?;
    Ok(true)
}

/// Removes `finalizer` from the object, patching only when it is present.
pub async fn remove_finalizer<K>(api: &Api<K>, obj: &K, finalizer: &str) -> Result<bool, ControllerError>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let mut finalizers = obj.finalizers().to_vec();
    if !remove_finalizer_from(&mut finalizers, finalizer) {
        return Ok(false);
    }
    debug!("Removing finalizer {} from {}", finalizer, object_key(obj));
    patch_finalizers(api, obj, finalizers).await?;
    Ok(true)
}

async fn patch_finalizers<K>(api: &Api<K>, obj: &K, finalizers: Vec<String>) -> Result<(), ControllerError>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    // resourceVersion turns the merge patch into a conditional write
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": obj.meta().resource_version,
        }
    });
    api.patch(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch)).await?;
    Ok(())
}

/// Merges `extra` into `labels`, `extra` winning on conflicts.
pub fn merge_labels(labels: Option<&BTreeMap<String, String>>, extra: &[(&str, &str)]) -> BTreeMap<String, String> {
    let mut merged = labels.cloned().unwrap_or_default();
    for (k, v) in extra {
        merged.insert((*k).to_string(), (*v).to_string());
    }
    merged
}

/// Drops managedFields and the last-applied annotation.
pub fn strip_unused_fields(meta: &mut ObjectMeta) {
    meta.managed_fields = None;
    if let Some(annotations) = meta.annotations.as_mut() {
        annotations.remove(LAST_APPLIED_ANNOTATION);
    }
}

/// Whether every entry of `want` is present in `have` with the same value.
pub fn contains_entries(want: Option<&BTreeMap<String, String>>, have: Option<&BTreeMap<String, String>>) -> bool {
    want.is_none_or(|want| want.iter().all(|(k, v)| have.and_then(|have| have.get(k)) == Some(v)))
}

/// Strips a leading `http://` or `https://`.
pub fn strip_scheme(address: &str) -> &str {
    address
        .strip_prefix("https://")
        .or_else(|| address.strip_prefix("http://"))
        .unwrap_or(address)
}

/// Whether every field set in `desired` has the same value in `actual`.
///
/// Objects compare key by key, arrays element by element with equal length.
/// Fields the API server defaults on `actual` are ignored, and a zero value
/// in `desired` matches an omitted field, so a desired spec can be compared
/// with the stored one without spurious updates.
pub fn is_subset(desired: &serde_json::Value, actual: &serde_json::Value) -> bool {
    use serde_json::Value;
    match (desired, actual) {
        (Value::Object(want), Value::Object(have)) => want.iter().all(|(k, v)| match have.get(k) {
            Some(a) => is_subset(v, a),
            None => is_zero(v),
        }),
        (Value::Array(want), Value::Array(have)) => {
            want.len() == have.len() && want.iter().zip(have).all(|(w, h)| is_subset(w, h))
        }
        _ => desired == actual,
    }
}

fn is_zero(value: &serde_json::Value) -> bool {
    use serde_json::Value;
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Number(_) => false,
    }
}

/// [`is_subset`] over serializable values.
pub fn spec_matches<T: serde::Serialize>(desired: &T, actual: &T) -> bool {
    match (serde_json::to_value(desired), serde_json::to_value(actual)) {
        (Ok(d), Ok(a)) => is_subset(&d, &a),
        _ => false,
    }
}
