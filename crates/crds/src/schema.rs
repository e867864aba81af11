//! JSON schema helpers for embedded Kubernetes types.
//!
//! k8s-openapi types do not implement `JsonSchema`, so fields that embed them
//! are published as structural objects that preserve unknown fields.

use schemars::{json_schema, Schema, SchemaGenerator};

/// Schema for an embedded object such as a `PodTemplateSpec`.
pub fn raw_object_schema(_: &mut SchemaGenerator) -> Schema {
    json_schema!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true,
    })
}

/// Schema for a list of embedded objects such as `VolumeMount`s.
pub fn raw_object_list_schema(_: &mut SchemaGenerator) -> Schema {
    json_schema!({
        "type": "array",
        "items": {
            "type": "object",
            "x-kubernetes-preserve-unknown-fields": true,
        },
    })
}

/// Schema for a `ResourceList` (resource name to quantity).
pub fn resource_list_schema(_: &mut SchemaGenerator) -> Schema {
    json_schema!({
        "type": "object",
        "additionalProperties": {
            "anyOf": [{ "type": "integer" }, { "type": "string" }],
            "x-kubernetes-int-or-string": true,
        },
    })
}
