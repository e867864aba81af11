//! Status conditions shared by the Kantaloupe CRDs.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition status value for a true condition.
pub const CONDITION_TRUE: &str = "True";
/// Condition status value for a false condition.
pub const CONDITION_FALSE: &str = "False";
/// Condition status value for an unknown condition.
pub const CONDITION_UNKNOWN: &str = "Unknown";

/// A single observation of an aspect of a resource's state.
///
/// Mirrors `metav1.Condition`: conditions are keyed by `type` and the
/// transition time only moves when `status` flips.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type, e.g. "Ready"
    #[serde(rename = "type")]
    pub type_: String,

    /// One of "True", "False" or "Unknown"
    pub status: String,

    /// Machine-readable reason for the last transition
    #[serde(default)]
    pub reason: String,

    /// Human-readable details
    #[serde(default)]
    pub message: String,

    /// Last time the status flipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,

    /// Generation observed when the condition was set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Builds a condition without a transition time.
    pub fn new(type_: &str, status: &str, reason: &str, message: &str) -> Self {
        Self {
            type_: type_.to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: None,
            observed_generation: None,
        }
    }

    /// Whether the condition status is "True".
    pub fn is_true(&self) -> bool {
        self.status == CONDITION_TRUE
    }
}

/// Finds a condition by type.
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Inserts or updates a condition keyed by type.
///
/// The transition time is stamped with `now` only when the condition is new
/// or its status changed. Returns true when the list was modified.
pub fn set_condition(conditions: &mut Vec<Condition>, mut new: Condition, now: DateTime<Utc>) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == new.type_) {
        None => {
            if new.last_transition_time.is_none() {
                new.last_transition_time = Some(now);
            }
            conditions.push(new);
            true
        }
        Some(existing) => {
            let mut changed = false;
            if existing.status != new.status {
                existing.status = new.status;
                existing.last_transition_time = new.last_transition_time.or(Some(now));
                changed = true;
            }
            if existing.reason != new.reason {
                existing.reason = new.reason;
                changed = true;
            }
            if existing.message != new.message {
                existing.message = new.message;
                changed = true;
            }
            if new.observed_generation.is_some() && existing.observed_generation != new.observed_generation {
                existing.observed_generation = new.observed_generation;
                changed = true;
            }
            changed
        }
    }
}
