//! Ready condition hysteresis.
//!
//! A cluster flips from not ready to ready only after it has been observed
//! healthy for the success threshold, and from ready to not ready only after
//! it has been observed unhealthy for the failure threshold.

use crds::Condition;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct ObservedState {
    status: String,
    threshold_start: Instant,
}

/// Last observed Ready status per cluster and when it was first seen.
#[derive(Debug)]
pub struct ConditionCache {
    success_threshold: Duration,
    failure_threshold: Duration,
    states: Mutex<HashMap<String, ObservedState>>,
}

impl ConditionCache {
    /// Creates a cache with the given thresholds.
    pub fn new(success_threshold: Duration, failure_threshold: Duration) -> Self {
        Self {
            success_threshold,
            failure_threshold,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// The Ready condition to publish given the observed one.
    ///
    /// `current` is the Ready condition currently on the Cluster status.
    pub fn threshold_adjusted(
        &self,
        cluster: &str,
        current: Option<&Condition>,
        observed: Condition,
        now: Instant,
    ) -> Condition {
        let mut states = match self.states.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let Some(saved) = states.get_mut(cluster) else {
            states.insert(
                cluster.to_string(),
                ObservedState { status: observed.status.clone(), threshold_start: now },
            );
            return observed;
        };

        let Some(current) = current else {
            return observed;
        };

        if saved.status != observed.status {
            *saved = ObservedState { status: observed.status.clone(), threshold_start: now };
        }

        let threshold = if observed.is_true() { self.success_threshold } else { self.failure_threshold };
        let flips = observed.is_true() != current.is_true();
        if flips && now < saved.threshold_start + threshold {
            return current.clone();
        }
        observed
    }

    /// Forgets `cluster`.
    pub fn delete(&self, cluster: &str) {
        if let Ok(mut states) = self.states.lock() {
            states.remove(cluster);
        }
    }
}
