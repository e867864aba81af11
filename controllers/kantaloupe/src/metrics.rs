//! Prometheus metrics exported on `/metrics`.

use crate::error::ControllerError;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Reconcile outcome label for successful runs.
pub const RESULT_SUCCESS: &str = "success";
/// Reconcile outcome label for failed runs.
pub const RESULT_ERROR: &str = "error";

/// Controller manager metrics. Cheap to clone; all handles share the registry.
#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    reconcile_total: IntCounterVec,
    member_managers: IntGauge,
}

impl Metrics {
    /// Registers the manager metrics in a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let reconcile_total = IntCounterVec::new(
            Opts::new("kantaloupe_reconcile_total", "Reconciles by controller and result"),
            &["controller", "result"],
        )?;
        let member_managers = IntGauge::new("kantaloupe_member_managers", "Running member controller managers")?;
        registry.register(Box::new(reconcile_total.clone()))?;
        registry.register(Box::new(member_managers.clone()))?;
        Ok(Self {
            registry,
            reconcile_total,
            member_managers,
        })
    }

    /// Counts one reconcile of `controller`.
    pub fn record_reconcile(&self, controller: &str, result: &str) {
        self.reconcile_total.with_label_values(&[controller, result]).inc();
    }

    /// Publishes the number of running member managers.
    pub fn set_member_managers(&self, n: usize) {
        self.member_managers.set(i64::try_from(n).unwrap_or(i64::MAX));
    }

    /// Renders the registry in the text exposition format.
    pub fn encode(&self) -> Result<String, ControllerError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    #[cfg(test)]
    pub(crate) fn reconcile_count(&self, controller: &str, result: &str) -> u64 {
        self.reconcile_total.with_label_values(&[controller, result]).get()
    }
}
