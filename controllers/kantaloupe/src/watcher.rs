//! Controller runner.
//!
//! Every reconciler in the manager, on the hub or on a member, is driven by
//! `kube_runtime::Controller` through [`run_controller`]. The runner owns the
//! shared error policy: errors are classified by [`ControllerError::kind`],
//! transient ones back off per object with a Fibonacci schedule and invalid
//! objects wait for the next change.

use crate::backoff::BackoffTracker;
use crate::error::{ControllerError, ErrorKind};
use crate::metrics::{Metrics, RESULT_ERROR, RESULT_SUCCESS};
use crate::reconcile_helpers::object_key;
use futures::StreamExt;
use kube::Resource;
use kube_runtime::Controller;
use kube_runtime::controller::{Action, Config as ControllerConfig};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const BACKOFF_MIN_SECONDS: u64 = 1;
const BACKOFF_MAX_SECONDS: u64 = 300;

/// How a controller is run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Name used in logs and metrics
    pub name: &'static str,
    /// Maximum concurrent reconciles
    pub concurrency: u16,
    /// Stops the controller when cancelled
    pub shutdown: CancellationToken,
    pub metrics: Metrics,
}

/// Context handed to the wrapped reconcile and error policy.
struct RunContext<C> {
    inner: Arc<C>,
    name: &'static str,
    backoff: BackoffTracker,
    metrics: Metrics,
}

/// Requeue decision for a failed reconcile.
fn error_action(kind: ErrorKind, backoff: &BackoffTracker, key: &str) -> Action {
    match kind {
        ErrorKind::Invalid | ErrorKind::NotFound => Action::await_change(),
        ErrorKind::Conflict => Action::requeue(Duration::from_secs(BACKOFF_MIN_SECONDS)),
        ErrorKind::Transient | ErrorKind::Fatal => Action::requeue(backoff.next_delay(key)),
    }
}

/// Runs `controller` until it ends or `opts.shutdown` is cancelled.
pub async fn run_controller<K, C, F, Fut>(controller: Controller<K>, ctx: Arc<C>, reconcile_fn: F, opts: RunOptions)
where
    K: Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Debug + Unpin,
    C: Send + Sync + 'static,
    F: Fn(Arc<K>, Arc<C>) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Result<Action, ControllerError>> + Send + 'static,
{
    let name = opts.name;
    info!("Starting {} controller", name);

    let run_ctx = Arc::new(RunContext {
        inner: ctx,
        name,
        backoff: BackoffTracker::new(BACKOFF_MIN_SECONDS, BACKOFF_MAX_SECONDS),
        metrics: opts.metrics.clone(),
    });

    let reconcile = move |obj: Arc<K>, ctx: Arc<RunContext<C>>| {
        let reconcile_fn = reconcile_fn.clone();
        async move {
            let key = object_key(obj.as_ref());
            debug!("Reconciling {} {}", ctx.name, key);
            match reconcile_fn(obj, Arc::clone(&ctx.inner)).await {
                Ok(action) => {
                    ctx.backoff.reset(&key);
                    ctx.metrics.record_reconcile(ctx.name, RESULT_SUCCESS);
                    Ok(action)
                }
                Err(e) => {
                    ctx.metrics.record_reconcile(ctx.name, RESULT_ERROR);
                    Err(e)
                }
            }
        }
    };

    let error_policy = |obj: Arc<K>, err: &ControllerError, ctx: Arc<RunContext<C>>| {
        let key = object_key(obj.as_ref());
        let kind = err.kind();
        let action = error_action(kind, &ctx.backoff, &key);
        match kind {
            ErrorKind::Invalid => warn!("Invalid {} {}: {}", ctx.name, key, err),
            ErrorKind::NotFound => debug!("{} {} dependency not found: {}", ctx.name, key, err),
            _ => error!(
                failures = ctx.backoff.error_count(&key),
                "Reconciliation failed for {} {}: {}", ctx.name, key, err
            ),
        }
        action
    };

    let run = controller
        .with_config(ControllerConfig::default().concurrency(opts.concurrency))
        .run(reconcile, error_policy, run_ctx)
        .for_each(|res| async move {
            if let Err(e) = res {
                debug!("{} controller event: {}", name, e);
            }
        });

    tokio::select! {
        () = run => warn!("{} controller stream ended", name),
        () = opts.shutdown.cancelled() => info!("{} controller stopped", name),
    }
}
