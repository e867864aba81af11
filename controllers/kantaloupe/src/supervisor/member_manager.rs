//! The set of controllers running against one member cluster.

use super::registry::MemberControllerKind;
use crate::error::ControllerError;
use crate::member::inactive_cleanup::InactiveCollector;
use crate::member::{MemberContext, deployment_status, flow, gateway_section, gpumem_pod, restart_device_plugin};
use crate::watcher::RunOptions;
use futures::FutureExt;
use futures::future::{BoxFuture, select_all};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Work a controller leaves behind when its member is deregistered.
///
/// Called after the controllers have stopped, and again on the next
/// reconcile if it fails.
pub type Cleanup = Arc<dyn Fn() -> BoxFuture<'static, Result<(), ControllerError>> + Send + Sync>;

/// A started member controller.
pub struct MemberController {
    pub kind: MemberControllerKind,
    /// Resolves when the controller stops
    pub run: BoxFuture<'static, ()>,
    pub cleanup: Option<Cleanup>,
}

impl std::fmt::Debug for MemberController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemberController")
            .field("kind", &self.kind)
            .field("cleanup", &self.cleanup.is_some())
            .finish_non_exhaustive()
    }
}

/// Prepares `kind` to run against the member described by `ctx`.
///
/// Controllers stop when `opts.shutdown` is cancelled.
pub fn init(kind: MemberControllerKind, ctx: Arc<MemberContext>, opts: RunOptions) -> Result<MemberController, ControllerError> {
    let cleanup: Option<Cleanup> = match kind {
        MemberControllerKind::GatewaySection => {
            let ctx = Arc::clone(&ctx);
            let cleanup: Cleanup = Arc::new(move || gateway_section::release_routes(Arc::clone(&ctx)).boxed());
            Some(cleanup)
        }
        _ => None,
    };
    let run = match kind {
        MemberControllerKind::Flow => flow::run(ctx, opts).boxed(),
        MemberControllerKind::FlowDeployment => deployment_status::run(ctx, opts).boxed(),
        MemberControllerKind::RestartDevicePlugin => restart_device_plugin::run(ctx, opts).boxed(),
        MemberControllerKind::CleanupInactiveWorkload => InactiveCollector::init(ctx)?.run(opts.shutdown).boxed(),
        MemberControllerKind::PodGpuMemScale => gpumem_pod::run(ctx, opts).boxed(),
        MemberControllerKind::GatewaySection => gateway_section::run(ctx, opts).boxed(),
    };
    Ok(MemberController { kind, run, cleanup })
}

/// Runs the controllers of `cluster` until `shutdown` is cancelled.
///
/// Any controller ending on its own is reported as an error so the
/// supervisor can start the member over.
pub async fn run(cluster: &str, controllers: Vec<MemberController>, shutdown: CancellationToken) -> Result<(), ControllerError> {
    if controllers.is_empty() {
        shutdown.cancelled().await;
        return Ok(());
    }

    info!("Running {} controllers for cluster {}", controllers.len(), cluster);
    let (kinds, runs): (Vec<_>, Vec<_>) = controllers.into_iter().map(|c| (c.kind, c.run)).unzip();
    let ((), index, _) = select_all(runs).await;
    if shutdown.is_cancelled() {
        info!("Stopped controllers for cluster {}", cluster);
        return Ok(());
    }
    error!("Controller {} for cluster {} exited", kinds[index], cluster);
    Err(ControllerError::ManagerStart(format!("controller {} for cluster {cluster} exited", kinds[index])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn controller(kind: MemberControllerKind, run: impl std::future::Future<Output = ()> + Send + 'static) -> MemberController {
        MemberController {
            kind,
            run: run.boxed(),
            cleanup: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_reports_unexpected_exit() {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let controllers = vec![
            controller(MemberControllerKind::Flow, async move { token.cancelled().await }),
            controller(MemberControllerKind::GatewaySection, tokio::time::sleep(Duration::from_secs(1))),
        ];

        let err = run("member-1", controllers, shutdown).await.unwrap_err();
        assert!(err.to_string().contains("gatewaysectionControllerController"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let stopper = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            stopper.cancel();
        });
        let controllers = vec![controller(MemberControllerKind::Flow, async move { token.cancelled().await })];
        assert!(run("member-1", controllers, shutdown).await.is_ok());
    }
}
