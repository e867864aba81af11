//! Controller manager.
//!
//! Wires the hub-side components together and runs them until a shutdown
//! signal arrives:
//! - the cluster status controller
//! - the member controller supervisor
//! - hub self-registration as `local-cluster`
//! - federated scrape config sync
//! - the probe and metrics server

use crate::cluster::kubeconfig::{ApiServerProbe, TokenCache};
use crate::cluster::self_register::SelfRegistration;
use crate::cluster::{self, ClusterStatusContext, scrape_config};
use crate::config::Options;
use crate::error::ControllerError;
use crate::informer_manager::InformerManager;
use crate::member_client::MemberClientFactory;
use crate::metrics::Metrics;
use crate::periodic::run_every;
use crate::server::{self, Readiness};
use crate::supervisor::{self, Supervisor};
use crate::watcher::RunOptions;
use kube::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const SELF_REGISTER_PERIOD: Duration = Duration::from_secs(10);
const SCRAPE_CONFIG_PERIOD: Duration = Duration::from_secs(15);

/// Main controller manager.
pub struct Controller {
    options: Arc<Options>,
    hub: Client,
    metrics: Metrics,
    readiness: Readiness,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("namespace", &self.options.namespace)
            .field("multi_controllers", &self.options.multi_controllers)
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Creates the manager against the in-cluster (or local) hub.
    pub async fn new(options: Options) -> Result<Self, ControllerError> {
        info!("Initializing Kantaloupe controller manager");
        let hub = Client::try_default().await?;
        let metrics = Metrics::new()?;
        Ok(Self {
            options: Arc::new(options),
            hub,
            metrics,
            readiness: Readiness::default(),
            shutdown: CancellationToken::new(),
        })
    }

    fn run_options(&self, name: &'static str) -> RunOptions {
        RunOptions {
            name,
            concurrency: self.options.concurrent_work_syncs,
            shutdown: self.shutdown.clone(),
            metrics: self.metrics.clone(),
        }
    }

    /// Runs every component until SIGINT or SIGTERM.
    pub async fn run(self) -> Result<(), ControllerError> {
        let clients = Arc::new(MemberClientFactory::new(
            self.hub.clone(),
            self.options.namespace.clone(),
            self.options.cluster_api_timeout,
        ));
        let informers = Arc::new(InformerManager::new());

        let server = tokio::spawn(server::serve(
            self.options.health_probe_bind_address,
            self.metrics.clone(),
            self.readiness.clone(),
            self.shutdown.clone(),
        ));

        let cluster_status = {
            let ctx = Arc::new(ClusterStatusContext::new(
                self.hub.clone(),
                Arc::clone(&self.options),
                Arc::clone(&clients),
                informers,
            ));
            tokio::spawn(cluster::run(ctx, self.run_options("cluster-status")))
        };

        let supervisor = {
            let (supervisor, requeue) = Supervisor::new(
                self.hub.clone(),
                Arc::clone(&self.options),
                clients,
                self.metrics.clone(),
                self.shutdown.clone(),
            );
            tokio::spawn(supervisor::run(supervisor, requeue, self.run_options("member-supervisor")))
        };

        let self_register = {
            let registration = SelfRegistration::new(
                self.hub.clone(),
                self.options.namespace.clone(),
                self.options.gateway.endpoint.clone(),
                self.options.debug_mode,
                Arc::new(TokenCache::new()),
                Arc::new(ApiServerProbe),
            );
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                run_every("self-register", SELF_REGISTER_PERIOD, shutdown, || registration.sync()).await;
            })
        };

        let scrape_configs = {
            let hub = self.hub.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                run_every("scrape-config", SCRAPE_CONFIG_PERIOD, shutdown, || scrape_config::sync_all(&hub)).await;
            })
        };

        self.readiness.set_ready();
        info!("Controller manager started");

        tokio::select! {
            () = shutdown_signal() => info!("Shutdown signal received"),
            () = self.shutdown.cancelled() => {}
        }
        self.shutdown.cancel();

        for (name, handle) in [
            ("cluster-status", cluster_status),
            ("member-supervisor", supervisor),
            ("self-register", self_register),
            ("scrape-config", scrape_configs),
        ] {
            if let Err(e) = handle.await {
                error!("{} task panicked: {}", name, e);
            }
        }
        join_server(server).await
    }
}

async fn join_server(handle: JoinHandle<Result<(), ControllerError>>) -> Result<(), ControllerError> {
    match handle.await {
        Ok(result) => result,
        Err(e) => {
            warn!("Probe server task ended abnormally: {}", e);
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
