//! Kantaloupe Controller Manager
//!
//! Hub-side control plane for GPU workloads spread over member clusters:
//! - Cluster: health, resource summaries and kubeconfig plumbing per member
//! - Member controllers: flows, gateway sections, GPU memory scaling,
//!   device plugin restarts and idle workload cleanup
//! - Self-registration of the hub as `local-cluster`

mod backoff;
mod cluster;
mod config;
mod controller;
mod error;
mod informer_manager;
mod member;
mod member_client;
mod metrics;
mod periodic;
mod port_allocator;
mod quantity;
mod reconcile_helpers;
mod server;
mod supervisor;
mod transform;
mod watcher;

#[cfg(test)]
mod test_utils;

use crate::config::Options;
use crate::error::ControllerError;
use controller::Controller;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    // kube's rustls connector needs a process-wide provider
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("rustls crypto provider was already installed");
    }

    let options = Options::from_env()?;

    let level = if options.debug_mode { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();

    info!("Starting Kantaloupe Controller Manager");
    info!("Configuration:");
    info!("  Namespace: {}", options.namespace);
    info!("  Member controllers: {}", options.multi_controllers.join(","));
    info!("  Probe address: {}", options.health_probe_bind_address);
    info!("  Gateway ports: {}+{}", options.gateway.port_start, options.gateway.port_count);

    let controller = Controller::new(options).await?;
    controller.run().await?;

    Ok(())
}
