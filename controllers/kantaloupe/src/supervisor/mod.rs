//! Member controller supervisor.
//!
//! Watches Clusters on the hub and keeps one set of member controllers
//! running per Ready cluster. A set is started with a fresh member client
//! and port allocator, restarted when the cluster's secret reference
//! changes, and stopped when the cluster goes away or stops being Ready.
//! A cluster that is deleted or gone also gets its controllers' cleanups run.
//!
//! A set that dies on its own removes itself and requeues every Cluster, so
//! the next reconcile starts it again.

pub mod crd_sync;
pub mod member_manager;
pub mod registry;

use crate::config::Options;
use crate::error::ControllerError;
use crate::member::MemberContext;
use crate::member_client::MemberClientFactory;
use crate::metrics::Metrics;
use crate::port_allocator::PortAllocator;
use crate::reconcile_helpers::{ensure_finalizer, is_deleting, remove_finalizer};
use crate::watcher::{RunOptions, run_controller};
use crds::well_known::MULTI_CLUSTER_FINALIZER;
use crds::{Cluster, Gateway, LocalSecretReference, TCPRoute};
use futures::channel::mpsc;
use kube::{Api, Client, ResourceExt};
use kube_runtime::Controller;
use kube_runtime::controller::Action;
use kube_runtime::watcher::Config;
use member_manager::Cleanup;
use registry::MemberControllerKind;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const START_RETRY: Duration = Duration::from_secs(10);
const STOP_TIMEOUT: Duration = Duration::from_secs(30);

type Cleanups = Vec<(MemberControllerKind, Cleanup)>;

struct MemberEntry {
    cancel: CancellationToken,
    secret_ref: LocalSecretReference,
    handle: JoinHandle<()>,
    generation: u64,
    cleanups: Cleanups,
}

/// Owns the running member controller sets.
pub struct Supervisor {
    hub: Client,
    options: Arc<Options>,
    clients: Arc<MemberClientFactory>,
    metrics: Metrics,
    shutdown: CancellationToken,
    entries: Mutex<HashMap<String, MemberEntry>>,
    /// Cleanups of retired members that have not succeeded yet
    pending_cleanups: Mutex<HashMap<String, Cleanups>>,
    generation: AtomicU64,
    requeue: mpsc::UnboundedSender<()>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("members", &self.members())
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Creates the supervisor and the receiver that requeues every Cluster.
    pub fn new(
        hub: Client,
        options: Arc<Options>,
        clients: Arc<MemberClientFactory>,
        metrics: Metrics,
        shutdown: CancellationToken,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<()>) {
        let (requeue, requeue_rx) = mpsc::unbounded();
        let supervisor = Arc::new(Self {
            hub,
            options,
            clients,
            metrics,
            shutdown,
            entries: Mutex::new(HashMap::new()),
            pending_cleanups: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            requeue,
        });
        (supervisor, requeue_rx)
    }

    /// Names of members with running controllers.
    pub fn members(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.lock().map(|e| e.keys().cloned().collect()).unwrap_or_default();
        names.sort();
        names
    }

    fn running_secret(&self, cluster: &str) -> Option<LocalSecretReference> {
        self.entries.lock().ok()?.get(cluster).map(|e| e.secret_ref.clone())
    }

    fn update_gauge(&self) {
        let n = self.entries.lock().map(|e| e.len()).unwrap_or_default();
        self.metrics.set_member_managers(n);
    }

    /// Stops the controllers of `cluster`, waiting a bounded time for them.
    ///
    /// Returns the cleanups of the stopped controllers.
    pub async fn stop(&self, cluster: &str) -> Cleanups {
        let entry = self.entries.lock().ok().and_then(|mut e| e.remove(cluster));
        let Some(entry) = entry else {
            return Vec::new();
        };
        info!("Stopping controllers for cluster {}", cluster);
        entry.cancel.cancel();
        if tokio::time::timeout(STOP_TIMEOUT, entry.handle).await.is_err() {
            warn!("Controllers for cluster {} did not stop within {:?}", cluster, STOP_TIMEOUT);
        }
        self.clients.invalidate(cluster);
        self.update_gauge();
        entry.cleanups
    }

    /// Stops the controllers of a departing `cluster`, then runs their cleanups.
    ///
    /// Cleanups run once the controllers are down so nothing undoes them. A
    /// failed cleanup is kept and retried by the next call.
    pub async fn retire(&self, cluster: &str) -> Result<(), ControllerError> {
        let stopped = self.stop(cluster).await;
        let cleanups = match self.pending_cleanups.lock() {
            Ok(mut pending) => {
                let cleanups = pending.entry(cluster.to_string()).or_default();
                cleanups.extend(stopped);
                cleanups.clone()
            }
            Err(_) => stopped,
        };

        for (kind, cleanup) in &cleanups {
            info!("Running {} cleanup for cluster {}", kind, cluster);
            if let Err(e) = cleanup().await {
                error!("{} cleanup for cluster {} failed: {}", kind, cluster, e);
                return Err(e);
            }
        }
        if let Ok(mut pending) = self.pending_cleanups.lock() {
            pending.remove(cluster);
        }
        Ok(())
    }

    /// Stops every member.
    pub async fn stop_all(&self) {
        for cluster in self.members() {
            self.stop(&cluster).await;
        }
    }

    fn run_options(&self, kind: MemberControllerKind, shutdown: CancellationToken) -> RunOptions {
        RunOptions {
            name: kind.name(),
            concurrency: self.options.concurrent_work_syncs,
            shutdown,
            metrics: self.metrics.clone(),
        }
    }

    async fn start(self: &Arc<Self>, cluster: &Cluster, secret_ref: LocalSecretReference) -> Result<Action, ControllerError> {
        let name = cluster.name_any();
        let member = match self.clients.client_for(cluster).await {
            Ok(member) => member.client,
            Err(e) => {
                warn!("Failed to build client for cluster {}: {}", name, e);
                return Ok(Action::requeue(START_RETRY));
            }
        };

        crd_sync::sync_flow_crd(&self.hub, &member, &name).await?;

        let gateway = &self.options.gateway;
        let ports = PortAllocator::new(gateway.port_start, gateway.port_count)?;
        ports
            .start(
                &Api::<TCPRoute>::all(member.clone()),
                &Api::<Gateway>::namespaced(member.clone(), &self.options.namespace),
            )
            .await?;

        let ctx = Arc::new(MemberContext {
            cluster: name.clone(),
            hub: self.hub.clone(),
            client: member,
            namespace: self.options.namespace.clone(),
            gateway: gateway.clone(),
            flow: self.options.flow.clone(),
            ports: Arc::new(ports),
            prometheus_address: cluster.spec.prometheus_address.clone(),
        });

        if let Ok(mut pending) = self.pending_cleanups.lock() {
            pending.remove(&name);
        }

        let cancel = self.shutdown.child_token();
        let mut controllers = Vec::new();
        let mut cleanups = Vec::new();
        for kind in MemberControllerKind::enabled(&self.options.multi_controllers) {
            match member_manager::init(kind, Arc::clone(&ctx), self.run_options(kind, cancel.clone())) {
                Ok(mut controller) => {
                    if let Some(cleanup) = controller.cleanup.take() {
                        cleanups.push((kind, cleanup));
                    }
                    controllers.push(controller);
                }
                Err(e) => {
                    warn!("Failed to initialise {} for cluster {}: {}", kind, name, e);
                    return Ok(Action::requeue(START_RETRY));
                }
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        {
            let Ok(mut entries) = self.entries.lock() else {
                return Err(ControllerError::ManagerStart(format!("supervisor state poisoned while starting {name}")));
            };
            if entries.contains_key(&name) {
                debug!("Controllers for cluster {} started concurrently", name);
                return Ok(Action::await_change());
            }

            let supervisor = Arc::clone(self);
            let token = cancel.clone();
            let cluster_name = name.clone();
            let handle = tokio::spawn(async move {
                if let Err(e) = member_manager::run(&cluster_name, controllers, token).await {
                    error!("Controllers for cluster {} failed: {}", cluster_name, e);
                    supervisor.forget(&cluster_name, generation);
                    let _ = supervisor.requeue.unbounded_send(());
                }
            });
            entries.insert(
                name.clone(),
                MemberEntry {
                    cancel,
                    secret_ref,
                    handle,
                    generation,
                    cleanups,
                },
            );
        }

        info!("Started controllers for cluster {}", name);
        self.update_gauge();
        Ok(Action::await_change())
    }

    /// Drops the entry of a set that died, unless it was already replaced.
    fn forget(&self, cluster: &str, generation: u64) {
        if let Ok(mut entries) = self.entries.lock() {
            if entries.get(cluster).is_some_and(|e| e.generation == generation) {
                entries.remove(cluster);
            }
        }
        self.update_gauge();
    }
}

/// Runs the supervisor until shutdown, then stops every member.
pub async fn run(supervisor: Arc<Supervisor>, requeue: mpsc::UnboundedReceiver<()>, opts: RunOptions) {
    let clusters: Api<Cluster> = Api::all(supervisor.hub.clone());
    let controller = Controller::new(clusters, Config::default()).reconcile_all_on(requeue);
    run_controller(controller, Arc::clone(&supervisor), reconcile, opts).await;
    supervisor.stop_all().await;
}

async fn reconcile(cluster: Arc<Cluster>, supervisor: Arc<Supervisor>) -> Result<Action, ControllerError> {
    let name = cluster.name_any();
    let api: Api<Cluster> = Api::all(supervisor.hub.clone());
    let Some(cluster) = api.get_opt(&name).await? else {
        if let Err(e) = supervisor.retire(&name).await {
            warn!("Cleanup of removed cluster {} did not finish: {}", name, e);
        }
        return Ok(Action::await_change());
    };

    if is_deleting(&cluster) {
        supervisor.retire(&name).await?;
        remove_finalizer(&api, &cluster, MULTI_CLUSTER_FINALIZER).await?;
        return Ok(Action::await_change());
    }

    let Some(secret_ref) = cluster.spec.secret_ref.clone() else {
        return Ok(Action::await_change());
    };

    if !cluster.is_ready() {
        if supervisor.running_secret(&name).is_some() {
            info!("Cluster {} is not ready", name);
            supervisor.stop(&name).await;
        }
        return Ok(Action::await_change());
    }

    ensure_finalizer(&api, &cluster, MULTI_CLUSTER_FINALIZER).await?;
    match supervisor.running_secret(&name) {
        Some(running) if running == secret_ref => return Ok(Action::await_change()),
        Some(_) => {
            info!("Secret reference of cluster {} changed, restarting its controllers", name);
            supervisor.stop(&name).await;
        }
        None => {}
    }
    supervisor.start(&cluster, secret_ref).await
}
