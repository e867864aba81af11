//! Per-cluster informer caches.
//!
//! The cluster status controller reads nodes, pods and namespaces of every
//! member from reflector stores instead of listing them on each reconcile.
//! Stores are registered lazily per resource, trimmed by the transforms in
//! [`crate::transform`] and torn down together when a cluster goes away.

use crate::error::ControllerError;
use crate::transform;
use futures::StreamExt;
use kube::api::{ApiResource, DynamicObject};
use kube::{Api, Client, Resource};
use kube_runtime::reflector::{store::Writer, Store};
use kube_runtime::watcher;
use kube_runtime::WatchStreamExt;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

fn resource_key(ar: &ApiResource) -> String {
    format!("{}/{}/{}", ar.group, ar.version, ar.plural)
}

struct Informer {
    store: Store<DynamicObject>,
    synced: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Informers of a single cluster sharing one client.
pub struct ClusterInformers {
    cluster: String,
    client: Client,
    cancel: CancellationToken,
    informers: Mutex<HashMap<String, Informer>>,
}

impl std::fmt::Debug for ClusterInformers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterInformers").field("cluster", &self.cluster).finish_non_exhaustive()
    }
}

impl ClusterInformers {
    fn new(cluster: &str, client: Client) -> Self {
        Self {
            cluster: cluster.to_string(),
            client,
            cancel: CancellationToken::new(),
            informers: Mutex::new(HashMap::new()),
        }
    }

    /// Client the informers watch with.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Registers informers for `resources` so they start filling.
    pub fn start(&self, resources: &[ApiResource]) {
        for ar in resources {
            self.lister(ar);
        }
    }

    /// Store for `ar`, registering and starting its informer on first use.
    pub fn lister(&self, ar: &ApiResource) -> Store<DynamicObject> {
        let key = resource_key(ar);
        let mut informers = match self.informers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(informer) = informers.get(&key) {
            return informer.store.clone();
        }

        debug!("Starting informer {} for cluster {}", key, self.cluster);
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), ar);
        let writer = Writer::new(ar.clone());
        let store = writer.as_reader();
        let synced = Arc::new(AtomicBool::new(false));

        let stream = watcher(api, watcher::Config::default())
            .default_backoff()
            .modify(transform::for_resource(ar))
            .reflect(writer);

        let flag = Arc::clone(&synced);
        let cancel = self.cancel.clone();
        let cluster = self.cluster.clone();
        let name = key.clone();
        let handle = tokio::spawn(async move {
            let mut stream = std::pin::pin!(stream);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = stream.next() => match event {
                        Some(Ok(watcher::Event::InitDone)) => flag.store(true, Ordering::SeqCst),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => warn!("Informer {} of cluster {} failed: {}", name, cluster, e),
                        None => break,
                    },
                }
            }
            debug!("Informer {} of cluster {} stopped", name, cluster);
        });

        informers.insert(key, Informer { store: store.clone(), synced, handle });
        store
    }

    /// Whether the informer for `ar` finished its initial list.
    pub fn is_synced(&self, ar: &ApiResource) -> bool {
        self.informers
            .lock()
            .ok()
            .and_then(|i| i.get(&resource_key(ar)).map(|inf| inf.synced.load(Ordering::SeqCst)))
            .unwrap_or(false)
    }

    /// Waits until every registered informer has synced.
    pub async fn wait_for_cache_sync(&self, timeout: Duration) -> Result<(), ControllerError> {
        let stores: Vec<(String, Store<DynamicObject>)> = match self.informers.lock() {
            Ok(informers) => informers.iter().map(|(k, i)| (k.clone(), i.store.clone())).collect(),
            Err(_) => return Err(ControllerError::CacheSync(format!("informers of {} are poisoned", self.cluster))),
        };
        let wait = futures::future::join_all(stores.iter().map(|(_, s)| s.wait_until_ready()));
        let results = tokio::time::timeout(timeout, wait).await.map_err(|_| {
            ControllerError::CacheSync(format!("informers of cluster {} did not sync within {:?}", self.cluster, timeout))
        })?;
        for ((key, _), result) in stores.iter().zip(results) {
            if result.is_err() {
                return Err(ControllerError::CacheSync(format!("informer {key} of cluster {} stopped", self.cluster)));
            }
        }
        Ok(())
    }

    /// Typed snapshot of the store holding `K`.
    pub fn list<K>(&self) -> Vec<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let ar = ApiResource::erase::<K>(&());
        self.lister(&ar)
            .state()
            .into_iter()
            .filter_map(|obj| match (*obj).clone().try_parse::<K>() {
                Ok(parsed) => Some(parsed),
                Err(e) => {
                    warn!("Skipping unparseable {} in cache of {}: {}", ar.kind, self.cluster, e);
                    None
                }
            })
            .collect()
    }

    /// Typed lookup of a cluster-scoped object by name.
    pub fn get<K>(&self, name: &str) -> Option<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let ar = ApiResource::erase::<K>(&());
        self.lister(&ar)
            .state()
            .into_iter()
            .find(|obj| obj.metadata.name.as_deref() == Some(name))
            .and_then(|obj| (*obj).clone().try_parse::<K>().ok())
    }

    fn stop(&self) {
        self.cancel.cancel();
        if let Ok(mut informers) = self.informers.lock() {
            for (_, informer) in informers.drain() {
                informer.handle.abort();
            }
        }
    }
}

/// Informers of every known cluster, keyed by cluster name.
#[derive(Debug, Default)]
pub struct InformerManager {
    clusters: Mutex<HashMap<String, Arc<ClusterInformers>>>,
}

impl InformerManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Informers of `cluster`, created with `client` when absent.
    pub fn for_cluster(&self, cluster: &str, client: Client) -> Arc<ClusterInformers> {
        let mut clusters = match self.clusters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(
            clusters
                .entry(cluster.to_string())
                .or_insert_with(|| {
                    info!("Registering informers for cluster {}", cluster);
                    Arc::new(ClusterInformers::new(cluster, client))
                }),
        )
    }

    /// Informers of `cluster` when registered.
    pub fn get(&self, cluster: &str) -> Option<Arc<ClusterInformers>> {
        self.clusters.lock().ok().and_then(|c| c.get(cluster).cloned())
    }

    /// Stops and forgets the informers of `cluster`. Safe to call repeatedly.
    pub fn stop(&self, cluster: &str) {
        let removed = self.clusters.lock().ok().and_then(|mut c| c.remove(cluster));
        if let Some(informers) = removed {
            info!("Stopping informers for cluster {}", cluster);
            informers.stop();
        }
    }

    /// Whether `cluster` has registered informers.
    pub fn is_registered(&self, cluster: &str) -> bool {
        self.clusters.lock().map(|c| c.contains_key(cluster)).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::unreachable_client;
    use k8s_openapi::api::core::v1::Node;

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let manager = InformerManager::new();
        let informers = manager.for_cluster("member-1", unreachable_client());
        informers.start(&[ApiResource::erase::<Node>(&())]);
        assert!(manager.is_registered("member-1"));

        manager.stop("member-1");
        manager.stop("member-1");
        assert!(!manager.is_registered("member-1"));
        assert!(manager.get("member-1").is_none());
    }

    #[tokio::test]
    async fn test_lister_is_shared_per_resource() {
        let manager = InformerManager::new();
        let informers = manager.for_cluster("member-1", unreachable_client());
        let ar = ApiResource::erase::<Node>(&());
        informers.lister(&ar);
        informers.lister(&ar);
        assert_eq!(informers.informers.lock().unwrap().len(), 1);
        assert!(!informers.is_synced(&ar));
        assert!(informers.list::<Node>().is_empty());
        manager.stop("member-1");
    }

    #[tokio::test]
    async fn test_wait_for_cache_sync_times_out() {
        let manager = InformerManager::new();
        let informers = manager.for_cluster("member-1", unreachable_client());
        informers.start(&[ApiResource::erase::<Node>(&())]);
        let result = informers.wait_for_cache_sync(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(ControllerError::CacheSync(_))));
        manager.stop("member-1");
    }
}
