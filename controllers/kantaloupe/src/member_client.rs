//! Clients for member clusters.
//!
//! A member is reached with the kubeconfig stored under `config` in the
//! secret its Cluster references. Clients are cached per cluster and rebuilt
//! when the kubeconfig text changes.

use crate::error::ControllerError;
use crds::Cluster;
use crds::well_known::KUBECONFIG_SECRET_KEY;
use k8s_openapi::api::core::v1::Secret;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config, ResourceExt};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// Builds a client from kubeconfig text.
///
/// `accept_invalid_certs` disables server certificate verification and is
/// only used by the kubeconfig validity probe.
pub async fn build_client(
    kubeconfig: &str,
    timeout: Duration,
    accept_invalid_certs: bool,
) -> Result<Client, ControllerError> {
    let kubeconfig = Kubeconfig::from_yaml(kubeconfig)?;
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
    config.connect_timeout = Some(timeout);
    config.read_timeout = Some(timeout);
    config.write_timeout = Some(timeout);
    config.accept_invalid_certs = accept_invalid_certs;
    Ok(Client::try_from(config)?)
}

/// A client handed out by the factory.
#[derive(Clone)]
pub struct MemberClient {
    /// Client bound to the member API server
    pub client: Client,
    /// True when the client was just (re)built
    pub fresh: bool,
}

/// Builds and caches member clients from Cluster secret references.
pub struct MemberClientFactory {
    hub: Client,
    namespace: String,
    timeout: Duration,
    cache: Mutex<HashMap<String, (String, Client)>>,
}

impl std::fmt::Debug for MemberClientFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemberClientFactory")
            .field("namespace", &self.namespace)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl MemberClientFactory {
    /// `namespace` is used for secret references that omit one.
    pub fn new(hub: Client, namespace: String, timeout: Duration) -> Self {
        Self {
            hub,
            namespace,
            timeout,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Reads the kubeconfig text referenced by `cluster`.
    pub async fn kubeconfig(&self, cluster: &Cluster) -> Result<String, ControllerError> {
        let secret_ref = cluster.spec.secret_ref.as_ref().ok_or_else(|| {
            ControllerError::InvalidConfig(format!("cluster {} does not have a secret", cluster.name_any()))
        })?;
        let namespace = secret_ref.namespace.as_deref().unwrap_or(&self.namespace);
        let secrets: Api<Secret> = Api::namespaced(self.hub.clone(), namespace);
        let secret = secrets.get(&secret_ref.name).await?;
        kubeconfig_from_secret(&secret)
    }

    /// Client of `cluster`, reused while its kubeconfig is unchanged.
    pub async fn client_for(&self, cluster: &Cluster) -> Result<MemberClient, ControllerError> {
        let name = cluster.name_any();
        let kubeconfig = self.kubeconfig(cluster).await?;

        if let Ok(cache) = self.cache.lock() {
            if let Some((cached_config, client)) = cache.get(&name) {
                if *cached_config == kubeconfig {
                    return Ok(MemberClient { client: client.clone(), fresh: false });
                }
            }
        }

        debug!("Building client for cluster {}", name);
        let client = build_client(&kubeconfig, self.timeout, false).await?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(name, (kubeconfig, client.clone()));
        }
        Ok(MemberClient { client, fresh: true })
    }

    /// Drops the cached client of `cluster`.
    pub fn invalidate(&self, cluster: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(cluster);
        }
    }
}

/// Extracts the kubeconfig text from a cluster secret.
pub fn kubeconfig_from_secret(secret: &Secret) -> Result<String, ControllerError> {
    let data = secret
        .data
        .as_ref()
        .and_then(|d| d.get(KUBECONFIG_SECRET_KEY))
        .filter(|v| !v.0.is_empty())
        .ok_or_else(|| ControllerError::InvalidConfig("the secret data is empty".to_string()))?;
    String::from_utf8(data.0.clone())
        .map_err(|e| ControllerError::InvalidConfig(format!("kubeconfig in secret {} is not utf-8: {e}", secret.name_any())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    #[test]
    fn test_kubeconfig_from_secret() {
        let mut secret = Secret::default();
        assert!(matches!(kubeconfig_from_secret(&secret), Err(ControllerError::InvalidConfig(m)) if m == "the secret data is empty"));

        secret.data = Some(BTreeMap::from([(KUBECONFIG_SECRET_KEY.to_string(), ByteString(b"apiVersion: v1".to_vec()))]));
        assert_eq!(kubeconfig_from_secret(&secret).unwrap(), "apiVersion: v1");
    }

    #[tokio::test]
    async fn test_build_client_rejects_garbage() {
        assert!(build_client("not: [a kubeconfig", Duration::from_secs(1), false).await.is_err());
    }

    #[tokio::test]
    async fn test_build_client_from_token_kubeconfig() {
        let client = build_client(crate::test_utils::TEST_KUBECONFIG, Duration::from_secs(1), true).await;
        assert!(client.is_ok());
    }
}
