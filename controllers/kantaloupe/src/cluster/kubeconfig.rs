//! Hub kubeconfig rotation.
//!
//! The hub registers itself with a kubeconfig built from its service account
//! token. Projected tokens rotate, but rewriting the secret on every rotation
//! would restart every consumer of the local cluster, so a new kubeconfig only
//! replaces the stored one when the stored one no longer works.
//!
//! Tokens are never verified: the claims are read from the unverified JWT
//! payload and only drive the caching decision.

use crate::error::ControllerError;
use crate::member_client::build_client;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use k8s_openapi::api::core::v1::Namespace;
use kube::Api;
use kube::config::{AuthInfo, Cluster, Context, Kubeconfig, NamedAuthInfo, NamedCluster, NamedContext};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Name of the cluster, context and user in the hub kubeconfig.
pub const HUB_KUBECONFIG_NAME: &str = "kantaloupe-cluster";

const EXPIRY_TOLERANCE_HOURS: i64 = 24;
const VALIDITY_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Renders the hub kubeconfig for a bearer token.
pub fn hub_kubeconfig(ca_data: &str, server: &str, token: &str) -> Result<String, ControllerError> {
    let name = HUB_KUBECONFIG_NAME.to_string();
    let config = Kubeconfig {
        clusters: vec![NamedCluster {
            name: name.clone(),
            cluster: Some(Cluster {
                server: Some(server.to_string()),
                certificate_authority_data: Some(ca_data.to_string()),
                ..Default::default()
            }),
        }],
        auth_infos: vec![NamedAuthInfo {
            name: name.clone(),
            auth_info: Some(AuthInfo {
                token: Some(SecretString::from(token.trim().to_string())),
                ..Default::default()
            }),
        }],
        contexts: vec![NamedContext {
            name: name.clone(),
            context: Some(Context {
                cluster: name.clone(),
                user: Some(name.clone()),
                ..Default::default()
            }),
        }],
        current_context: Some(name),
        kind: Some("Config".to_string()),
        api_version: Some("v1".to_string()),
        ..Default::default()
    };
    Ok(serde_yaml::to_string(&config)?)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
struct PodClaim {
    #[serde(default)]
    uid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
struct KubernetesClaim {
    #[serde(default)]
    pod: PodClaim,
}

/// Unverified claims of a service account token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TokenClaim {
    /// Expiry, seconds since the epoch
    #[serde(default)]
    pub exp: i64,
    #[serde(default, rename = "kubernetes.io")]
    kubernetes: KubernetesClaim,
}

impl TokenClaim {
    /// UID of the pod the token is bound to.
    pub fn pod_uid(&self) -> &str {
        &self.kubernetes.pod.uid
    }

    fn expires_after(&self, instant: DateTime<Utc>) -> bool {
        self.exp > instant.timestamp()
    }
}

/// Decodes the payload segment of a JWT.
pub fn parse_token_claim(token: &str) -> Option<TokenClaim> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return None;
    }
    let payload = URL_SAFE_NO_PAD.decode(parts[1].trim_end_matches('=')).ok()?;
    serde_json::from_slice(&payload).ok()
}

/// Claims of tokens known to work, keyed by the token.
#[derive(Debug, Default)]
pub struct TokenCache {
    claims: Mutex<HashMap<String, TokenClaim>>,
}

impl TokenCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached claim of `token`.
    pub fn get(&self, token: &str) -> Option<TokenClaim> {
        self.claims.lock().ok().and_then(|c| c.get(token).cloned())
    }

    /// Caches the claim of `token` when it decodes.
    pub fn remember(&self, token: &str) {
        let Some(claim) = parse_token_claim(token) else {
            return;
        };
        if let Ok(mut claims) = self.claims.lock() {
            claims.insert(token.to_string(), claim);
        }
    }
}

fn current_context(config: &Kubeconfig) -> Option<&Context> {
    let current = config.current_context.as_deref()?;
    config.contexts.iter().find(|c| c.name == current)?.context.as_ref()
}

/// Bearer token of the current context's user.
pub fn current_token(config: &Kubeconfig) -> Option<String> {
    let user = current_context(config)?.user.as_deref()?;
    let auth = config.auth_infos.iter().find(|a| a.name == user)?.auth_info.as_ref()?;
    Some(auth.token.as_ref()?.expose_secret().trim().to_string())
}

/// Server URL of the current context's cluster.
pub fn current_server(config: &Kubeconfig) -> Option<String> {
    let cluster = &current_context(config)?.cluster;
    config.clusters.iter().find(|c| &c.name == cluster)?.cluster.as_ref()?.server.clone()
}

fn set_current_server(config: &mut Kubeconfig, server: &str) {
    let Some(name) = current_context(config).map(|c| c.cluster.clone()) else {
        return;
    };
    for entry in config.clusters.iter_mut().filter(|c| c.name == name) {
        if let Some(cluster) = entry.cluster.as_mut() {
            cluster.server = Some(server.to_string());
        }
    }
}

/// Checks whether a kubeconfig can still reach its API server.
#[async_trait]
pub trait KubeconfigProbe: Send + Sync {
    /// Whether `kubeconfig` authenticates against its server.
    async fn is_valid(&self, kubeconfig: &str) -> bool;
}

/// Gets the kube-system namespace with a 3 s budget.
///
/// Server certificate verification is disabled for this call: the stored
/// server may be a proxy whose certificate does not match the hub CA.
#[derive(Debug, Default, Clone, Copy)]
pub struct ApiServerProbe;

#[async_trait]
impl KubeconfigProbe for ApiServerProbe {
    async fn is_valid(&self, kubeconfig: &str) -> bool {
        let client = match build_client(kubeconfig, VALIDITY_PROBE_TIMEOUT, true).await {
            Ok(client) => client,
            Err(e) => {
                debug!("Stored kubeconfig does not build a client: {}", e);
                return false;
            }
        };
        let namespaces: Api<Namespace> = Api::all(client);
        match tokio::time::timeout(VALIDITY_PROBE_TIMEOUT, namespaces.get("kube-system")).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                warn!("Failed to check hub kubeconfig validity: {}", e);
                false
            }
            Err(_) => {
                warn!("Hub kubeconfig validity check timed out");
                false
            }
        }
    }
}

/// What to do with a freshly built hub kubeconfig.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KubeconfigDecision {
    /// The stored token is cached, far from expiry and bound to the same pod
    CacheHit,
    /// The stored and new tokens are the same
    EqualToken,
    /// The stored kubeconfig still works
    OldValid,
    /// Write this kubeconfig to the secret
    Replace(String),
}

/// Decides whether `new` replaces the `old` stored kubeconfig.
pub async fn decide(
    new: &str,
    old: &str,
    cache: &TokenCache,
    probe: &dyn KubeconfigProbe,
    now: DateTime<Utc>,
) -> Result<KubeconfigDecision, ControllerError> {
    let mut new_doc = Kubeconfig::from_yaml(new)?;
    let old_doc = if old.trim().is_empty() {
        None
    } else {
        Kubeconfig::from_yaml(old)
            .map_err(|e| debug!("Ignoring unparseable stored kubeconfig: {}", e))
            .ok()
    };

    let new_token = current_token(&new_doc).unwrap_or_default();
    let old_token = old_doc.as_ref().and_then(current_token).unwrap_or_default();

    if !old_token.is_empty() {
        if let Some(claim) = cache.get(&old_token) {
            let tolerance = now + ChronoDuration::hours(EXPIRY_TOLERANCE_HOURS);
            let same_pod = parse_token_claim(&new_token).is_some_and(|c| c.pod_uid() == claim.pod_uid());
            if same_pod && claim.expires_after(tolerance) {
                debug!("Stored hub kubeconfig is still in effect");
                return Ok(KubeconfigDecision::CacheHit);
            }
        }
    }

    if old_doc.is_some() && (new_token.is_empty() || new_token == old_token) {
        if new_token.is_empty() {
            info!("No token in the hub kubeconfig, keeping the stored one");
        }
        cache.remember(&old_token);
        return Ok(KubeconfigDecision::EqualToken);
    }

    if old_doc.is_some() && probe.is_valid(old).await {
        cache.remember(&old_token);
        return Ok(KubeconfigDecision::OldValid);
    }

    // the stored server may be an egress proxy, keep it
    if let Some(server) = old_doc.as_ref().and_then(current_server) {
        set_current_server(&mut new_doc, &server);
    }
    Ok(KubeconfigDecision::Replace(serde_yaml::to_string(&new_doc)?))
}
