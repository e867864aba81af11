//! Member health probe.

use crds::{CLUSTER_CONDITION_READY, CONDITION_FALSE, CONDITION_TRUE, Condition};
use http::StatusCode;
use kube::Client;
use kube::client::Body;
use tracing::debug;

/// Result of probing a member API server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterHealth {
    /// The API server answered
    pub online: bool,
    /// The health endpoint answered 200
    pub healthy: bool,
}

impl ClusterHealth {
    /// Probe outcome from a response status, `None` meaning no response.
    pub fn from_status(status: Option<StatusCode>) -> Self {
        match status {
            None => Self { online: false, healthy: false },
            Some(code) => Self { online: true, healthy: code == StatusCode::OK },
        }
    }

    /// Observed Ready condition for this outcome.
    pub fn ready_condition(self) -> Condition {
        if !self.online {
            Condition::new(CLUSTER_CONDITION_READY, CONDITION_FALSE, "ClusterNotReachable", "cluster is not reachable")
        } else if !self.healthy {
            Condition::new(
                CLUSTER_CONDITION_READY,
                CONDITION_FALSE,
                "ClusterNotReady",
                "cluster is reachable but health endpoint responded without ok",
            )
        } else {
            Condition::new(
                CLUSTER_CONDITION_READY,
                CONDITION_TRUE,
                "ClusterReady",
                "cluster is healthy and ready to accept workloads",
            )
        }
    }
}

async fn get_status(client: &Client, path: &str) -> Option<StatusCode> {
    let request = match http::Request::get(path).body(Body::empty()) {
        Ok(request) => request,
        Err(e) => {
            debug!("Failed to build probe request for {}: {}", path, e);
            return None;
        }
    };
    match client.send(request).await {
        Ok(response) => Some(response.status()),
        Err(e) => {
            debug!("Probe of {} failed: {}", path, e);
            None
        }
    }
}

/// GETs `/readyz`, falling back to `/api` when the server has no readyz endpoint.
pub async fn probe(client: &Client) -> ClusterHealth {
    let status = match get_status(client, "/readyz").await {
        Some(StatusCode::NOT_FOUND) => get_status(client, "/api").await,
        other => other,
    };
    ClusterHealth::from_status(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::unreachable_client;

    #[test]
    fn test_condition_table() {
        let offline = ClusterHealth::from_status(None).ready_condition();
        assert_eq!(offline.status, CONDITION_FALSE);
        assert_eq!(offline.reason, "ClusterNotReachable");

        let unhealthy = ClusterHealth::from_status(Some(StatusCode::INTERNAL_SERVER_ERROR)).ready_condition();
        assert_eq!(unhealthy.status, CONDITION_FALSE);
        assert_eq!(unhealthy.reason, "ClusterNotReady");

        let healthy = ClusterHealth::from_status(Some(StatusCode::OK)).ready_condition();
        assert!(healthy.is_true());
        assert_eq!(healthy.reason, "ClusterReady");
        assert_eq!(healthy.message, "cluster is healthy and ready to accept workloads");
    }

    #[tokio::test]
    async fn test_unreachable_member_is_offline() {
        let health = probe(&unreachable_client()).await;
        assert_eq!(health, ClusterHealth { online: false, healthy: false });
    }
}
