//! Propagates the KantaloupeFlow CRD from the hub to members.

use crate::error::ControllerError;
use crate::reconcile_helpers::strip_unused_fields;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::PostParams;
use kube::{Api, Client};
use tracing::{debug, info};

/// Name of the flow CRD.
pub const FLOW_CRD_NAME: &str = "kantaloupeflows.kantaloupe.dynamia.ai";

/// Copy of the hub CRD that can be created on a member.
pub fn member_copy(hub_crd: &CustomResourceDefinition) -> CustomResourceDefinition {
    let mut crd = hub_crd.clone();
    crd.metadata.resource_version = None;
    crd.metadata.uid = None;
    crd.metadata.creation_timestamp = None;
    crd.metadata.generation = None;
    strip_unused_fields(&mut crd.metadata);
    crd.status = None;
    crd
}

/// Creates the flow CRD on the member, or updates its spec when it drifted.
pub async fn sync_flow_crd(hub: &Client, member: &Client, cluster: &str) -> Result<(), ControllerError> {
    let hub_crds: Api<CustomResourceDefinition> = Api::all(hub.clone());
    let member_crds: Api<CustomResourceDefinition> = Api::all(member.clone());

    let hub_crd = hub_crds.get(FLOW_CRD_NAME).await?;
    match member_crds.get_opt(FLOW_CRD_NAME).await? {
        None => {
            info!("Installing CRD {} on cluster {}", FLOW_CRD_NAME, cluster);
            member_crds.create(&PostParams::default(), &member_copy(&hub_crd)).await?;
        }
        Some(mut crd) if crd.spec != hub_crd.spec => {
            info!("Updating CRD {} on cluster {}", FLOW_CRD_NAME, cluster);
            crd.spec = hub_crd.spec;
            member_crds.replace(FLOW_CRD_NAME, &PostParams::default(), &crd).await?;
        }
        Some(_) => debug!("CRD {} is current on cluster {}", FLOW_CRD_NAME, cluster),
    }
    Ok(())
}
