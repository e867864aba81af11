//! Federated scrape configs, one per member.
//!
//! The hub Prometheus federates every member through a ScrapeConfig cloned
//! from the `kantaloupe-local-cluster` template.

use crate::error::{ControllerError, is_not_found};
use crate::reconcile_helpers::strip_scheme;
use crds::well_known::{GLOBAL_CLUSTER_NAME, MONITORING_NAMESPACE, SCRAPE_CONFIG_PREFIX, SCRAPE_CONFIG_TEMPLATE};
use crds::{Cluster, RelabelConfig, ScrapeConfig, ScrapeConfigSpec, StaticConfig};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use std::collections::BTreeMap;
use tracing::{debug, error, info};

/// Name of the scrape config federating `cluster`.
pub fn scrape_config_name(cluster: &str) -> String {
    format!("{SCRAPE_CONFIG_PREFIX}{cluster}")
}

/// Points `spec` at the member Prometheus and labels its series.
pub fn set_targets(spec: &mut ScrapeConfigSpec, cluster: &Cluster) {
    let address = cluster.spec.prometheus_address.as_deref().unwrap_or_default();
    spec.static_configs = vec![StaticConfig {
        targets: vec![strip_scheme(address).to_string()],
        labels: BTreeMap::new(),
    }];
    spec.relabelings = vec![RelabelConfig {
        target_label: Some("cluster".to_string()),
        replacement: Some(cluster.name_any()),
        ..Default::default()
    }];
}

/// New scrape config for `cluster` cloned from `template`.
pub fn from_template(template: &ScrapeConfig, cluster: &Cluster) -> ScrapeConfig {
    let mut spec = template.spec.clone();
    set_targets(&mut spec, cluster);
    ScrapeConfig {
        metadata: ObjectMeta {
            name: Some(scrape_config_name(&cluster.name_any())),
            namespace: Some(MONITORING_NAMESPACE.to_string()),
            labels: Some(BTreeMap::from([("release".to_string(), "prometheus".to_string())])),
            owner_references: cluster.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec,
    }
}

/// Creates or refreshes the scrape config of one cluster.
pub async fn ensure_scrape_config(client: &Client, cluster: &Cluster) -> Result<(), ControllerError> {
    let api: Api<ScrapeConfig> = Api::namespaced(client.clone(), MONITORING_NAMESPACE);
    let name = scrape_config_name(&cluster.name_any());

    if let Some(mut existing) = api.get_opt(&name).await? {
        let before = existing.spec.clone();
        set_targets(&mut existing.spec, cluster);
        if existing.spec != before {
            debug!("Updating scrape config {}", name);
            api.replace(&name, &PostParams::default(), &existing).await?;
        }
        return Ok(());
    }

    let template = api.get(SCRAPE_CONFIG_TEMPLATE).await?;
    info!("Creating scrape config {} for cluster {}", name, cluster.name_any());
    api.create(&PostParams::default(), &from_template(&template, cluster)).await?;
    Ok(())
}

/// One pass over every member cluster.
pub async fn sync_all(client: &Client) -> Result<(), ControllerError> {
    let clusters: Api<Cluster> = Api::all(client.clone());
    for cluster in clusters.list(&ListParams::default()).await?.items {
        if cluster.name_any() == GLOBAL_CLUSTER_NAME {
            continue;
        }
        if let Err(e) = ensure_scrape_config(client, &cluster).await {
            error!("Failed to ensure scrape config for cluster {}: {}", cluster.name_any(), e);
        }
    }
    Ok(())
}

/// Deletes the scrape config of `cluster`. A missing config is fine.
pub async fn delete_scrape_config(client: &Client, cluster: &str) -> Result<(), ControllerError> {
    let api: Api<ScrapeConfig> = Api::namespaced(client.clone(), MONITORING_NAMESPACE);
    match api.delete(&scrape_config_name(cluster), &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_cluster;

    fn template() -> ScrapeConfig {
        let mut spec = ScrapeConfigSpec::default();
        spec.extra.insert("metricsPath".to_string(), serde_json::json!("/federate"));
        spec.static_configs = vec![StaticConfig {
            targets: vec!["localhost:9090".to_string()],
            labels: BTreeMap::new(),
        }];
        let mut template = ScrapeConfig::new(SCRAPE_CONFIG_TEMPLATE, spec);
        template.metadata.namespace = Some(MONITORING_NAMESPACE.to_string());
        template.metadata.resource_version = Some("42".to_string());
        template
    }

    #[test]
    fn test_from_template_rewrites_targets_and_metadata() {
        let mut cluster = create_test_cluster("member-1", "member-1-secret");
        cluster.metadata.uid = Some("cluster-uid".to_string());
        cluster.spec.prometheus_address = Some("https://prom.member-1:9090".to_string());

        let config = from_template(&template(), &cluster);
        assert_eq!(config.metadata.name.as_deref(), Some("kantaloupe-federate-member-1"));
        assert!(config.metadata.resource_version.is_none());
        assert_eq!(config.metadata.labels.unwrap()["release"], "prometheus");
        let owner = &config.metadata.owner_references.unwrap()[0];
        assert_eq!(owner.kind, "Cluster");
        assert_eq!(owner.controller, Some(true));
        assert_eq!(config.spec.static_configs[0].targets, vec!["prom.member-1:9090"]);
        assert_eq!(config.spec.relabelings[0].replacement.as_deref(), Some("member-1"));
        assert_eq!(config.spec.extra["metricsPath"], "/federate");
    }

    #[test]
    fn test_set_targets_is_stable() {
        let cluster = create_test_cluster("member-1", "s");
        let mut spec = ScrapeConfigSpec::default();
        set_targets(&mut spec, &cluster);
        let once = spec.clone();
        set_targets(&mut spec, &cluster);
        assert_eq!(spec, once);
    }
}
