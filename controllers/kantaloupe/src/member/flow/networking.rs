//! Service and gateway routes exposing a flow.

use super::template::match_path;
use crate::error::ControllerError;
use crate::member::MemberContext;
use crate::reconcile_helpers::{contains_entries, merge_labels, spec_matches};
use crds::well_known::{FLOW_NAME_LABEL, GATEWAY_NAME};
use crds::{
    BackendRef, Cluster, HTTPPathMatch, HTTPPathModifier, HTTPRoute, HTTPRouteFilter, HTTPRouteMatch,
    HTTPRouteRule, HTTPRouteSpec, HTTPURLRewriteFilter, KantaloupeFlow, NetworkType, Networking, ParentReference,
    TCPRoute, TCPRouteRule, TCPRouteSpec, join_section_name, split_section_name,
};
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Resource, ResourceExt};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

const VSCODE_NETWORK: &str = "vscode";

fn child_meta(flow: &KantaloupeFlow, name: String, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: flow.namespace(),
        labels: Some(labels),
        owner_references: flow.controller_owner_ref(&()).map(|o| vec![o]),
        ..Default::default()
    }
}

fn route_labels(flow: &KantaloupeFlow) -> BTreeMap<String, String> {
    merge_labels(flow.metadata.labels.as_ref(), &[(FLOW_NAME_LABEL, flow.name_any().as_str())])
}

fn route_name(flow: &KantaloupeFlow, network: &Networking) -> String {
    format!("{}-{}", flow.name_any(), network.name)
}

fn backend(flow: &KantaloupeFlow, network: &Networking) -> BackendRef {
    BackendRef {
        name: flow.name_any(),
        port: Some(network.port),
        ..Default::default()
    }
}

/// NodePort service selecting the flow pods, one port per networking entry.
pub fn desired_service(flow: &KantaloupeFlow) -> Service {
    let name = flow.name_any();
    let ports = flow
        .spec
        .networking
        .iter()
        .map(|n| ServicePort {
            name: Some(n.name.clone()),
            protocol: Some("TCP".to_string()),
            port: n.port,
            target_port: Some(IntOrString::Int(n.port)),
            ..Default::default()
        })
        .collect();
    Service {
        metadata: child_meta(flow, name.clone(), route_labels(flow)),
        spec: Some(ServiceSpec {
            type_: Some("NodePort".to_string()),
            selector: Some(BTreeMap::from([(FLOW_NAME_LABEL.to_string(), name)])),
            ports: Some(ports),
            ..Default::default()
        }),
        status: None,
    }
}

/// HTTP route of an endpoint attached to the operator gateway.
pub fn desired_http_route(flow: &KantaloupeFlow, network: &Networking, namespace: &str, path: &str) -> HTTPRoute {
    let filters = if network.name == VSCODE_NETWORK {
        vec![HTTPRouteFilter {
            type_: "URLRewrite".to_string(),
            url_rewrite: Some(HTTPURLRewriteFilter {
                path: Some(HTTPPathModifier {
                    type_: "ReplacePrefixMatch".to_string(),
                    replace_prefix_match: Some("/".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
        }]
    } else {
        vec![]
    };
    HTTPRoute {
        metadata: child_meta(flow, route_name(flow, network), route_labels(flow)),
        spec: HTTPRouteSpec {
            parent_refs: vec![ParentReference {
                name: GATEWAY_NAME.to_string(),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            }],
            hostnames: vec![],
            rules: vec![HTTPRouteRule {
                matches: vec![HTTPRouteMatch {
                    path: Some(HTTPPathMatch {
                        type_: Some("PathPrefix".to_string()),
                        value: Some(path.to_string()),
                    }),
                }],
                filters,
                backend_refs: vec![backend(flow, network)],
            }],
        },
    }
}

/// TCP route of an endpoint bound to the gateway listener for `port`.
pub fn desired_tcp_route(flow: &KantaloupeFlow, network: &Networking, namespace: &str, port: i32) -> TCPRoute {
    TCPRoute {
        metadata: child_meta(flow, route_name(flow, network), route_labels(flow)),
        spec: TCPRouteSpec {
            parent_refs: vec![ParentReference {
                name: GATEWAY_NAME.to_string(),
                namespace: Some(namespace.to_string()),
                section_name: Some(join_section_name(&network.name, port)),
                ..Default::default()
            }],
            rules: vec![TCPRouteRule {
                backend_refs: vec![backend(flow, network)],
            }],
        },
    }
}

/// Gateway port a TCP route is bound to, read from its first parent section.
pub fn bound_port(route: &TCPRoute) -> Result<i32, ControllerError> {
    let section = route
        .spec
        .parent_refs
        .first()
        .and_then(|p| p.section_name.as_deref())
        .ok_or_else(|| ControllerError::InvalidConfig(format!("TCPRoute {} has no parent section", route.name_any())))?;
    Ok(split_section_name(section)?.1)
}

/// URL of an HTTP endpoint behind the gateway.
pub fn http_url(gateway_address: &str, path: &str) -> String {
    format!("{}{}", gateway_address.trim_end_matches('/'), path)
}

/// `host:port` of a TCP endpoint behind the gateway.
///
/// A cluster without a gateway address yields `:<port>`.
pub fn tcp_url(gateway_address: &str, port: i32) -> Result<String, ControllerError> {
    let gateway_address = gateway_address.trim();
    if gateway_address.is_empty() {
        return Ok(format!(":{port}"));
    }
    let uri: http::Uri = gateway_address
        .parse()
        .map_err(|e| ControllerError::InvalidConfig(format!("invalid gateway address {gateway_address}: {e}")))?;
    Ok(format!("{}:{port}", uri.host().unwrap_or_default()))
}

/// The existing TCP route carrying the desired spec and labels, if it drifted.
pub fn tcp_route_update(desired: &TCPRoute, existing: &TCPRoute) -> Option<TCPRoute> {
    if spec_matches(&desired.spec, &existing.spec)
        && contains_entries(desired.metadata.labels.as_ref(), existing.metadata.labels.as_ref())
    {
        return None;
    }
    let mut updated = existing.clone();
    updated.spec = desired.spec.clone();
    if let Some(labels) = &desired.metadata.labels {
        updated.metadata.labels.get_or_insert_with(BTreeMap::new).extend(labels.clone());
    }
    Some(updated)
}

async fn apply_service(api: &Api<Service>, desired: &Service) -> Result<(), ControllerError> {
    let name = desired.name_any();
    match api.get_opt(&name).await? {
        None => {
            info!("Creating service {}", name);
            api.create(&PostParams::default(), desired).await?;
        }
        Some(mut existing) if !spec_matches(&desired.spec, &existing.spec) => {
            debug!("Updating service {}", name);
            let mut spec = desired.spec.clone().unwrap_or_default();
            // clusterIP is immutable once assigned
            if let Some(current) = existing.spec.as_ref() {
                spec.cluster_ip.clone_from(&current.cluster_ip);
                spec.cluster_ips.clone_from(&current.cluster_ips);
            }
            existing.spec = Some(spec);
            api.replace(&name, &PostParams::default(), &existing).await?;
        }
        Some(_) => {}
    }
    Ok(())
}

async fn apply_http_route(api: &Api<HTTPRoute>, desired: &HTTPRoute) -> Result<(), ControllerError> {
    let name = desired.name_any();
    match api.get_opt(&name).await? {
        None => {
            info!("Creating HTTPRoute {}", name);
            api.create(&PostParams::default(), desired).await?;
        }
        Some(mut existing)
            if !spec_matches(&desired.spec, &existing.spec)
                || !contains_entries(desired.metadata.labels.as_ref(), existing.metadata.labels.as_ref()) =>
        {
            debug!("Updating HTTPRoute {}", name);
            existing.spec = desired.spec.clone();
            if let Some(labels) = &desired.metadata.labels {
                existing.metadata.labels.get_or_insert_with(BTreeMap::new).extend(labels.clone());
            }
            api.replace(&name, &PostParams::default(), &existing).await?;
        }
        Some(_) => {}
    }
    Ok(())
}

/// Ensures the TCP route exists and returns the gateway port it is bound to.
async fn apply_tcp_route(
    api: &Api<TCPRoute>,
    flow: &KantaloupeFlow,
    network: &Networking,
    ctx: &MemberContext,
) -> Result<i32, ControllerError> {
    let name = route_name(flow, network);
    if let Some(existing) = api.get_opt(&name).await? {
        let port = bound_port(&existing)?;
        let desired = desired_tcp_route(flow, network, &ctx.namespace, port);
        if let Some(updated) = tcp_route_update(&desired, &existing) {
            debug!("Updating TCPRoute {}", name);
            api.replace(&name, &PostParams::default(), &updated).await?;
        }
        return Ok(port);
    }

    let port = ctx.ports.allocate_next()?;
    let route = desired_tcp_route(flow, network, &ctx.namespace, port);
    info!("Creating TCPRoute {} on gateway port {}", name, port);
    if let Err(e) = api.create(&PostParams::default(), &route).await {
        ctx.ports.release(port);
        return Err(e.into());
    }
    Ok(port)
}

/// Reconciles the service and routes of a flow and publishes resolved URLs.
pub async fn reconcile_networking(flow: &KantaloupeFlow, ctx: &MemberContext) -> Result<(), ControllerError> {
    let namespace = flow.namespace().unwrap_or_default();
    let services: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace);
    apply_service(&services, &desired_service(flow)).await?;

    let clusters: Api<Cluster> = Api::all(ctx.hub.clone());
    let Some(cluster) = clusters.get_opt(&ctx.cluster).await? else {
        warn!("Cluster {} is gone, skipping routes of flow {}", ctx.cluster, flow.name_any());
        return Ok(());
    };
    let gateway_address = cluster.spec.gateway_address.unwrap_or_default();

    let http_routes: Api<HTTPRoute> = Api::namespaced(ctx.client.clone(), &namespace);
    let tcp_routes: Api<TCPRoute> = Api::namespaced(ctx.client.clone(), &namespace);

    let mut resolved = Vec::with_capacity(flow.spec.networking.len());
    for network in &flow.spec.networking {
        let url = match network.type_ {
            NetworkType::Httproute => {
                let path = match_path(flow, network, &ctx.gateway.base_url);
                apply_http_route(&http_routes, &desired_http_route(flow, network, &ctx.namespace, &path)).await?;
                http_url(&gateway_address, &path)
            }
            NetworkType::Tcproute => {
                let port = apply_tcp_route(&tcp_routes, flow, network, ctx).await?;
                tcp_url(&gateway_address, port)?
            }
        };
        resolved.push(Networking {
            url: Some(url),
            ..network.clone()
        });
    }

    let current = flow.status.as_ref().map(|s| s.networking.as_slice()).unwrap_or_default();
    if current != resolved.as_slice() {
        let flows: Api<KantaloupeFlow> = Api::namespaced(ctx.client.clone(), &namespace);
        let patch = serde_json::json!({ "status": { "networking": resolved } });
        flows.patch_status(&flow.name_any(), &PatchParams::default(), &Patch::Merge(&patch)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_flow, create_test_tcp_route};
    use crds::{Plugin, WorkloadKind};

    fn network(name: &str, type_: NetworkType, port: i32) -> Networking {
        Networking {
            name: name.to_string(),
            type_,
            port,
            ..Default::default()
        }
    }

    #[test]
    fn test_desired_service() {
        let mut flow = create_test_flow("demo", "team-a", vec![Plugin::Ssh], WorkloadKind::Deployment);
        flow.spec.networking = vec![network("ssh", NetworkType::Tcproute, 22)];
        let service = desired_service(&flow);

        assert_eq!(service.metadata.name.as_deref(), Some("demo"));
        assert_eq!(service.metadata.owner_references.unwrap()[0].uid, "uid-demo");
        let spec = service.spec.unwrap();
        assert_eq!(spec.type_.as_deref(), Some("NodePort"));
        assert_eq!(spec.selector.unwrap()[FLOW_NAME_LABEL], "demo");
        let port = &spec.ports.unwrap()[0];
        assert_eq!(port.name.as_deref(), Some("ssh"));
        assert_eq!(port.target_port, Some(IntOrString::Int(22)));
    }

    #[test]
    fn test_vscode_route_rewrites_prefix() {
        let flow = create_test_flow("demo", "team-a", vec![Plugin::Vscode], WorkloadKind::Deployment);
        let vscode = network("vscode", NetworkType::Httproute, 8080);
        let route = desired_http_route(&flow, &vscode, "kantaloupe-system", "/k/team-a/demo/vscode/");

        assert_eq!(route.metadata.name.as_deref(), Some("demo-vscode"));
        assert_eq!(route.spec.parent_refs[0].namespace.as_deref(), Some("kantaloupe-system"));
        let rule = &route.spec.rules[0];
        assert_eq!(rule.filters[0].type_, "URLRewrite");
        assert_eq!(
            rule.filters[0].url_rewrite.as_ref().unwrap().path.as_ref().unwrap().replace_prefix_match.as_deref(),
            Some("/")
        );
        assert_eq!(rule.backend_refs[0].port, Some(8080));

        let jupyter = desired_http_route(&flow, &network("jupyter", NetworkType::Httproute, 8888), "ns", "/p");
        assert!(jupyter.spec.rules[0].filters.is_empty());
    }

    #[test]
    fn test_tcp_route_section_round_trips_port() {
        let flow = create_test_flow("demo", "team-a", vec![Plugin::Ssh], WorkloadKind::Deployment);
        let route = desired_tcp_route(&flow, &network("ssh", NetworkType::Tcproute, 22), "kantaloupe-system", 30005);

        assert_eq!(route.metadata.labels.as_ref().unwrap()[FLOW_NAME_LABEL], "demo");
        assert_eq!(bound_port(&route).unwrap(), 30005);

        let mut orphan = route.clone();
        orphan.spec.parent_refs.clear();
        assert!(matches!(bound_port(&orphan), Err(ControllerError::InvalidConfig(_))));
    }

    #[test]
    fn test_urls() {
        assert_eq!(http_url("http://10.0.0.1/", "/k/ns/demo/jupyter"), "http://10.0.0.1/k/ns/demo/jupyter");
        assert_eq!(tcp_url("http://10.0.0.1:8080/", 30005).unwrap(), "10.0.0.1:30005");
        assert_eq!(tcp_url("gw.example.com", 30001).unwrap(), "gw.example.com:30001");
        assert_eq!(tcp_url("", 30001).unwrap(), ":30001");
        assert_eq!(tcp_url("  ", 30001).unwrap(), ":30001");
        assert!(tcp_url("gw example", 30001).is_err());
    }

    #[test]
    fn test_tcp_route_update_repairs_backend_and_labels() {
        let mut flow = create_test_flow("demo", "team-a", vec![Plugin::Ssh], WorkloadKind::Deployment);
        flow.metadata.labels = Some(BTreeMap::from([("team".to_string(), "a".to_string())]));
        let ssh = network("ssh", NetworkType::Tcproute, 22);

        let mut existing = create_test_tcp_route("demo-ssh", "team-a", &join_section_name("ssh", 30005));
        existing.metadata.labels = Some(BTreeMap::from([("owner".to_string(), "ops".to_string())]));
        let port = bound_port(&existing).unwrap();
        let desired = desired_tcp_route(&flow, &ssh, "kantaloupe-system", port);

        let updated = tcp_route_update(&desired, &existing).unwrap();
        assert_eq!(updated.spec.rules[0].backend_refs[0].port, Some(22));
        assert_eq!(bound_port(&updated).unwrap(), 30005);
        let labels = updated.metadata.labels.clone().unwrap();
        assert_eq!(labels["owner"], "ops");
        assert_eq!(labels["team"], "a");
        assert_eq!(labels[FLOW_NAME_LABEL], "demo");
        assert!(tcp_route_update(&desired, &updated).is_none());
    }
}
