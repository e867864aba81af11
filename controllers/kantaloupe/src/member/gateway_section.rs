//! Keeps gateway listeners in step with flow TCP routes.
//!
//! Every flow TCPRoute names its listener through the parent section
//! `<network>--<port>`. The listener is added when the route appears and
//! removed, with its port released, when the route is deleted. When the
//! member is deregistered the route finalizers are dropped.

use crate::backoff::retry_on_conflict;
use crate::error::{ControllerError, ErrorKind, is_not_found};
use crate::member::MemberContext;
use crate::reconcile_helpers::{ensure_finalizer, is_deleting, object_key, remove_finalizer};
use crate::watcher::{RunOptions, run_controller};
use crds::well_known::{FLOW_NAME_LABEL, TCPROUTE_FINALIZER};
use crds::{AllowedRoutes, Gateway, Listener, ParentReference, RouteGroupKind, RouteNamespaces, TCPRoute, split_section_name};
use kube::api::{ListParams, PostParams};
use kube::{Api, ResourceExt};
use kube_runtime::Controller;
use kube_runtime::controller::Action;
use kube_runtime::watcher::Config;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Runs the controller against the member until shutdown.
pub async fn run(ctx: Arc<MemberContext>, opts: RunOptions) {
    let routes: Api<TCPRoute> = Api::all(ctx.client.clone());
    let controller = Controller::new(routes, Config::default().labels(FLOW_NAME_LABEL));
    run_controller(controller, ctx, reconcile, opts).await;
}

/// TCP listener accepting TCPRoutes from every namespace.
pub fn tcp_listener(section: &str) -> Result<Listener, ControllerError> {
    let (_, port) = split_section_name(section)?;
    Ok(Listener {
        name: section.to_string(),
        port,
        protocol: "TCP".to_string(),
        allowed_routes: Some(AllowedRoutes {
            namespaces: Some(RouteNamespaces {
                from: Some("All".to_string()),
                ..Default::default()
            }),
            kinds: vec![RouteGroupKind {
                group: None,
                kind: "TCPRoute".to_string(),
            }],
        }),
        ..Default::default()
    })
}

/// Adds the listener for `section` when missing. Returns true when added.
pub fn add_listener(gateway: &mut Gateway, section: &str) -> Result<bool, ControllerError> {
    if gateway.spec.listeners.iter().any(|l| l.name == section) {
        return Ok(false);
    }
    gateway.spec.listeners.push(tcp_listener(section)?);
    Ok(true)
}

/// Removes the listener for `section`. Returns true when removed.
pub fn remove_listener(gateway: &mut Gateway, section: &str) -> bool {
    let before = gateway.spec.listeners.len();
    gateway.spec.listeners.retain(|l| l.name != section);
    before != gateway.spec.listeners.len()
}

fn gateway_api(ctx: &MemberContext, route: &TCPRoute, parent: &ParentReference) -> Api<Gateway> {
    let namespace = parent.namespace.clone().or_else(|| route.namespace()).unwrap_or_default();
    Api::namespaced(ctx.client.clone(), &namespace)
}

async fn attach(ctx: &MemberContext, route: &TCPRoute) -> Result<(), ControllerError> {
    for parent in route.spec.parent_refs.iter().filter(|p| p.is_gateway()) {
        let Some(section) = parent.section_name.as_deref() else {
            continue;
        };
        let api = gateway_api(ctx, route, parent);
        let api = &api;
        let name = parent.name.as_str();
        retry_on_conflict(|| async move {
            let mut gateway = api.get(name).await?;
            if !add_listener(&mut gateway, section)? {
                return Ok(());
            }
            info!("Adding listener {} to gateway {}", section, object_key(&gateway));
            api.replace(name, &PostParams::default(), &gateway).await?;
            Ok::<(), ControllerError>(())
        })
        .await?;
    }
    Ok(())
}

async fn detach(ctx: &MemberContext, route: &TCPRoute) -> Result<(), ControllerError> {
    let Some(parent) = route.spec.parent_refs.first() else {
        warn!("TCPRoute {} has no parent refs", object_key(route));
        return Ok(());
    };
    let Some(section) = parent.section_name.as_deref() else {
        return Ok(());
    };
    let (_, port) = split_section_name(section)?;

    let api = gateway_api(ctx, route, parent);
    match api.get_opt(&parent.name).await? {
        Some(mut gateway) => {
            if remove_listener(&mut gateway, section) {
                info!("Removing listener {} from gateway {}", section, object_key(&gateway));
                api.replace(&parent.name, &PostParams::default(), &gateway).await?;
            } else {
                debug!("Gateway {} has no listener {}", parent.name, section)
            }
        }
        None => debug!("Gateway {} is gone", parent.name),
    }
    ctx.ports.release(port);
    Ok(())
}

async fn reconcile(route: Arc<TCPRoute>, ctx: Arc<MemberContext>) -> Result<Action, ControllerError> {
    let api: Api<TCPRoute> = Api::namespaced(ctx.client.clone(), &route.namespace().unwrap_or_default());
    let route = match api.get(&route.name_any()).await {
        Ok(route) => route,
        Err(e) if is_not_found(&e) => return Ok(Action::await_change()),
        Err(e) => return Err(e.into()),
    };

    if is_deleting(&route) {
        detach(&ctx, &route).await?;
        remove_finalizer(&api, &route, TCPROUTE_FINALIZER).await?;
        return Ok(Action::await_change());
    }
    ensure_finalizer(&api, &route, TCPROUTE_FINALIZER).await?;
    attach(&ctx, &route).await?;
    Ok(Action::await_change())
}

/// Drops the route finalizer from every flow TCPRoute of the member.
///
/// Runs once the member's controllers have stopped, when nothing is left
/// to detach the routes on deletion.
pub async fn release_routes(ctx: Arc<MemberContext>) -> Result<(), ControllerError> {
    let routes: Api<TCPRoute> = Api::all(ctx.client.clone());
    let list = routes.list(&ListParams::default().labels(FLOW_NAME_LABEL)).await?;
    for route in list.items.iter().filter(|r| r.finalizers().iter().any(|f| f == TCPROUTE_FINALIZER)) {
        let api: Api<TCPRoute> = Api::namespaced(ctx.client.clone(), &route.namespace().unwrap_or_default());
        match remove_finalizer(&api, route, TCPROUTE_FINALIZER).await {
            Ok(_) => debug!("Released TCPRoute {} of cluster {}", object_key(route), ctx.cluster),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_gateway;

    #[test]
    fn test_add_listener_once() {
        let mut gateway = create_test_gateway(&[("http", 80)]);
        assert!(add_listener(&mut gateway, "ssh--30001").unwrap());
        assert!(!add_listener(&mut gateway, "ssh--30001").unwrap());

        let listener = &gateway.spec.listeners[1];
        assert_eq!(listener.port, 30001);
        assert_eq!(listener.protocol, "TCP");
        let allowed = listener.allowed_routes.as_ref().unwrap();
        assert_eq!(allowed.kinds[0].kind, "TCPRoute");
        assert_eq!(allowed.namespaces.as_ref().unwrap().from.as_deref(), Some("All"));
    }

    #[test]
    fn test_add_listener_rejects_malformed_section() {
        let mut gateway = create_test_gateway(&[]);
        assert!(add_listener(&mut gateway, "ssh").is_err());
        assert!(gateway.spec.listeners.is_empty());
    }

    #[test]
    fn test_remove_listener() {
        let mut gateway = create_test_gateway(&[("http", 80), ("ssh--30001", 30001)]);
        assert!(remove_listener(&mut gateway, "ssh--30001"));
        assert!(!remove_listener(&mut gateway, "ssh--30001"));
        assert_eq!(gateway.spec.listeners.len(), 1);
        assert_eq!(gateway.spec.listeners[0].name, "http");
    }
}
