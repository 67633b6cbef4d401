//! Control routes served to backends on the inner peer.

use std::sync::Arc;
use std::time::Duration;

use proto::{DiscoveryError, SessionId, Status};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::discovery::Discovery;
use crate::router::{CallCtx, Router};
use crate::server::Server;

pub const SOCKET_PUSH: &str = "/gw/v1/socket_push";
pub const SOCKET_KICK: &str = "/gw/v1/socket_kick";
pub const SOCKET_TOTAL: &str = "/gw/v1/socket_total";
pub const SERVICE_REGISTER: &str = "/gw/v1/service_register";
pub const SERVICE_DEREGISTER: &str = "/gw/v1/service_deregister";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    pub session_id: String,
    pub path: String,
    #[serde(default)]
    pub body: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KickRequest {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KickReply {
    pub existed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotalReply {
    pub total: usize,
}

/// Backend instance announcing itself under a service name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub service: String,
    pub addr: String,
}

/// Registers the control routes. `outer` is the client-facing peer they act
/// on; backends registered through `discovery` hold a `lease_ttl` lease
/// (`0` means permanent) and must re-register to renew it.
pub fn register_routes(
    router: &mut Router,
    outer: Server,
    discovery: Arc<dyn Discovery>,
    lease_ttl: Duration,
) {
    let registry = discovery.clone();
    router.route_call_typed(SERVICE_REGISTER, move |req: ServiceRequest, _ctx: CallCtx| {
        let registry = registry.clone();
        let ttl = (!lease_ttl.is_zero()).then_some(lease_ttl);
        async move {
            registry
                .register(&req.service, &req.addr, ttl)
                .await
                .map_err(discovery_status)?;
            Ok::<_, Status>(Value::Null)
        }
    });

    router.route_call_typed(SERVICE_DEREGISTER, move |req: ServiceRequest, _ctx: CallCtx| {
        let registry = discovery.clone();
        async move {
            registry
                .deregister(&req.service, &req.addr)
                .await
                .map_err(discovery_status)?;
            Ok::<_, Status>(Value::Null)
        }
    });

    let target = outer.clone();
    router.route_call_typed(SOCKET_PUSH, move |req: PushRequest, _ctx: CallCtx| {
        let outer = target.clone();
        async move {
            outer
                .push(&SessionId::from(req.session_id), &req.path, req.body)
                .await?;
            Ok::<_, Status>(Value::Null)
        }
    });

    let target = outer.clone();
    router.route_call_typed(SOCKET_KICK, move |req: KickRequest, _ctx: CallCtx| {
        let existed = target.kick(&SessionId::from(req.session_id));
        async move { Ok::<_, Status>(KickReply { existed }) }
    });

    router.route_call_typed(SOCKET_TOTAL, move |_: Value, _ctx: CallCtx| {
        let total = outer.count_session();
        async move { Ok::<_, Status>(TotalReply { total }) }
    });
}

fn discovery_status(e: DiscoveryError) -> Status {
    match e {
        DiscoveryError::NotRegistered(_) => Status::not_found(e.to_string()),
        DiscoveryError::Unavailable(_) => Status::internal(e.to_string()),
    }
}
