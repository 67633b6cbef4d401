//! Call and push handler routing for a peer.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use proto::{BodyCodec, Frame, GatewayError, Status};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;

use crate::session::Session;

/// Inbound call or push as seen by a handler.
#[derive(Debug, Clone)]
pub struct CallCtx {
    pub path: String,
    pub body: Value,
    pub codec: BodyCodec,
    pub meta: BTreeMap<String, String>,
    /// Originating session; `None` for stateless HTTP requests.
    pub session: Option<Arc<Session>>,
}

impl CallCtx {
    pub fn new(path: impl Into<String>, body: Value) -> Self {
        Self {
            path: path.into(),
            body,
            codec: BodyCodec::default(),
            meta: BTreeMap::new(),
            session: None,
        }
    }

    pub(crate) fn from_frame(frame: Frame, session: Option<Arc<Session>>) -> Self {
        Self {
            path: frame.path,
            body: frame.body,
            codec: frame.codec,
            meta: frame.meta,
            session,
        }
    }
}

/// Handles a call and produces its reply body.
#[async_trait]
pub trait CallHandler: Send + Sync {
    async fn call(&self, ctx: CallCtx) -> Result<Value, Status>;
}

#[async_trait]
impl<F, Fut> CallHandler for F
where
    F: Fn(CallCtx) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, Status>> + Send + 'static,
{
    async fn call(&self, ctx: CallCtx) -> Result<Value, Status> {
        (self)(ctx).await
    }
}

/// Handles a one-way push.
#[async_trait]
pub trait PushHandler: Send + Sync {
    async fn push(&self, ctx: CallCtx);
}

#[async_trait]
impl<F, Fut> PushHandler for F
where
    F: Fn(CallCtx) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn push(&self, ctx: CallCtx) {
        (self)(ctx).await
    }
}

/// Builds the status returned when a body cannot be bound to a handler's
/// parameter type. Arguments are handler path, parameter name and reason.
pub type BindErrorFn = Arc<dyn Fn(&str, &str, &str) -> Status + Send + Sync>;

/// Status of [`GatewayError::Binding`] with a JSON cause
/// `{handler, param, reason}`.
pub fn default_bind_error() -> BindErrorFn {
    Arc::new(|handler, param, reason| {
        let cause = json!({
            "handler": handler,
            "param": param,
            "reason": reason,
        });
        GatewayError::Binding {
            handler: handler.to_string(),
            param: param.to_string(),
            reason: reason.to_string(),
        }
        .to_status()
        .with_cause(cause.to_string())
    })
}

/// Handler that deserializes the body into `A` and serializes its `R`.
struct Typed<A, R, F> {
    path: String,
    f: F,
    bind_error: Arc<RwLock<BindErrorFn>>,
    _marker: PhantomData<fn(A) -> R>,
}

#[async_trait]
impl<A, R, F, Fut> CallHandler for Typed<A, R, F>
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(A, CallCtx) -> Fut + Send + Sync,
    Fut: Future<Output = Result<R, Status>> + Send + 'static,
{
    async fn call(&self, ctx: CallCtx) -> Result<Value, Status> {
        let arg = match serde_json::from_value::<A>(ctx.body.clone()) {
            Ok(arg) => arg,
            Err(e) => {
                let reason = e.to_string();
                let param = param_name(&reason);
                debug!(handler = %self.path, param, %reason, "Parameter binding failed");
                let bind_error = self.bind_error.read().clone();
                return Err(bind_error(&self.path, param, &reason));
            }
        };
        let out = (self.f)(arg, ctx).await?;
        serde_json::to_value(out).map_err(|e| Status::internal(format!("encode reply: {e}")))
    }
}

/// Field named in a serde error (``missing field `sku` ``), else `body`.
fn param_name(reason: &str) -> &str {
    reason
        .find("field `")
        .map(|start| &reason[start + 7..])
        .and_then(|rest| rest.find('`').map(|end| &rest[..end]))
        .unwrap_or("body")
}

/// Normalizes a route path to `/a/b` form.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_matches('/');
    format!("/{trimmed}")
}

fn join_path(prefix: &str, path: &str) -> String {
    let prefix = normalize_path(prefix);
    let path = normalize_path(path);
    match (prefix.as_str(), path.as_str()) {
        ("/", p) => p.to_string(),
        (pre, "/") => pre.to_string(),
        (pre, p) => format!("{pre}{p}"),
    }
}

/// Handler table of one peer. Frozen once the peer is built.
pub struct Router {
    calls: HashMap<String, Arc<dyn CallHandler>>,
    pushes: HashMap<String, Arc<dyn PushHandler>>,
    unknown_call: Option<Arc<dyn CallHandler>>,
    unknown_push: Option<Arc<dyn PushHandler>>,
    bind_error: Arc<RwLock<BindErrorFn>>,
}

impl Default for Router {
    fn default() -> Self {
        Self {
            calls: HashMap::new(),
            pushes: HashMap::new(),
            unknown_call: None,
            unknown_push: None,
            bind_error: Arc::new(RwLock::new(default_bind_error())),
        }
    }
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a call handler; returns the normalized path.
    pub fn route_call(&mut self, path: &str, handler: impl CallHandler + 'static) -> String {
        let path = normalize_path(path);
        debug!(%path, "Registering call handler");
        self.calls.insert(path.clone(), Arc::new(handler));
        path
    }

    /// Registers a call handler whose body is bound to `A`.
    pub fn route_call_typed<A, R, F, Fut>(&mut self, path: &str, f: F) -> String
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A, CallCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, Status>> + Send + 'static,
    {
        let handler = Typed {
            path: normalize_path(path),
            f,
            bind_error: self.bind_error.clone(),
            _marker: PhantomData,
        };
        self.route_call(path, handler)
    }

    pub fn route_push(&mut self, path: &str, handler: impl PushHandler + 'static) -> String {
        let path = normalize_path(path);
        debug!(%path, "Registering push handler");
        self.pushes.insert(path.clone(), Arc::new(handler));
        path
    }

    /// Registration scope that prefixes every path with `prefix`.
    pub fn sub_route(&mut self, prefix: &str) -> SubRouter<'_> {
        SubRouter {
            router: self,
            prefix: normalize_path(prefix),
        }
    }

    /// Handler for calls whose path has no registration.
    pub fn set_unknown_call(&mut self, handler: impl CallHandler + 'static) {
        self.unknown_call = Some(Arc::new(handler));
    }

    pub fn set_unknown_push(&mut self, handler: impl PushHandler + 'static) {
        self.unknown_push = Some(Arc::new(handler));
    }

    /// Replaces the bind-error builder; `None` restores the default.
    /// Affects typed handlers registered before and after the call.
    pub fn set_bind_error_fn(&self, f: Option<BindErrorFn>) {
        *self.bind_error.write() = f.unwrap_or_else(default_bind_error);
    }

    pub fn call_handler(&self, path: &str) -> Option<Arc<dyn CallHandler>> {
        self.calls
            .get(path)
            .or(self.unknown_call.as_ref())
            .cloned()
    }

    pub fn push_handler(&self, path: &str) -> Option<Arc<dyn PushHandler>> {
        self.pushes
            .get(path)
            .or(self.unknown_push.as_ref())
            .cloned()
    }

    /// Registered call paths, sorted.
    pub fn call_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.calls.keys().cloned().collect();
        paths.sort();
        paths
    }
}

/// Prefixed view of a [`Router`].
pub struct SubRouter<'a> {
    router: &'a mut Router,
    prefix: String,
}

impl SubRouter<'_> {
    pub fn route_call(&mut self, path: &str, handler: impl CallHandler + 'static) -> String {
        let full = join_path(&self.prefix, path);
        self.router.route_call(&full, handler)
    }

    pub fn route_call_typed<A, R, F, Fut>(&mut self, path: &str, f: F) -> String
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A, CallCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, Status>> + Send + 'static,
    {
        let full = join_path(&self.prefix, path);
        self.router.route_call_typed(&full, f)
    }

    pub fn route_push(&mut self, path: &str, handler: impl PushHandler + 'static) -> String {
        let full = join_path(&self.prefix, path);
        self.router.route_push(&full, handler)
    }
}

#[cfg(test)]
mod tests {
    use proto::StatusCode;
    use serde::Deserialize;

    use super::*;

    #[derive(Deserialize)]
    struct CreateOrder {
        sku: String,
        qty: u32,
    }

    async fn echo(ctx: CallCtx) -> Result<Value, Status> {
        Ok(ctx.body)
    }

    #[test]
    fn paths_are_normalized() {
        assert_eq!(normalize_path("orders/create/"), "/orders/create");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(join_path("/api/", "/v1"), "/api/v1");
        assert_eq!(join_path("/", "ping"), "/ping");
    }

    #[tokio::test]
    async fn routes_and_sub_routes_dispatch_by_path() {
        let mut router = Router::new();
        router.route_call("/echo", echo);
        let path = router.sub_route("/orders").route_call("create", echo);
        assert_eq!(path, "/orders/create");
        assert_eq!(router.call_paths(), vec!["/echo", "/orders/create"]);

        let handler = router.call_handler("/orders/create").expect("registered");
        let out = handler
            .call(CallCtx::new("/orders/create", json!({"id": 1})))
            .await
            .expect("echo");
        assert_eq!(out, json!({"id": 1}));
        assert!(router.call_handler("/missing").is_none());
    }

    #[tokio::test]
    async fn unknown_call_handler_catches_unregistered_paths() {
        let mut router = Router::new();
        router.set_unknown_call(|ctx: CallCtx| async move { Ok::<_, Status>(json!(ctx.path)) });
        let handler = router.call_handler("/users/get").expect("fallback");
        let out = handler
            .call(CallCtx::new("/users/get", Value::Null))
            .await
            .expect("fallback reply");
        assert_eq!(out, json!("/users/get"));
    }

    #[tokio::test]
    async fn typed_binding_reports_structured_cause() {
        let mut router = Router::new();
        router.route_call_typed("/orders/create", |req: CreateOrder, _ctx| async move {
            Ok::<_, Status>(format!("{}x{}", req.qty, req.sku))
        });
        let handler = router.call_handler("/orders/create").expect("registered");

        let ok = handler
            .call(CallCtx::new("/orders/create", json!({"sku": "A1", "qty": 2})))
            .await
            .expect("bound");
        assert_eq!(ok, json!("2xA1"));

        let err = handler
            .call(CallCtx::new("/orders/create", json!({"qty": 2})))
            .await
            .expect_err("missing sku");
        assert_eq!(err.code, StatusCode::InvalidParameter);
        assert!(err.message.starts_with("Binding error in /orders/create.sku"));
        let cause: Value = serde_json::from_str(err.cause.as_deref().expect("cause")).expect("json");
        assert_eq!(cause["handler"], "/orders/create");
        assert_eq!(cause["param"], "sku");
        assert!(cause["reason"].as_str().expect("reason").contains("missing field"));
    }

    #[tokio::test]
    async fn bind_error_fn_can_be_replaced_and_restored() {
        let mut router = Router::new();
        router.route_call_typed("/n", |n: u32, _ctx| async move { Ok::<_, Status>(n + 1) });
        router.set_bind_error_fn(Some(Arc::new(|handler, _, _| {
            Status::bad_request(format!("bad input for {handler}"))
        })));

        let handler = router.call_handler("/n").expect("registered");
        let err = handler
            .call(CallCtx::new("/n", json!("x")))
            .await
            .expect_err("not a number");
        assert_eq!(err.code, StatusCode::BadRequest);
        assert_eq!(err.message, "bad input for /n");

        router.set_bind_error_fn(None);
        let err = handler
            .call(CallCtx::new("/n", json!("x")))
            .await
            .expect_err("not a number");
        assert_eq!(err.code, StatusCode::InvalidParameter);
        assert!(err.cause.expect("cause").contains("\"param\":\"body\""));
    }

    #[test]
    fn param_name_falls_back_to_body() {
        assert_eq!(param_name("missing field `qty` at line 1 column 2"), "qty");
        assert_eq!(param_name("invalid type: string \"x\", expected u32"), "body");
    }
}
