//! Stateless HTTP transport: `POST /{path}` runs one call through the outer
//! peer's router and proxy fallback.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode as HttpStatus, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use parking_lot::RwLock;
use proto::{BodyCodec, Status};
use tower_http::cors::{Any, CorsLayer};
use tracing::debug;

use crate::business::Business;
use crate::router::CallCtx;
use crate::server::Server;

/// Query parameter that may carry the bearer token.
const ACCESS_TOKEN_PARAM: &str = "access_token";

// ─── Codec table ───────────────────────────────────────────

/// Content-type to body codec mapping. Unknown types use the default codec.
pub struct BodyCodecTable {
    entries: RwLock<HashMap<String, BodyCodec>>,
    default: BodyCodec,
}

impl BodyCodecTable {
    pub fn new(default: BodyCodec) -> Self {
        let table = Self {
            entries: RwLock::new(HashMap::new()),
            default,
        };
        table.register("application/json", BodyCodec::Json);
        table.register("text/plain", BodyCodec::Plain);
        table
    }

    pub fn register(&self, content_type: &str, codec: BodyCodec) {
        self.entries.write().insert(media_type(content_type), codec);
    }

    pub fn lookup(&self, content_type: Option<&str>) -> BodyCodec {
        content_type
            .and_then(|ct| self.entries.read().get(&media_type(ct)).copied())
            .unwrap_or(self.default)
    }
}

/// `Text/Plain; charset=utf-8` -> `text/plain`.
fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

// ─── Shared state ──────────────────────────────────────────

#[derive(Clone)]
pub struct HttpState {
    pub peer: Server,
    pub business: Arc<dyn Business>,
    pub codecs: Arc<BodyCodecTable>,
    pub require_auth: bool,
}

/// Builds the HTTP app.
pub fn app(state: HttpState, allow_cross: bool) -> Router {
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/{*path}", post(call_handler))
        .with_state(state);
    if allow_cross {
        app.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
    } else {
        app
    }
}

// ─── Axum handlers ─────────────────────────────────────────

async fn health_handler() -> &'static str {
    "ok"
}

async fn call_handler(
    State(state): State<HttpState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path(path): Path<String>,
    Query(mut query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let token = bearer_token(&headers).or_else(|| query.get(ACCESS_TOKEN_PARAM).cloned());
    query.remove(ACCESS_TOKEN_PARAM);

    if state.require_auth {
        let token = token.unwrap_or_default();
        if let Err(status) = state.business.authenticate(&token, None).await {
            debug!(%remote, %status, "HTTP auth rejected");
            return status_response(&status);
        }
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let codec = state.codecs.lookup(content_type);
    let body = match codec.decode(&body) {
        Ok(body) => body,
        Err(e) => return status_response(&Status::bad_request(e.to_string())),
    };

    let ctx = CallCtx {
        path: format!("/{path}"),
        body,
        codec,
        meta: query.into_iter().collect::<BTreeMap<_, _>>(),
        session: None,
    };
    debug!(%remote, path = %ctx.path, codec = %codec.id(), "HTTP call");
    match state.peer.dispatch_call(ctx).await {
        Ok(value) => (
            [(header::CONTENT_TYPE, HeaderValue::from_static(codec.content_type()))],
            codec.encode(&value),
        )
            .into_response(),
        Err(status) => status_response(&status),
    }
}

// ─── Helpers ───────────────────────────────────────────────

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
}

fn status_response(status: &Status) -> Response {
    let code = HttpStatus::from_u16(status.code.http_status())
        .unwrap_or(HttpStatus::INTERNAL_SERVER_ERROR);
    (code, Json(status)).into_response()
}

// ─── Tests ─────────────────────────────────────────────────
