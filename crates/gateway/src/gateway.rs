//! Gateway context and transport listener orchestration.
//!
//! [`Gateway`] owns every shared piece (peers, proxy selector, codec table,
//! business strategy) and hands them to the transports explicitly.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use proto::{BodyCodec, GatewayError};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::auth::{AuthHandshake, PushGate};
use crate::business::{Business, DefaultBusiness};
use crate::client::BackendClient;
use crate::config::{GatewayConfig, ListenAddr};
use crate::discovery::{Discovery, MemoryDiscovery};
use crate::inner;
use crate::proxy::{ProxyCall, ProxySelector};
use crate::router::Router;
use crate::server::{Listener, Server};
use crate::transport::{BodyCodecTable, WebListener, http, websocket};

type RouteSetup = Box<dyn FnOnce(&mut Router) + Send>;

/// Configures a [`Gateway`] before it is built.
pub struct GatewayBuilder {
    config: GatewayConfig,
    business: Option<Arc<dyn Business>>,
    discovery: Option<Arc<dyn Discovery>>,
    outer_routes: Vec<RouteSetup>,
}

impl GatewayBuilder {
    /// Replaces [`DefaultBusiness`].
    pub fn business(mut self, business: Arc<dyn Business>) -> Self {
        self.business = Some(business);
        self
    }

    /// Replaces the static in-memory registry built from config.
    pub fn discovery(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Registers local handlers on the outer peer. Unmatched calls are
    /// proxied to backends.
    pub fn outer_routes(mut self, setup: impl FnOnce(&mut Router) + Send + 'static) -> Self {
        self.outer_routes.push(Box::new(setup));
        self
    }

    /// Validates config and builds both peers. TLS for the socket peers is
    /// loaded here.
    pub fn build(self) -> Result<Gateway, GatewayError> {
        let config = self.config;
        config.check()?;

        let business: Arc<dyn Business> = match self.business {
            Some(business) => business,
            None => Arc::new(DefaultBusiness::new()),
        };
        let discovery: Arc<dyn Discovery> = match self.discovery {
            Some(discovery) => discovery,
            None => Arc::new(MemoryDiscovery::from_config(&config.discovery)),
        };
        let proxy = ProxySelector::new(discovery.clone(), business.clone());
        let client = Arc::new(BackendClient::new(config.inner_client.clone()));

        let mut outer = Server::builder("outer", &config.outer_socket)?;
        outer
            .plugin_left(Arc::new(AuthHandshake::new(business.clone())))
            .plugin_left(Arc::new(PushGate::new(business.clone())));
        outer
            .router()
            .set_unknown_call(ProxyCall::new(proxy.clone(), client));
        for setup in self.outer_routes {
            setup(outer.router());
        }
        let outer = outer.build()?;

        let inner = if config.enable_inner {
            let mut inner = Server::builder("inner", &config.inner_socket)?;
            inner::register_routes(
                inner.router(),
                outer.clone(),
                discovery.clone(),
                config.discovery.lease_ttl,
            );
            Some(inner.build()?)
        } else {
            None
        };

        let default_codec = outer.config().default_codec;
        Ok(Gateway {
            config,
            business,
            discovery,
            proxy,
            codecs: Arc::new(BodyCodecTable::new(default_codec)),
            outer,
            inner,
        })
    }
}

/// The running gateway's shared context.
pub struct Gateway {
    config: GatewayConfig,
    business: Arc<dyn Business>,
    discovery: Arc<dyn Discovery>,
    proxy: Arc<ProxySelector>,
    codecs: Arc<BodyCodecTable>,
    outer: Server,
    inner: Option<Server>,
}

/// Bound addresses and tasks of a started gateway.
pub struct RunningGateway {
    pub socket_addr: Option<ListenAddr>,
    pub http_addr: Option<SocketAddr>,
    pub websocket_addr: Option<SocketAddr>,
    pub inner_addr: Option<ListenAddr>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningGateway {
    /// Number of spawned listener and watch tasks.
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

impl Gateway {
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder {
            config,
            business: None,
            discovery: None,
            outer_routes: Vec::new(),
        }
    }

    /// Gateway with the default business strategy and static discovery.
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Client-facing peer shared by socket and WebSocket sessions.
    pub fn outer(&self) -> &Server {
        &self.outer
    }

    pub fn inner(&self) -> Option<&Server> {
        self.inner.as_ref()
    }

    pub fn proxy(&self) -> &Arc<ProxySelector> {
        &self.proxy
    }

    pub fn discovery(&self) -> &Arc<dyn Discovery> {
        &self.discovery
    }

    /// Maps an HTTP content type to a body codec.
    pub fn register_body_codec(&self, content_type: &str, codec: BodyCodec) {
        self.codecs.register(content_type, codec);
    }

    /// Binds every enabled listener, then spawns their loops. Nothing is
    /// served unless every bind succeeds.
    pub async fn start(&self) -> Result<RunningGateway, GatewayError> {
        let socket = if self.config.enable_socket {
            Some(self.outer.listen().await?)
        } else {
            None
        };
        let http = if self.config.enable_http {
            let state = http::HttpState {
                peer: self.outer.clone(),
                business: self.business.clone(),
                codecs: self.codecs.clone(),
                require_auth: self.config.outer_http.require_auth,
            };
            let app = http::app(state, self.config.outer_http.allow_cross);
            Some(WebListener::bind("http", &self.config.outer_http.endpoint()?, app).await?)
        } else {
            None
        };
        let websocket = if self.config.enable_websocket {
            let ws_cfg = &self.config.outer_websocket;
            let app = websocket::app(self.outer.clone(), &ws_cfg.upgrade_path());
            Some(WebListener::bind("websocket", &ws_cfg.endpoint()?, app).await?)
        } else {
            None
        };
        let inner = match &self.inner {
            Some(server) => Some(server.listen().await?),
            None => None,
        };

        let mut running = RunningGateway {
            socket_addr: socket.as_ref().map(|l| l.local_addr().clone()),
            http_addr: http.as_ref().map(WebListener::local_addr),
            websocket_addr: websocket.as_ref().map(WebListener::local_addr),
            inner_addr: inner.as_ref().map(|l| l.local_addr().clone()),
            tasks: Vec::new(),
        };
        if let Some(listener) = socket {
            running.tasks.push(spawn_peer("socket", listener));
        }
        if let Some(listener) = inner {
            running.tasks.push(spawn_peer("inner", listener));
        }
        for listener in [http, websocket].into_iter().flatten() {
            running.tasks.push(spawn_web(listener));
        }
        running.tasks.push(self.proxy.spawn_watch());

        info!(
            socket = ?running.socket_addr.as_ref().map(ToString::to_string),
            http = ?running.http_addr,
            websocket = ?running.websocket_addr,
            inner = ?running.inner_addr.as_ref().map(ToString::to_string),
            "Gateway started"
        );
        Ok(running)
    }

    /// Starts the gateway and parks the calling task.
    pub async fn run(&self) -> Result<Infallible, GatewayError> {
        let _running = self.start().await?;
        Ok(std::future::pending::<Infallible>().await)
    }
}

fn spawn_peer(transport: &'static str, listener: Listener) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = listener.serve().await {
            error!(transport, error = %e, "Listener stopped");
        }
    })
}

fn spawn_web(listener: WebListener) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = listener.serve().await {
            error!(error = %e, "Web listener stopped");
        }
    })
}
