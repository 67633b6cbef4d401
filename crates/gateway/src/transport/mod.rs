//! Outer transports. Socket sessions use the peer's own accept loop; HTTP
//! and WebSocket are served by axum, optionally behind TLS.

pub mod http;
pub mod websocket;

use std::net::SocketAddr;

use axum::Extension;
use axum::extract::ConnectInfo;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use proto::GatewayError;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::config::WebEndpoint;
use crate::server::accept_failed;
use crate::tls::load_acceptor;

pub use http::BodyCodecTable;

/// A bound axum listener that has not started serving yet.
pub struct WebListener {
    name: &'static str,
    listener: TcpListener,
    local: SocketAddr,
    tls: Option<TlsAcceptor>,
    app: axum::Router,
}

impl WebListener {
    /// Loads TLS (if configured) and binds. Both failures are fatal.
    pub async fn bind(
        name: &'static str,
        endpoint: &WebEndpoint,
        app: axum::Router,
    ) -> Result<Self, GatewayError> {
        let tls = endpoint.tls.as_ref().map(load_acceptor).transpose()?;
        let bind_err = |e: std::io::Error| GatewayError::Bind {
            addr: endpoint.addr.to_string(),
            reason: e.to_string(),
        };
        let listener = TcpListener::bind(endpoint.addr).await.map_err(bind_err)?;
        let local = listener.local_addr().map_err(bind_err)?;
        info!(transport = name, listen = %local, tls = tls.is_some(), "Listening");
        Ok(Self {
            name,
            listener,
            local,
            tls,
            app,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub async fn serve(self) -> Result<(), GatewayError> {
        let Self {
            name,
            listener,
            tls,
            app,
            ..
        } = self;
        let Some(acceptor) = tls else {
            return axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .await
                .map_err(|e| GatewayError::Transport(format!("{name} server: {e}")));
        };

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    accept_failed(name, &e).await;
                    continue;
                }
            };
            let acceptor = acceptor.clone();
            let app = app.clone().layer(Extension(ConnectInfo(peer_addr)));
            tokio::spawn(async move {
                match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        let io = TokioIo::new(tls_stream);
                        let svc = TowerToHyperService::new(app);
                        let conn = auto::Builder::new(TokioExecutor::new());
                        if let Err(e) = conn.serve_connection_with_upgrades(io, svc).await {
                            warn!(transport = name, peer = %peer_addr, error = %e, "TLS connection error");
                        }
                    }
                    Err(e) => {
                        warn!(transport = name, peer = %peer_addr, error = %e, "TLS handshake failed");
                    }
                }
            });
        }
    }
}
