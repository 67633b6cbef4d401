//! Socket peer: session lifecycle, call dispatch, push delivery and the
//! framed TCP/unix accept loop.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use proto::{Frame, FrameKind, GatewayError, SessionId, Status, StatusCode, TransportKind};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::config::{ListenAddr, PeerConfig, SrvConfig};
use crate::plugin::{Handshake, HeartbeatPong, Plugin, PluginContainer, PushCtx};
use crate::router::{CallCtx, Router};
use crate::session::{Session, SessionTable};
use crate::tls::load_acceptor;
use crate::wire::{FrameRead, FrameWrite, split_stream};

/// Frames a session may have queued for its writer.
const OUTBOUND_QUEUE: usize = 64;

/// Pause after a failed accept before trying again.
pub(crate) const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Collects routes and plugins before a [`Server`] is frozen.
pub struct ServerBuilder {
    name: String,
    cfg: PeerConfig,
    router: Router,
    plugins: PluginContainer,
}

impl ServerBuilder {
    pub fn router(&mut self) -> &mut Router {
        &mut self.router
    }

    pub fn plugin_left(&mut self, plugin: Arc<dyn Plugin>) -> &mut Self {
        self.plugins.append_left(plugin);
        self
    }

    pub fn plugin_right(&mut self, plugin: Arc<dyn Plugin>) -> &mut Self {
        self.plugins.append_right(plugin);
        self
    }

    /// Validates plugins and loads TLS; errors are fatal.
    pub fn build(self) -> Result<Server, GatewayError> {
        self.plugins.validate()?;
        let tls = self.cfg.tls.as_ref().map(load_acceptor).transpose()?;
        let plugin_names: Vec<String> = self.plugins.records().into_iter().map(|r| r.name).collect();
        info!(
            peer = %self.name,
            listen = %self.cfg.listen,
            tls = tls.is_some(),
            plugins = ?plugin_names,
            "Peer built"
        );
        let (closed, _) = watch::channel(false);
        Ok(Server {
            inner: Arc::new(ServerInner {
                name: self.name,
                cfg: self.cfg,
                router: self.router,
                plugins: self.plugins,
                sessions: SessionTable::new(),
                tls,
                closed,
            }),
        })
    }
}

struct ServerInner {
    name: String,
    cfg: PeerConfig,
    router: Router,
    plugins: PluginContainer,
    sessions: SessionTable,
    tls: Option<TlsAcceptor>,
    closed: watch::Sender<bool>,
}

/// Handle to a running peer. Cheap to clone.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Starts building a peer from raw config. The heartbeat responder is
    /// appended left when heartbeat is enabled.
    pub fn builder(name: impl Into<String>, cfg: &SrvConfig) -> Result<ServerBuilder, GatewayError> {
        let cfg = cfg.peer_config()?;
        let mut plugins = PluginContainer::new();
        if cfg.enable_heartbeat {
            plugins.append_left(Arc::new(HeartbeatPong));
        }
        Ok(ServerBuilder {
            name: name.into(),
            cfg,
            router: Router::new(),
            plugins,
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &PeerConfig {
        &self.inner.cfg
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    pub fn plugins(&self) -> &PluginContainer {
        &self.inner.plugins
    }

    pub fn count_session(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn get_session(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.inner.sessions.get(id)
    }

    /// Visits live sessions until `f` returns `false`.
    pub fn range_session(&self, f: impl FnMut(&Arc<Session>) -> bool) {
        self.inner.sessions.range(f)
    }

    /// Pushes `body` to session `id` through the pre-write-push hooks.
    pub async fn push(&self, id: &SessionId, path: &str, body: Value) -> Result<(), Status> {
        let session = self
            .get_session(id)
            .ok_or_else(|| GatewayError::SessionNotFound(id.to_string()).to_status())?;
        let frame = Frame::push(path, body).with_codec(self.inner.cfg.default_codec);
        self.push_to(&session, frame).await
    }

    pub async fn push_to(&self, session: &Session, frame: Frame) -> Result<(), Status> {
        self.inner.plugins.run_pre_write_push(&PushCtx {
            session,
            frame: &frame,
        })?;
        if self.inner.cfg.print_detail {
            debug!(peer = %self.inner.name, session_id = %session.id(), path = %frame.path, body = %frame.body, "Push");
        }
        session.send(frame).await.map_err(|e| e.to_status())
    }

    /// Closes session `id`; `false` when no such session is live.
    pub fn kick(&self, id: &SessionId) -> bool {
        match self.get_session(id) {
            Some(session) => {
                info!(peer = %self.inner.name, session_id = %id, "Kicking session");
                session.close();
                true
            }
            None => false,
        }
    }

    /// Stops accept loops and closes every live session.
    pub fn close(&self) {
        self.inner.closed.send_replace(true);
        self.inner.sessions.range(|session| {
            session.close();
            true
        });
        info!(peer = %self.inner.name, "Peer closed");
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Runs a call through the router under the context max age.
    pub async fn dispatch_call(&self, ctx: CallCtx) -> Result<Value, Status> {
        let path = ctx.path.clone();
        let Some(handler) = self.inner.router.call_handler(&path) else {
            debug!(peer = %self.inner.name, %path, "No call handler");
            return Err(Status::not_found(format!("no handler for {path}")));
        };
        if self.inner.cfg.print_detail {
            debug!(peer = %self.inner.name, %path, body = %ctx.body, meta = ?ctx.meta, "Call");
        }
        let start = Instant::now();
        let result = self.within_context_age(&path, handler.call(ctx)).await;
        self.record_cost("call", &path, start.elapsed(), result.as_ref().err());
        result
    }

    async fn dispatch_push(&self, ctx: CallCtx) {
        let path = ctx.path.clone();
        let Some(handler) = self.inner.router.push_handler(&path) else {
            debug!(peer = %self.inner.name, %path, "No push handler, dropping");
            return;
        };
        if self.inner.cfg.print_detail {
            debug!(peer = %self.inner.name, %path, body = %ctx.body, "Inbound push");
        }
        let start = Instant::now();
        let result = self
            .within_context_age(&path, async {
                handler.push(ctx).await;
                Ok::<(), Status>(())
            })
            .await;
        self.record_cost("push", &path, start.elapsed(), result.as_ref().err());
    }

    async fn within_context_age<T>(
        &self,
        path: &str,
        fut: impl Future<Output = Result<T, Status>>,
    ) -> Result<T, Status> {
        match self.inner.cfg.context_age {
            Some(age) => timeout(age, fut).await.unwrap_or_else(|_| {
                Err(Status::new(
                    StatusCode::Timeout,
                    format!("{path} exceeded {}", humantime::format_duration(age)),
                ))
            }),
            None => fut.await,
        }
    }

    fn record_cost(&self, kind: &'static str, path: &str, cost: Duration, failed: Option<&Status>) {
        let peer = self.inner.name.as_str();
        let code = failed.map_or(StatusCode::Ok, |status| status.code);
        if self.inner.cfg.slow_comet.is_some_and(|slow| cost > slow) {
            warn!(peer, kind, path, ?cost, ?code, "Slow operation");
        } else if self.inner.cfg.count_time {
            info!(peer, kind, path, ?cost, ?code, "Handled");
        } else {
            debug!(peer, kind, path, ?code, "Handled");
        }
    }

    /// Serves one already-accepted connection until it ends.
    ///
    /// Runs the auth handshake first when an auth plugin is installed, then
    /// dispatches frames. Each call runs on its own task.
    pub async fn serve_conn(
        &self,
        mut reader: Box<dyn FrameRead>,
        writer: Box<dyn FrameWrite>,
        transport: TransportKind,
        remote: String,
    ) -> Result<(), GatewayError> {
        if self.is_closed() {
            let mut writer = writer;
            writer.shutdown().await;
            return Err(GatewayError::Closed);
        }

        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let session = Session::new(transport, remote, tx);
        let write_task = tokio::spawn(write_loop(writer, rx, session.clone()));
        self.inner.sessions.insert(session.clone());
        info!(
            peer = %self.inner.name,
            session_id = %session.id(),
            transport = %transport,
            remote = session.remote_addr(),
            "Session opened"
        );

        let run = self.run_session(&session, &mut *reader);
        let result = match self.inner.cfg.session_age {
            Some(age) => match timeout(age, run).await {
                Ok(result) => result,
                Err(_) => {
                    info!(session_id = %session.id(), ?age, "Session reached max age");
                    Ok(())
                }
            },
            None => run.await,
        };

        self.inner.sessions.remove(session.id());
        session.close();
        let _ = write_task.await;
        info!(
            peer = %self.inner.name,
            session_id = %session.id(),
            age = ?session.age(),
            "Session closed"
        );
        result
    }

    async fn run_session(&self, session: &Arc<Session>, reader: &mut dyn FrameRead) -> Result<(), GatewayError> {
        tokio::select! {
            _ = wait_closed(session.closed_signal()) => {
                debug!(session_id = %session.id(), "Session closed locally");
                Ok(())
            }
            result = self.session_loop(session, reader) => result,
        }
    }

    async fn session_loop(&self, session: &Arc<Session>, reader: &mut dyn FrameRead) -> Result<(), GatewayError> {
        if self.inner.plugins.auth_check().is_some() {
            self.handshake(session, &mut *reader).await?;
        } else {
            let _ = session.promote(String::new());
        }
        while let Some(frame) = reader.read_frame().await? {
            self.handle_frame(session, frame).await?;
        }
        debug!(session_id = %session.id(), "Remote closed the connection");
        Ok(())
    }

    async fn handshake(&self, session: &Arc<Session>, reader: &mut dyn FrameRead) -> Result<(), GatewayError> {
        let Some(auth) = self.inner.plugins.auth_check() else {
            return Ok(());
        };
        let mut received = None;
        let outcome = {
            let check = auth.check(session, Handshake::new(reader, &mut received));
            self.within_context_age("handshake", check).await
        };

        match outcome {
            Ok(auth_info) => {
                if let Err(state) = session.promote(auth_info) {
                    return Err(GatewayError::Auth(format!("cannot promote session in state {state:?}")));
                }
                if let Some(frame) = received {
                    session
                        .send(frame.reply(Ok(Value::String(session.id().to_string()))))
                        .await?;
                }
                Ok(())
            }
            Err(status) => {
                let _ = session.reject();
                warn!(
                    peer = %self.inner.name,
                    session_id = %session.id(),
                    remote = session.remote_addr(),
                    %status,
                    "Handshake rejected"
                );
                if let Some(frame) = received {
                    let _ = session.send(frame.reply(Err(status.clone()))).await;
                }
                Err(GatewayError::Auth(status.message))
            }
        }
    }

    async fn handle_frame(&self, session: &Arc<Session>, frame: Frame) -> Result<(), GatewayError> {
        match frame.kind {
            FrameKind::Call => {
                let server = self.clone();
                let session = session.clone();
                tokio::spawn(async move {
                    let head = Frame::call(frame.seq, frame.path.clone(), Value::Null).with_codec(frame.codec);
                    let result = server
                        .dispatch_call(CallCtx::from_frame(frame, Some(session.clone())))
                        .await;
                    if let Err(e) = session.send(head.reply(result)).await {
                        debug!(session_id = %session.id(), seq = head.seq, error = %e, "Reply dropped");
                    }
                });
            }
            FrameKind::Push => {
                let server = self.clone();
                let session = session.clone();
                tokio::spawn(async move {
                    server
                        .dispatch_push(CallCtx::from_frame(frame, Some(session)))
                        .await;
                });
            }
            FrameKind::Heartbeat => {
                let result = match self.inner.plugins.run_heartbeat(session) {
                    Some(result) => result.map(|()| Value::Null),
                    None => Err(Status::not_found("heartbeat is not enabled")),
                };
                session.send(frame.reply(result)).await?;
            }
            FrameKind::Auth => {
                session
                    .send(frame.reply(Err(Status::bad_request("session is already authenticated"))))
                    .await?;
            }
            FrameKind::Reply => {
                debug!(session_id = %session.id(), seq = frame.seq, "Ignoring reply frame from client");
            }
        }
        Ok(())
    }

    /// Binds the peer's own socket listener.
    pub async fn listen(&self) -> Result<Listener, GatewayError> {
        let (socket, local) = match &self.inner.cfg.listen {
            ListenAddr::Inet(addr) => {
                let listener = TcpListener::bind(addr).await.map_err(|e| bind_err(addr, e))?;
                let local = listener.local_addr().map_err(|e| bind_err(addr, e))?;
                (BoundSocket::Tcp(listener), ListenAddr::Inet(local))
            }
            #[cfg(unix)]
            ListenAddr::Unix(path) => {
                clear_stale_socket(path);
                let listener = UnixListener::bind(path).map_err(|e| bind_err(path.display(), e))?;
                (BoundSocket::Unix(listener), ListenAddr::Unix(path.clone()))
            }
            #[cfg(not(unix))]
            ListenAddr::Unix(_) => {
                return Err(proto::ConfigError::invalid("network", "unix sockets need a unix platform").into());
            }
        };
        info!(
            peer = %self.inner.name,
            listen = %local,
            tls = self.inner.tls.is_some(),
            "Peer listening"
        );
        Ok(Listener {
            server: self.clone(),
            socket,
            local,
        })
    }

    /// Binds and runs the accept loop until [`Server::close`].
    pub async fn listen_and_serve(&self) -> Result<(), GatewayError> {
        self.listen().await?.serve().await
    }

    async fn serve_stream<S>(&self, stream: S, remote: String)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (reader, writer) = match &self.inner.tls {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(tls) => split_stream(tls),
                Err(e) => {
                    warn!(peer = %self.inner.name, %remote, error = %e, "TLS handshake failed");
                    return;
                }
            },
            None => split_stream(stream),
        };
        if let Err(e) = self
            .serve_conn(reader, writer, TransportKind::Socket, remote.clone())
            .await
        {
            warn!(peer = %self.inner.name, %remote, error = %e, "Session ended with error");
        }
    }
}

/// Resolves once `signal` reports closed or its sender is gone.
async fn wait_closed(mut signal: watch::Receiver<bool>) {
    let _ = signal.wait_for(|closed| *closed).await;
}

async fn write_loop(mut writer: Box<dyn FrameWrite>, mut rx: mpsc::Receiver<Frame>, session: Arc<Session>) {
    let closed = wait_closed(session.closed_signal());
    tokio::pin!(closed);
    loop {
        tokio::select! {
            biased;
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = writer.write_frame(&frame).await {
                    debug!(session_id = %session.id(), error = %e, "Write failed");
                    session.close();
                    break;
                }
            }
            _ = &mut closed => {
                // Flush what was queued before the close, e.g. a rejection reply.
                while let Ok(frame) = rx.try_recv() {
                    if writer.write_frame(&frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    writer.shutdown().await;
}

/// Removes a socket file left behind by a listener that is no longer
/// running. A path with a live listener is left for `bind` to reject.
#[cfg(unix)]
fn clear_stale_socket(path: &std::path::Path) {
    use std::os::unix::fs::FileTypeExt;

    let Ok(meta) = std::fs::symlink_metadata(path) else {
        return;
    };
    if !meta.file_type().is_socket() || std::os::unix::net::UnixStream::connect(path).is_ok() {
        return;
    }
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed stale socket file"),
        Err(e) => warn!(path = %path.display(), error = %e, "Could not remove stale socket file"),
    }
}

/// Logs a failed accept and holds the loop for [`ACCEPT_BACKOFF`].
pub(crate) async fn accept_failed(listener: &str, err: &(dyn std::fmt::Display + Sync)) {
    error!(listener, error = %err, "Accept failed");
    tokio::time::sleep(ACCEPT_BACKOFF).await;
}

fn bind_err(addr: impl std::fmt::Display, e: std::io::Error) -> GatewayError {
    GatewayError::Bind {
        addr: addr.to_string(),
        reason: e.to_string(),
    }
}

enum BoundSocket {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

enum Accepted {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl BoundSocket {
    async fn accept(&self, local: &ListenAddr) -> std::io::Result<(Accepted, String)> {
        match self {
            Self::Tcp(listener) => {
                let (stream, remote) = listener.accept().await?;
                Ok((Accepted::Tcp(stream), remote.to_string()))
            }
            #[cfg(unix)]
            Self::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok((Accepted::Unix(stream), local.to_string()))
            }
        }
    }
}

/// A bound peer socket that has not started accepting yet.
pub struct Listener {
    server: Server,
    socket: BoundSocket,
    local: ListenAddr,
}

impl Listener {
    /// Bound address; reports the real port when `:0` was configured.
    pub fn local_addr(&self) -> &ListenAddr {
        &self.local
    }

    /// Accept loop. Runs until the peer is closed.
    pub async fn serve(self) -> Result<(), GatewayError> {
        let stop = wait_closed(self.server.inner.closed.subscribe());
        tokio::pin!(stop);
        info!(peer = %self.server.name(), listen = %self.local, "Accept loop started");
        loop {
            let accepted = tokio::select! {
                _ = &mut stop => break,
                accepted = self.socket.accept(&self.local) => accepted,
            };
            match accepted {
                Ok((stream, remote)) => {
                    let server = self.server.clone();
                    tokio::spawn(async move {
                        match stream {
                            Accepted::Tcp(stream) => {
                                let _ = stream.set_nodelay(true);
                                server.serve_stream(stream, remote).await
                            }
                            #[cfg(unix)]
                            Accepted::Unix(stream) => server.serve_stream(stream, remote).await,
                        }
                    });
                }
                Err(e) => accept_failed(self.server.name(), &e).await,
            }
        }
        #[cfg(unix)]
        if let ListenAddr::Unix(path) = &self.local {
            drop(self.socket);
            if let Err(e) = std::fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "Could not remove socket file");
            }
        }
        info!(peer = %self.server.name(), "Accept loop stopped");
        Ok(())
    }
}
