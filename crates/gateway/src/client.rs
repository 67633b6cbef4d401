//! Forwarding client for backend services.
//!
//! Keeps one framed TCP connection per backend address and multiplexes calls
//! over it. A reader task per connection routes replies to callers by `seq`;
//! when the connection drops every pending call fails and the next call
//! reconnects.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use proto::{Frame, FrameKind, GatewayError};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::wire::{FrameRead, FrameWrite, split_stream};

/// Calls waiting for a reply on one connection.
#[derive(Default)]
struct Pending {
    calls: DashMap<u64, oneshot::Sender<Frame>>,
    closed: AtomicBool,
}

impl Pending {
    /// Marks the connection dead and fails every waiting call.
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.calls.clear();
    }
}

/// Removes its call from the pending table when dropped.
struct PendingCall<'a> {
    pending: &'a Pending,
    seq: u64,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        self.pending.calls.remove(&self.seq);
    }
}

struct BackendConn {
    writer: Mutex<Box<dyn FrameWrite>>,
    pending: Arc<Pending>,
    reader: JoinHandle<()>,
}

impl BackendConn {
    fn open(addr: &str, stream: TcpStream) -> Self {
        let (reader, writer) = split_stream(stream);
        let pending = Arc::new(Pending::default());
        let reader = tokio::spawn(route_replies(addr.to_string(), reader, pending.clone()));
        Self {
            writer: Mutex::new(writer),
            pending,
            reader,
        }
    }

    fn is_closed(&self) -> bool {
        self.pending.closed.load(Ordering::SeqCst)
    }

    fn track(&self, seq: u64, tx: oneshot::Sender<Frame>) -> PendingCall<'_> {
        self.pending.calls.insert(seq, tx);
        PendingCall {
            pending: &self.pending,
            seq,
        }
    }
}

impl Drop for BackendConn {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

type Slot = Arc<Mutex<Option<Arc<BackendConn>>>>;

pub struct BackendClient {
    cfg: ClientConfig,
    conns: DashMap<String, Slot>,
    seq: AtomicU64,
}

impl BackendClient {
    pub fn new(cfg: ClientConfig) -> Self {
        Self {
            cfg,
            conns: DashMap::new(),
            seq: AtomicU64::new(0),
        }
    }

    /// Sends `frame` as a call to `addr` and waits for its reply.
    pub async fn call(&self, addr: &str, mut frame: Frame) -> Result<Frame, GatewayError> {
        let conn = self.conn(addr).await?;
        frame.kind = FrameKind::Call;
        frame.seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;

        let (tx, rx) = oneshot::channel();
        let _pending = conn.track(frame.seq, tx);
        // The reader may have failed between lookup and registration.
        if conn.is_closed() {
            return Err(backend_err(addr, "backend closed the connection"));
        }

        let written = conn.writer.lock().await.write_frame(&frame).await;
        if let Err(e) = written {
            conn.pending.close();
            return Err(backend_err(addr, e));
        }

        let reply = match non_zero(self.cfg.call_timeout) {
            Some(limit) => timeout(limit, rx)
                .await
                .map_err(|_| backend_err(addr, format!("no reply within {limit:?}")))?,
            None => rx.await,
        };
        reply.map_err(|_| backend_err(addr, "backend closed the connection"))
    }

    /// Live connection to `addr`, dialing a new one when none is usable.
    async fn conn(&self, addr: &str) -> Result<Arc<BackendConn>, GatewayError> {
        let slot = self.conns.entry(addr.to_string()).or_default().clone();
        let mut guard = slot.lock().await;
        if let Some(conn) = guard.as_ref().filter(|conn| !conn.is_closed()) {
            return Ok(conn.clone());
        }
        let conn = Arc::new(self.connect(addr).await?);
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn connect(&self, addr: &str) -> Result<BackendConn, GatewayError> {
        let connecting = TcpStream::connect(addr);
        let stream = match non_zero(self.cfg.connect_timeout) {
            Some(limit) => timeout(limit, connecting)
                .await
                .map_err(|_| backend_err(addr, format!("connect timed out after {limit:?}")))?,
            None => connecting.await,
        }
        .map_err(|e| backend_err(addr, e))?;
        let _ = stream.set_nodelay(true);
        debug!(addr, "Backend connection established");
        Ok(BackendConn::open(addr, stream))
    }

    /// Number of backend addresses with a connection slot.
    pub fn pooled(&self) -> usize {
        self.conns.len()
    }
}

async fn route_replies(addr: String, mut reader: Box<dyn FrameRead>, pending: Arc<Pending>) {
    loop {
        match reader.read_frame().await {
            Ok(Some(frame)) if frame.kind == FrameKind::Reply => {
                match pending.calls.remove(&frame.seq) {
                    Some((_, tx)) => {
                        let _ = tx.send(frame);
                    }
                    None => debug!(addr, seq = frame.seq, "Dropping reply with no waiting call"),
                }
            }
            Ok(Some(other)) => {
                debug!(addr, seq = other.seq, kind = ?other.kind, "Skipping unrelated backend frame");
            }
            Ok(None) => {
                debug!(addr, "Backend closed the connection");
                break;
            }
            Err(e) => {
                warn!(addr, error = %e, "Backend connection failed");
                break;
            }
        }
    }
    pending.close();
}

fn non_zero(d: Duration) -> Option<Duration> {
    (!d.is_zero()).then_some(d)
}

fn backend_err(addr: &str, reason: impl ToString) -> GatewayError {
    GatewayError::Backend {
        addr: addr.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use proto::StatusCode;
    use serde_json::json;
    use tokio::net::TcpListener;

    use super::*;

    /// Backend that echoes call bodies back and counts accepted connections.
    async fn echo_backend() -> (String, Arc<AtomicU64>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let accepted = Arc::new(AtomicU64::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let (mut reader, mut writer) = split_stream(stream);
                    while let Ok(Some(frame)) = reader.read_frame().await {
                        let reply = frame.reply(Ok(frame.body.clone()));
                        if writer.write_frame(&reply).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        (addr, accepted)
    }

    #[tokio::test]
    async fn calls_reuse_one_connection_per_backend() {
        let (addr, accepted) = echo_backend().await;
        let client = BackendClient::new(ClientConfig::default());

        for n in 0..3 {
            let reply = client
                .call(&addr, Frame::call(0, "/orders/create", json!({"n": n})))
                .await
                .expect("reply");
            assert_eq!(reply.into_result().expect("ok"), json!({"n": n}));
        }
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(client.pooled(), 1);
    }

    /// Backend that answers each call on its own task, holding `/slow` paths
    /// for 800ms.
    async fn delaying_backend() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut reader, writer) = split_stream(stream);
                    let writer = Arc::new(Mutex::new(writer));
                    while let Ok(Some(frame)) = reader.read_frame().await {
                        let writer = writer.clone();
                        tokio::spawn(async move {
                            if frame.path.ends_with("/slow") {
                                tokio::time::sleep(Duration::from_millis(800)).await;
                            }
                            let reply = frame.reply(Ok(json!(frame.path)));
                            let _ = writer.lock().await.write_frame(&reply).await;
                        });
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn slow_call_does_not_hold_up_other_calls() {
        let addr = delaying_backend().await;
        let client = Arc::new(BackendClient::new(ClientConfig::default()));
        client
            .call(&addr, Frame::call(0, "/orders/fast", json!({})))
            .await
            .expect("warm up");

        let slow = {
            let client = client.clone();
            let addr = addr.clone();
            tokio::spawn(async move {
                client
                    .call(&addr, Frame::call(0, "/orders/slow", json!({})))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = Instant::now();
        let fast = client
            .call(&addr, Frame::call(0, "/orders/fast", json!({})))
            .await
            .expect("fast reply");
        assert!(started.elapsed() < Duration::from_millis(300));
        assert_eq!(fast.into_result().expect("ok"), json!("/orders/fast"));

        let slow = slow.await.expect("join").expect("slow reply");
        assert_eq!(slow.into_result().expect("ok"), json!("/orders/slow"));
        assert_eq!(client.pooled(), 1);
    }

    #[tokio::test]
    async fn dropped_connection_fails_pending_call_and_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let accepted = Arc::new(AtomicU64::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let first = counter.fetch_add(1, Ordering::SeqCst) == 0;
                tokio::spawn(async move {
                    let (mut reader, mut writer) = split_stream(stream);
                    while let Ok(Some(frame)) = reader.read_frame().await {
                        // The first connection hangs up instead of replying.
                        if first {
                            return;
                        }
                        let reply = frame.reply(Ok(frame.body.clone()));
                        if writer.write_frame(&reply).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        let client = BackendClient::new(ClientConfig::default());
        let started = Instant::now();
        let err = client
            .call(&addr, Frame::call(0, "/orders/create", json!(1)))
            .await
            .expect_err("connection dropped");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(err.to_status().code, StatusCode::BadGateway);

        let reply = client
            .call(&addr, Frame::call(0, "/orders/create", json!(2)))
            .await
            .expect("reconnected");
        assert_eq!(reply.into_result().expect("ok"), json!(2));
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unreachable_backend_maps_to_bad_gateway() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        drop(listener);

        let client = BackendClient::new(ClientConfig::default());
        let err = client
            .call(&addr, Frame::call(0, "/orders/create", json!({})))
            .await
            .expect_err("nothing listening");
        assert!(matches!(err, GatewayError::Backend { .. }));
        assert_eq!(err.to_status().code, StatusCode::BadGateway);
    }

    #[tokio::test]
    async fn silent_backend_hits_call_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let client = BackendClient::new(ClientConfig {
            call_timeout: Duration::from_millis(50),
            ..ClientConfig::default()
        });
        let err = client
            .call(&addr, Frame::call(0, "/slow", json!({})))
            .await
            .expect_err("timeout");
        assert!(err.to_string().contains("no reply within"));
    }
}
