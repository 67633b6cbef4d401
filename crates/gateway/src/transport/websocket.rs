//! WebSocket transport: one JSON frame per text message, served through the
//! outer peer's session pipeline.

use std::net::SocketAddr;

use async_trait::async_trait;
use axum::{
    Router,
    extract::{ConnectInfo, State, WebSocketUpgrade, ws},
    response::IntoResponse,
    routing::get,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use proto::{Frame, GatewayError, ProtoError, TransportKind};
use tracing::{debug, warn};

use crate::server::Server;
use crate::wire::{FrameRead, FrameWrite, MAX_MESSAGE_LEN, decode_frame};

/// Builds the WebSocket app with the upgrade route at `path`.
pub fn app(peer: Server, path: &str) -> Router {
    Router::new()
        .route(path, get(ws_handler))
        .with_state(peer)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(peer): State<Server>,
) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_LEN)
        .on_upgrade(move |socket| handle_ws(socket, remote, peer))
}

async fn handle_ws(socket: ws::WebSocket, remote: SocketAddr, peer: Server) {
    let (sink, stream) = socket.split();
    let reader = Box::new(WsFrameReader { stream });
    let writer = Box::new(WsFrameWriter { sink });
    if let Err(e) = peer
        .serve_conn(reader, writer, TransportKind::WebSocket, remote.to_string())
        .await
    {
        warn!(%remote, error = %e, "WebSocket session ended with error");
    }
}

struct WsFrameReader {
    stream: SplitStream<ws::WebSocket>,
}

#[async_trait]
impl FrameRead for WsFrameReader {
    async fn read_frame(&mut self) -> Result<Option<Frame>, GatewayError> {
        while let Some(msg) = self.stream.next().await {
            let msg = msg.map_err(|e| GatewayError::Transport(e.to_string()))?;
            match msg {
                ws::Message::Text(text) => return decode_frame(text.as_str().as_bytes()).map(Some),
                ws::Message::Binary(bytes) => return decode_frame(&bytes).map(Some),
                ws::Message::Close(_) => return Ok(None),
                ws::Message::Ping(_) | ws::Message::Pong(_) => {
                    debug!("WebSocket control message");
                }
            }
        }
        Ok(None)
    }
}

struct WsFrameWriter {
    sink: SplitSink<ws::WebSocket, ws::Message>,
}

#[async_trait]
impl FrameWrite for WsFrameWriter {
    async fn write_frame(&mut self, frame: &Frame) -> Result<(), GatewayError> {
        let json = serde_json::to_string(frame)
            .map_err(|e| ProtoError::Serialization(format!("Serialize error: {e}")))?;
        if json.len() > MAX_MESSAGE_LEN {
            return Err(ProtoError::FrameTooLarge(json.len()).into());
        }
        self.sink
            .send(ws::Message::Text(json.into()))
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))
    }

    async fn shutdown(&mut self) {
        let _ = self.sink.close().await;
    }
}
