//! Frame I/O: transport-neutral read/write traits and the length-prefixed
//! JSON framing used by socket connections.

use async_trait::async_trait;
use proto::{Frame, GatewayError, ProtoError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAX_MESSAGE_LEN: usize = 1_048_576;

/// Inbound half of a connection.
#[async_trait]
pub trait FrameRead: Send {
    /// Reads the next frame; `Ok(None)` on clean end of stream.
    async fn read_frame(&mut self) -> Result<Option<Frame>, GatewayError>;
}

/// Outbound half of a connection.
#[async_trait]
pub trait FrameWrite: Send {
    async fn write_frame(&mut self, frame: &Frame) -> Result<(), GatewayError>;

    /// Flushes and closes the write side.
    async fn shutdown(&mut self);
}

/// Reads `u32` big-endian length-prefixed JSON frames.
pub struct LengthPrefixedReader<R> {
    inner: R,
}

impl<R> LengthPrefixedReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> FrameRead for LengthPrefixedReader<R> {
    async fn read_frame(&mut self) -> Result<Option<Frame>, GatewayError> {
        let mut len_buf = [0u8; 4];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(GatewayError::Transport(e.to_string())),
        }
        let len = parse_message_len(len_buf);
        ensure_message_len(len)?;

        let mut buf = vec![0u8; len];
        self.inner
            .read_exact(&mut buf)
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        decode_frame(&buf).map(Some)
    }
}

/// Writes `u32` big-endian length-prefixed JSON frames.
pub struct LengthPrefixedWriter<W> {
    inner: W,
}

impl<W> LengthPrefixedWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameWrite for LengthPrefixedWriter<W> {
    async fn write_frame(&mut self, frame: &Frame) -> Result<(), GatewayError> {
        let bytes = encode_frame(frame)?;
        self.inner
            .write_all(&bytes)
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        self.inner
            .flush()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))
    }

    async fn shutdown(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}

/// Splits a byte stream into boxed length-prefixed frame halves.
pub fn split_stream<S>(stream: S) -> (Box<dyn FrameRead>, Box<dyn FrameWrite>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read, write) = tokio::io::split(stream);
    (
        Box::new(LengthPrefixedReader::new(read)),
        Box::new(LengthPrefixedWriter::new(write)),
    )
}

/// Parses a big-endian 4-byte message length prefix.
fn parse_message_len(len_buf: [u8; 4]) -> usize {
    u32::from_be_bytes(len_buf) as usize
}

/// Validates payload size against the maximum frame size.
fn ensure_message_len(len: usize) -> Result<(), GatewayError> {
    if len > MAX_MESSAGE_LEN {
        return Err(ProtoError::FrameTooLarge(len).into());
    }
    Ok(())
}

/// Deserializes a JSON payload into a [`Frame`].
pub fn decode_frame(buf: &[u8]) -> Result<Frame, GatewayError> {
    serde_json::from_slice(buf)
        .map_err(|e| ProtoError::Serialization(format!("Deserialize error: {e}")).into())
}

/// Encodes a frame as length-prefixed JSON bytes.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, GatewayError> {
    let body = serde_json::to_vec(frame)
        .map_err(|e| ProtoError::Serialization(format!("Serialize error: {e}")))?;
    ensure_message_len(body.len())?;
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proto::FrameKind;
    use serde_json::json;

    #[test]
    fn parse_message_len_decodes_big_endian_u32() {
        let len = parse_message_len([0, 0, 1, 44]);
        assert_eq!(len, 300);
    }

    #[test]
    fn ensure_message_len_rejects_too_large_input() {
        assert!(ensure_message_len(MAX_MESSAGE_LEN).is_ok());
        let err = ensure_message_len(MAX_MESSAGE_LEN + 1).expect_err("len should be rejected");
        assert!(err.to_string().contains("Message too large"));
    }

    #[test]
    fn decode_frame_reports_invalid_json() {
        let err = decode_frame(b"{not json").expect_err("invalid json should fail");
        assert!(err.to_string().contains("Deserialize error"));
    }

    #[test]
    fn encode_frame_builds_length_prefixed_payload() {
        let bytes = encode_frame(&Frame::heartbeat(1)).expect("encode");
        let len = parse_message_len([bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(len, bytes.len() - 4);
        let frame = decode_frame(&bytes[4..]).expect("decode");
        assert_eq!(frame.kind, FrameKind::Heartbeat);
    }

    #[tokio::test]
    async fn frames_cross_a_duplex_stream_in_order() {
        let (client, server) = tokio::io::duplex(4096);
        let (_, mut writer) = split_stream(client);
        let (mut reader, _) = split_stream(server);

        writer
            .write_frame(&Frame::auth(1, "token-abc"))
            .await
            .expect("write auth");
        writer
            .write_frame(&Frame::call(2, "/orders/create", json!({"qty": 1})))
            .await
            .expect("write call");
        writer.shutdown().await;

        let first = reader.read_frame().await.expect("read").expect("frame");
        assert_eq!(first.kind, FrameKind::Auth);
        let second = reader.read_frame().await.expect("read").expect("frame");
        assert_eq!(second.path, "/orders/create");
        assert!(reader.read_frame().await.expect("eof").is_none());
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected_before_reading_body() {
        let (mut client, server) = tokio::io::duplex(64);
        let (mut reader, _) = split_stream(server);
        client
            .write_all(&((MAX_MESSAGE_LEN as u32) + 1).to_be_bytes())
            .await
            .expect("write prefix");
        let err = reader.read_frame().await.expect_err("too large");
        assert!(matches!(err, GatewayError::Proto(ProtoError::FrameTooLarge(_))));
    }
}
