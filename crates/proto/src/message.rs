use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::codec::BodyCodec;
use crate::status::Status;

/// Unique identifier for a session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Creates a new random session identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the raw session identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport a session arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Socket,
    Http,
    WebSocket,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Socket => "socket",
            Self::Http => "http",
            Self::WebSocket => "websocket",
        };
        f.write_str(name)
    }
}

/// Frame type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    /// Request expecting a reply with the same `seq`.
    Call,
    /// Answer to a call, auth or heartbeat frame.
    Reply,
    /// One-way message.
    Push,
    /// Handshake payload; must be the first frame of an authenticated session.
    Auth,
    /// Keep-alive ping.
    Heartbeat,
}

/// One unit of traffic between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub seq: u64,
    pub kind: FrameKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
    #[serde(default)]
    pub codec: BodyCodec,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub body: Value,
    /// Set on replies only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
}

impl Frame {
    fn new(seq: u64, kind: FrameKind, path: impl Into<String>, body: Value) -> Self {
        Self {
            seq,
            kind,
            path: path.into(),
            meta: BTreeMap::new(),
            codec: BodyCodec::default(),
            body,
            status: None,
        }
    }

    /// Builds a call frame.
    pub fn call(seq: u64, path: impl Into<String>, body: Value) -> Self {
        Self::new(seq, FrameKind::Call, path, body)
    }

    /// Builds a push frame.
    pub fn push(path: impl Into<String>, body: Value) -> Self {
        Self::new(0, FrameKind::Push, path, body)
    }

    /// Builds a handshake frame carrying an opaque token.
    pub fn auth(seq: u64, token: impl Into<String>) -> Self {
        Self::new(seq, FrameKind::Auth, "", Value::String(token.into())).with_codec(BodyCodec::Plain)
    }

    pub fn heartbeat(seq: u64) -> Self {
        Self::new(seq, FrameKind::Heartbeat, "", Value::Null)
    }

    /// Builds the reply to `self` from a handler result.
    pub fn reply(&self, result: Result<Value, Status>) -> Self {
        let (body, status) = match result {
            Ok(body) => (body, Status::ok()),
            Err(status) => (Value::Null, status),
        };
        Self {
            seq: self.seq,
            kind: FrameKind::Reply,
            path: self.path.clone(),
            meta: BTreeMap::new(),
            codec: self.codec,
            body,
            status: Some(status),
        }
    }

    pub fn with_codec(mut self, codec: BodyCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Status of a reply; frames without one count as OK.
    pub fn status(&self) -> Status {
        self.status.clone().unwrap_or_else(Status::ok)
    }

    /// Converts a reply into the handler-style result it carries.
    pub fn into_result(self) -> Result<Value, Status> {
        match self.status {
            Some(status) if !status.is_ok() => Err(status),
            _ => Ok(self.body),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusCode;

    #[test]
    fn session_id_is_unique_and_displays_raw_value() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert_ne!(a, b);
        assert_eq!(SessionId::from("s-1").to_string(), "s-1");
    }

    #[test]
    fn reply_keeps_seq_and_carries_status() {
        let call = Frame::call(7, "/orders/create", serde_json::json!({"id": 1}));
        let ok = call.reply(Ok(serde_json::json!("done")));
        assert_eq!(ok.seq, 7);
        assert_eq!(ok.kind, FrameKind::Reply);
        assert!(ok.status().is_ok());

        let err = call.reply(Err(Status::not_found("no backend")));
        assert_eq!(err.status().code, StatusCode::NotFound);
        assert!(err.body.is_null());
        assert!(err.into_result().is_err());
    }

    #[test]
    fn frame_json_omits_empty_fields() {
        let json = serde_json::to_string(&Frame::heartbeat(3)).expect("serialize");
        assert_eq!(json, r#"{"seq":3,"kind":"heartbeat","codec":"j"}"#);
        let parsed: Frame = serde_json::from_str(r#"{"seq":1,"kind":"auth","body":"t"}"#)
            .expect("deserialize minimal frame");
        assert_eq!(parsed.kind, FrameKind::Auth);
        assert_eq!(parsed.codec, BodyCodec::Json);
    }

    #[test]
    fn auth_frame_uses_plain_codec() {
        let frame = Frame::auth(1, "token-abc");
        assert_eq!(frame.codec, BodyCodec::Plain);
        assert_eq!(frame.body, Value::String("token-abc".into()));
    }
}
