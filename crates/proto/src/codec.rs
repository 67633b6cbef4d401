use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtoError;

/// Body serialization codec, identified on the wire by a single byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "char", into = "char")]
pub enum BodyCodec {
    /// JSON body (`'j'`).
    #[default]
    Json,
    /// UTF-8 plain text body (`'s'`).
    Plain,
}

impl BodyCodec {
    /// Wire id of the codec.
    pub const fn id(self) -> char {
        match self {
            Self::Json => 'j',
            Self::Plain => 's',
        }
    }

    /// Looks a codec up by wire id.
    pub fn from_id(id: char) -> Result<Self, ProtoError> {
        match id {
            'j' => Ok(Self::Json),
            's' => Ok(Self::Plain),
            other => Err(ProtoError::UnknownCodec(other)),
        }
    }

    /// Canonical content type for HTTP responses.
    pub const fn content_type(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Plain => "text/plain; charset=utf-8",
        }
    }

    /// Decodes raw bytes into a body value.
    pub fn decode(self, bytes: &[u8]) -> Result<Value, ProtoError> {
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        match self {
            Self::Json => serde_json::from_slice(bytes)
                .map_err(|e| ProtoError::Serialization(format!("json body: {e}"))),
            Self::Plain => std::str::from_utf8(bytes)
                .map(|s| Value::String(s.to_string()))
                .map_err(|e| ProtoError::Serialization(format!("plain body: {e}"))),
        }
    }

    /// Encodes a body value into raw bytes.
    pub fn encode(self, body: &Value) -> Vec<u8> {
        match (self, body) {
            (_, Value::Null) => Vec::new(),
            (Self::Plain, Value::String(s)) => s.as_bytes().to_vec(),
            _ => body.to_string().into_bytes(),
        }
    }
}

impl TryFrom<char> for BodyCodec {
    type Error = ProtoError;

    fn try_from(id: char) -> Result<Self, Self::Error> {
        Self::from_id(id)
    }
}

impl From<BodyCodec> for char {
    fn from(codec: BodyCodec) -> Self {
        codec.id()
    }
}

impl std::str::FromStr for BodyCodec {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        match (chars.next(), chars.next()) {
            (Some(id), None) => Self::from_id(id),
            _ => Err(ProtoError::Serialization(format!(
                "codec id must be one character, got {s:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ids_and_rejects_unknown() {
        assert_eq!("j".parse::<BodyCodec>().expect("json"), BodyCodec::Json);
        assert_eq!("s".parse::<BodyCodec>().expect("plain"), BodyCodec::Plain);
        assert!(matches!(
            "x".parse::<BodyCodec>(),
            Err(ProtoError::UnknownCodec('x'))
        ));
        assert!("json".parse::<BodyCodec>().is_err());
    }

    #[test]
    fn plain_codec_keeps_strings_verbatim() {
        let body = BodyCodec::Plain.decode(b"token-abc").expect("decode");
        assert_eq!(body, Value::String("token-abc".into()));
        assert_eq!(BodyCodec::Plain.encode(&body), b"token-abc");
    }

    #[test]
    fn json_codec_reports_invalid_input() {
        let err = BodyCodec::Json.decode(b"{nope").expect_err("invalid json");
        assert!(err.to_string().contains("json body"));
        assert_eq!(BodyCodec::Json.decode(b"").expect("empty"), Value::Null);
    }

    #[test]
    fn serializes_as_single_character() {
        let json = serde_json::to_string(&BodyCodec::Plain).expect("serialize");
        assert_eq!(json, "\"s\"");
        let parsed: BodyCodec = serde_json::from_str("\"j\"").expect("deserialize");
        assert_eq!(parsed, BodyCodec::Json);
    }
}
