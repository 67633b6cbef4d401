use thiserror::Error;

use crate::status::{Status, StatusCode};

/// Top-level error type
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration loading/validation error.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Gateway transport/runtime error.
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// Service discovery error.
    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    /// Wire protocol error.
    #[error("Proto error: {0}")]
    Proto(#[from] ProtoError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required field was not provided.
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// A field has an invalid value and reason.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    /// Filesystem read error.
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error.
    #[error("TOML parse error: {0}")]
    Toml(String),
}

impl ConfigError {
    /// Shorthand for [`ConfigError::InvalidValue`].
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Gateway errors
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Startup configuration rejected while building a peer or listener.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Network/connection-level failure.
    #[error("Connection error: {0}")]
    Connection(String),

    /// TLS setup/handshake failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Listener could not bind its address.
    #[error("Bind error on {addr}: {reason}")]
    Bind { addr: String, reason: String },

    /// Session lookup failure.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Handshake rejected or missing.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// No backend could be resolved for a request.
    #[error("No backend for service {service}: {reason}")]
    ProxyResolution { service: String, reason: String },

    /// Forwarding a call to a resolved backend failed.
    #[error("Backend {addr} failed: {reason}")]
    Backend { addr: String, reason: String },

    /// Request body could not be bound to a handler parameter.
    #[error("Binding error in {handler}.{param}: {reason}")]
    Binding {
        handler: String,
        param: String,
        reason: String,
    },

    /// Per-connection transport failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Frame encoding/decoding failure.
    #[error("Proto error: {0}")]
    Proto(#[from] ProtoError),

    /// The peer or session has been closed.
    #[error("Closed")]
    Closed,
}

impl GatewayError {
    /// Maps the error onto the status replied to the remote side.
    pub fn to_status(&self) -> Status {
        let code = match self {
            Self::Auth(_) => StatusCode::Unauthorized,
            Self::ProxyResolution { .. } | Self::SessionNotFound(_) => StatusCode::NotFound,
            Self::Backend { .. } => StatusCode::BadGateway,
            Self::Binding { .. } => StatusCode::InvalidParameter,
            Self::Proto(_) => StatusCode::BadRequest,
            Self::Closed => StatusCode::Closed,
            Self::Config(_)
            | Self::Connection(_)
            | Self::Tls(_)
            | Self::Bind { .. }
            | Self::Transport(_) => StatusCode::Internal,
        };
        Status::new(code, self.to_string())
    }
}

/// Service discovery errors
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// No live instance is registered under the service name.
    #[error("Service not registered: {0}")]
    NotRegistered(String),

    /// The registry could not be reached.
    #[error("Registry unavailable: {0}")]
    Unavailable(String),
}

/// Internal proto errors
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Body codec id is not known.
    #[error("Unknown body codec: {0:?}")]
    UnknownCodec(char),

    /// Frame exceeds the maximum length.
    #[error("Message too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Generic serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}
