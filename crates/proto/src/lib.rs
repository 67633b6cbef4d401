//! Shared protocol types for the gateway.
//!
//! This crate defines the serializable frame/status structures, body codec
//! ids, and strongly-typed error enums shared across the workspace.

pub mod codec;
pub mod error;
pub mod message;
pub mod status;

/// Re-export of body codec ids.
pub use codec::BodyCodec;
/// Re-export of all protocol error types.
pub use error::*;
/// Re-export of frame and identity types.
pub use message::{Frame, FrameKind, SessionId, TransportKind};
/// Re-export of status types.
pub use status::{Status, StatusCode};
