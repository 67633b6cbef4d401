//! Plugin capabilities and the ordered plugin container.
//!
//! A plugin is a named object exposing one or more hook capabilities. The
//! container keeps two groups, left of and right of the peer's built-in
//! pipeline, and dispatches by capability in group then insertion order.

use std::sync::Arc;

use async_trait::async_trait;
use proto::{ConfigError, Frame, FrameKind, Status};
use serde_json::Value;
use tracing::debug;

use crate::session::Session;
use crate::wire::FrameRead;

/// Outbound push about to be written to a session.
pub struct PushCtx<'a> {
    pub session: &'a Session,
    pub frame: &'a Frame,
}

/// Last-chance gate on outbound pushes.
pub trait PreWritePushHook: Send + Sync {
    fn pre_write_push(&self, ctx: &PushCtx<'_>) -> Result<(), Status>;
}

/// Session handshake check.
#[async_trait]
pub trait AuthCheckHook: Send + Sync {
    /// Receives the handshake payload and validates it, returning the
    /// accepted auth info.
    async fn check(&self, session: &Session, handshake: Handshake<'_>) -> Result<String, Status>;
}

/// Heartbeat responder.
pub trait HeartbeatHook: Send + Sync {
    fn on_heartbeat(&self, session: &Session) -> Result<(), Status>;
}

/// A named hook object.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn as_pre_write_push(&self) -> Option<&dyn PreWritePushHook> {
        None
    }

    fn as_auth_check(&self) -> Option<&dyn AuthCheckHook> {
        None
    }

    fn as_heartbeat(&self) -> Option<&dyn HeartbeatHook> {
        None
    }
}

/// Receive handle for the single handshake payload of a session.
///
/// [`Handshake::recv`] consumes the handle, so a hook can read at most once.
pub struct Handshake<'a> {
    reader: &'a mut dyn FrameRead,
    received: &'a mut Option<Frame>,
}

impl<'a> Handshake<'a> {
    pub(crate) fn new(reader: &'a mut dyn FrameRead, received: &'a mut Option<Frame>) -> Self {
        Self { reader, received }
    }

    /// Blocks the owning session until the first frame arrives and returns
    /// its payload. Anything other than an auth frame is a rejection.
    pub async fn recv(self) -> Result<String, Status> {
        let frame = self
            .reader
            .read_frame()
            .await
            .map_err(|e| Status::unauthorized(format!("handshake read failed: {e}")))?
            .ok_or_else(|| Status::unauthorized("connection closed before handshake"))?;
        let kind = frame.kind;
        let payload = match &frame.body {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        *self.received = Some(frame);

        if kind != FrameKind::Auth {
            return Err(Status::unauthorized(format!(
                "expected auth handshake, got {kind:?} frame"
            )));
        }
        Ok(payload)
    }
}

/// Where a plugin sits relative to the built-in pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Left,
    Right,
}

/// Hook capability exposed by a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    PreWritePush,
    AuthCheck,
    Heartbeat,
}

/// Description of a registered plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginRecord {
    pub name: String,
    pub capabilities: Vec<Capability>,
    pub position: Position,
}

/// Ordered plugin groups. Frozen once moved into a peer.
#[derive(Default, Clone)]
pub struct PluginContainer {
    left: Vec<Arc<dyn Plugin>>,
    right: Vec<Arc<dyn Plugin>>,
}

impl PluginContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_left(&mut self, plugin: Arc<dyn Plugin>) -> &mut Self {
        self.left.push(plugin);
        self
    }

    pub fn append_right(&mut self, plugin: Arc<dyn Plugin>) -> &mut Self {
        self.right.push(plugin);
        self
    }

    fn ordered(&self) -> impl Iterator<Item = &Arc<dyn Plugin>> {
        self.left.iter().chain(self.right.iter())
    }

    pub fn len(&self) -> usize {
        self.left.len() + self.right.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered plugins in execution order.
    pub fn records(&self) -> Vec<PluginRecord> {
        let record = |plugin: &Arc<dyn Plugin>, position| {
            let mut capabilities = Vec::new();
            if plugin.as_auth_check().is_some() {
                capabilities.push(Capability::AuthCheck);
            }
            if plugin.as_pre_write_push().is_some() {
                capabilities.push(Capability::PreWritePush);
            }
            if plugin.as_heartbeat().is_some() {
                capabilities.push(Capability::Heartbeat);
            }
            PluginRecord {
                name: plugin.name().to_string(),
                capabilities,
                position,
            }
        };
        self.left
            .iter()
            .map(|p| record(p, Position::Left))
            .chain(self.right.iter().map(|p| record(p, Position::Right)))
            .collect()
    }

    /// Rejects containers a peer cannot run.
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        let auth = self.ordered().filter(|p| p.as_auth_check().is_some()).count();
        if auth > 1 {
            return Err(ConfigError::invalid(
                "plugins",
                format!("{auth} auth-check plugins registered, at most one is allowed"),
            ));
        }
        Ok(())
    }

    pub fn auth_check(&self) -> Option<&dyn AuthCheckHook> {
        self.ordered().find_map(|p| p.as_auth_check())
    }

    pub fn has_heartbeat(&self) -> bool {
        self.ordered().any(|p| p.as_heartbeat().is_some())
    }

    /// Runs every pre-write-push hook; the first rejection wins.
    pub fn run_pre_write_push(&self, ctx: &PushCtx<'_>) -> Result<(), Status> {
        for plugin in self.ordered() {
            if let Some(hook) = plugin.as_pre_write_push() {
                if let Err(status) = hook.pre_write_push(ctx) {
                    debug!(
                        plugin = plugin.name(),
                        session_id = %ctx.session.id(),
                        path = %ctx.frame.path,
                        %status,
                        "Push rejected"
                    );
                    return Err(status);
                }
            }
        }
        Ok(())
    }

    /// Runs heartbeat hooks; `None` when no plugin answers heartbeats.
    pub fn run_heartbeat(&self, session: &Session) -> Option<Result<(), Status>> {
        let mut hooks = self.ordered().filter_map(|p| p.as_heartbeat()).peekable();
        hooks.peek()?;
        for hook in hooks {
            if let Err(status) = hook.on_heartbeat(session) {
                return Some(Err(status));
            }
        }
        Some(Ok(()))
    }
}

/// Built-in heartbeat responder, installed when heartbeat is enabled.
pub struct HeartbeatPong;

impl Plugin for HeartbeatPong {
    fn name(&self) -> &str {
        "heartbeat-pong"
    }

    fn as_heartbeat(&self) -> Option<&dyn HeartbeatHook> {
        Some(self)
    }
}

impl HeartbeatHook for HeartbeatPong {
    fn on_heartbeat(&self, session: &Session) -> Result<(), Status> {
        debug!(session_id = %session.id(), "Heartbeat");
        Ok(())
    }
}
