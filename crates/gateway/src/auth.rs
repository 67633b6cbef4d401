//! Plugins that bind the business strategy into a peer: the session
//! handshake check and the outbound push gate.

use std::sync::Arc;

use async_trait::async_trait;
use proto::Status;
use tracing::{debug, info};

use crate::business::Business;
use crate::plugin::{AuthCheckHook, Handshake, Plugin, PreWritePushHook, PushCtx};
use crate::session::Session;

/// Reads the first frame of every session and validates it with
/// [`Business::authenticate`].
pub struct AuthHandshake {
    business: Arc<dyn Business>,
}

impl AuthHandshake {
    pub fn new(business: Arc<dyn Business>) -> Self {
        Self { business }
    }
}

impl Plugin for AuthHandshake {
    fn name(&self) -> &str {
        "auth-handshake"
    }

    fn as_auth_check(&self) -> Option<&dyn AuthCheckHook> {
        Some(self)
    }
}

#[async_trait]
impl AuthCheckHook for AuthHandshake {
    async fn check(&self, session: &Session, handshake: Handshake<'_>) -> Result<String, Status> {
        let auth_info = handshake.recv().await?;
        self.business
            .authenticate(&auth_info, Some(session))
            .await?;
        info!(session_id = %session.id(), transport = %session.transport(), "Handshake accepted");
        Ok(auth_info)
    }
}

/// Applies [`Business::pre_write_push`] to every outbound push.
pub struct PushGate {
    business: Arc<dyn Business>,
}

impl PushGate {
    pub fn new(business: Arc<dyn Business>) -> Self {
        Self { business }
    }
}

impl Plugin for PushGate {
    fn name(&self) -> &str {
        "push-gate"
    }

    fn as_pre_write_push(&self) -> Option<&dyn PreWritePushHook> {
        Some(self)
    }
}

impl PreWritePushHook for PushGate {
    fn pre_write_push(&self, ctx: &PushCtx<'_>) -> Result<(), Status> {
        self.business.pre_write_push(ctx).inspect_err(|status| {
            debug!(session_id = %ctx.session.id(), path = %ctx.frame.path, %status, "Push refused by business rule");
        })
    }
}
