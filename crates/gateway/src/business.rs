//! Pluggable business strategy: session validation, backend selection, and
//! the push rule.

use async_trait::async_trait;
use dashmap::DashMap;
use proto::Status;

use crate::discovery::Instance;
use crate::plugin::PushCtx;
use crate::session::Session;

/// Business rules consulted by the gateway core.
#[async_trait]
pub trait Business: Send + Sync {
    /// Validates auth info. `session` is `None` for per-request HTTP auth.
    async fn authenticate(&self, auth_info: &str, session: Option<&Session>) -> Result<(), Status>;

    /// Picks the backend instance that serves one request.
    fn select<'a>(
        &self,
        service: &str,
        candidates: &'a [Instance],
        session: Option<&Session>,
    ) -> Option<&'a Instance>;

    /// Checked before every push to a client session.
    fn pre_write_push(&self, ctx: &PushCtx<'_>) -> Result<(), Status> {
        if ctx.session.is_authenticated() {
            Ok(())
        } else {
            Err(Status::unauthorized("push to unauthenticated session"))
        }
    }
}

/// Built-in strategy: any non-empty token, round-robin per service.
#[derive(Default)]
pub struct DefaultBusiness {
    cursors: DashMap<String, usize>,
}

impl DefaultBusiness {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Business for DefaultBusiness {
    async fn authenticate(&self, auth_info: &str, _session: Option<&Session>) -> Result<(), Status> {
        if auth_info.trim().is_empty() {
            return Err(Status::unauthorized("empty auth info"));
        }
        Ok(())
    }

    fn select<'a>(
        &self,
        service: &str,
        candidates: &'a [Instance],
        _session: Option<&Session>,
    ) -> Option<&'a Instance> {
        if candidates.is_empty() {
            return None;
        }
        let mut cursor = self.cursors.entry(service.to_string()).or_insert(0);
        let index = *cursor % candidates.len();
        *cursor = cursor.wrapping_add(1);
        candidates.get(index)
    }
}
