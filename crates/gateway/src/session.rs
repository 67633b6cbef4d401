//! Live sessions and the table that tracks them.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use proto::{Frame, GatewayError, SessionId, TransportKind};
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Authentication state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthState {
    Unauthenticated = 0,
    Authenticated = 1,
    /// Terminal; the connection is being closed.
    Rejected = 2,
}

impl AuthState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Authenticated,
            2 => Self::Rejected,
            _ => Self::Unauthenticated,
        }
    }
}

/// One client connection as seen by the peer.
pub struct Session {
    id: SessionId,
    transport: TransportKind,
    remote: String,
    created_at: Instant,
    state: AtomicU8,
    auth_info: OnceLock<String>,
    outbound: mpsc::Sender<Frame>,
    closed: watch::Sender<bool>,
}

impl Session {
    pub(crate) fn new(
        transport: TransportKind,
        remote: impl Into<String>,
        outbound: mpsc::Sender<Frame>,
    ) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            id: SessionId::new(),
            transport,
            remote: remote.into(),
            created_at: Instant::now(),
            state: AtomicU8::new(AuthState::Unauthenticated as u8),
            auth_info: OnceLock::new(),
            outbound,
            closed,
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn auth_state(&self) -> AuthState {
        AuthState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth_state() == AuthState::Authenticated
    }

    /// Auth info accepted at promotion, if any.
    pub fn auth_info(&self) -> Option<&str> {
        self.auth_info.get().map(String::as_str)
    }

    /// `Unauthenticated -> Authenticated`; fails with the current state otherwise.
    pub(crate) fn promote(&self, auth_info: String) -> Result<(), AuthState> {
        self.transition(AuthState::Authenticated)?;
        let _ = self.auth_info.set(auth_info);
        debug!(session_id = %self.id, "Session authenticated");
        Ok(())
    }

    /// `Unauthenticated -> Rejected`; fails with the current state otherwise.
    pub(crate) fn reject(&self) -> Result<(), AuthState> {
        self.transition(AuthState::Rejected)?;
        debug!(session_id = %self.id, "Session rejected");
        Ok(())
    }

    fn transition(&self, to: AuthState) -> Result<(), AuthState> {
        self.state
            .compare_exchange(
                AuthState::Unauthenticated as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(AuthState::from_u8)
    }

    /// Queues a frame for the connection's writer task.
    pub(crate) async fn send(&self, frame: Frame) -> Result<(), GatewayError> {
        if self.is_closed() {
            return Err(GatewayError::Closed);
        }
        self.outbound
            .send(frame)
            .await
            .map_err(|_| GatewayError::Closed)
    }

    /// Signals the session's worker to tear the connection down.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub(crate) fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("transport", &self.transport)
            .field("remote", &self.remote)
            .field("state", &self.auth_state())
            .finish()
    }
}

/// Concurrent registry of live sessions.
#[derive(Default)]
pub struct SessionTable {
    sessions: DashMap<SessionId, Arc<Session>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<Session>) {
        debug!(session_id = %session.id(), transport = %session.transport(), "Registering session");
        self.sessions.insert(session.id().clone(), session);
    }

    pub fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        debug!(session_id = %id, "Deregistering session");
        self.sessions.remove(id).map(|(_, session)| session)
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Visits a snapshot of all sessions; stops when `f` returns `false`.
    pub fn range(&self, mut f: impl FnMut(&Arc<Session>) -> bool) {
        let snapshot: Vec<Arc<Session>> =
            self.sessions.iter().map(|entry| entry.value().clone()).collect();
        for session in &snapshot {
            if !f(session) {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_session() -> (Arc<Session>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(4);
        (Session::new(TransportKind::Socket, "127.0.0.1:1000", tx), rx)
    }

    #[test]
    fn promote_happens_at_most_once() {
        let (session, _rx) = new_session();
        assert_eq!(session.auth_state(), AuthState::Unauthenticated);

        session.promote("token-abc".into()).expect("first promotion");
        assert!(session.is_authenticated());
        assert_eq!(session.auth_info(), Some("token-abc"));

        let err = session.promote("token-xyz".into()).expect_err("second promotion");
        assert_eq!(err, AuthState::Authenticated);
        assert_eq!(session.auth_info(), Some("token-abc"));
        assert!(session.reject().is_err());
    }

    #[test]
    fn rejected_is_terminal() {
        let (session, _rx) = new_session();
        session.reject().expect("reject");
        assert_eq!(session.auth_state(), AuthState::Rejected);
        assert_eq!(
            session.promote("late".into()).expect_err("cannot promote"),
            AuthState::Rejected
        );
    }

    #[tokio::test]
    async fn send_fails_after_close() {
        let (session, mut rx) = new_session();
        session.send(Frame::heartbeat(1)).await.expect("send");
        assert!(rx.recv().await.is_some());

        session.close();
        assert!(session.is_closed());
        let err = session.send(Frame::heartbeat(2)).await.expect_err("closed");
        assert!(matches!(err, GatewayError::Closed));
    }

    #[test]
    fn table_insert_lookup_remove_and_range() {
        let table = SessionTable::new();
        let (a, _ra) = new_session();
        let (b, _rb) = new_session();
        table.insert(a.clone());
        table.insert(b.clone());
        assert_eq!(table.len(), 2);
        assert!(table.get(a.id()).is_some());

        let mut visited = 0;
        table.range(|_| {
            visited += 1;
            false
        });
        assert_eq!(visited, 1);

        assert!(table.remove(a.id()).is_some());
        assert!(table.get(a.id()).is_none());
        assert_eq!(table.len(), 1);
        assert!(table.remove(a.id()).is_none());
    }
}
