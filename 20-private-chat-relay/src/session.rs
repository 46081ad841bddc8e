use std::{fmt, sync::Arc};

use tokio::sync::mpsc;

use crate::{
    error::RelayError,
    message::ServerFrame,
    router::{Flow, Relay},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Send capability for one connection.
///
/// The registry stores these instead of transports: all it needs to know is
/// whether the connection is still open. Frames are queued for the
/// connection's writer task, so sends never block and keep per-recipient
/// order.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    outbound: mpsc::UnboundedSender<ServerFrame>,
}

impl SessionHandle {
    pub fn new(id: SessionId, outbound: mpsc::UnboundedSender<ServerFrame>) -> Self {
        Self { id, outbound }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    pub fn send(&self, frame: ServerFrame) -> Result<(), RelayError> {
        self.outbound
            .send(frame)
            .map_err(|_| RelayError::TransportClosed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticated { name: String },
    Closed,
}

/// Server-side state of one connected client, owned by its connection task.
#[derive(Debug)]
pub struct Session {
    handle: SessionHandle,
    state: SessionState,
}

impl Session {
    pub fn new(handle: SessionHandle) -> Self {
        Self {
            handle,
            state: SessionState::Connecting,
        }
    }

    pub fn id(&self) -> SessionId {
        self.handle.id()
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn display_name(&self) -> Option<&str> {
        match &self.state {
            SessionState::Authenticated { name } => Some(name),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    pub(crate) fn authenticate(&mut self, name: String) {
        self.state = SessionState::Authenticated { name };
    }

    /// Moves to `Closed`, returning the previous state.
    pub(crate) fn close(&mut self) -> SessionState {
        std::mem::replace(&mut self.state, SessionState::Closed)
    }
}

/// Owns a session for the lifetime of its connection task and disconnects it
/// from the relay when dropped, whether the receive loop finished, failed, or
/// the task was cancelled.
pub struct SessionGuard {
    relay: Arc<Relay>,
    session: Session,
}

impl SessionGuard {
    pub fn new(relay: Arc<Relay>, session: Session) -> Self {
        Self { relay, session }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn handle_text(&mut self, text: &str) -> Flow {
        self.relay.handle_text(&mut self.session, text)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.relay.disconnect(&mut self.session);
    }
}
