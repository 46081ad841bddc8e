use std::{
    collections::HashMap,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    error::RelayError,
    message::{ClientFrame, ServerFrame, parse_client_frame, timestamp},
    registry::Registry,
    session::{Session, SessionHandle, SessionId, SessionState},
};

/// What the connection loop should do after a frame was routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Routes inbound frames between sessions.
///
/// Holds the name registry and the set of every open connection, including
/// ones that have not logged in yet, since roster broadcasts reach those too.
pub struct Relay {
    registry: Registry,
    connections: Mutex<HashMap<SessionId, SessionHandle>>,
    next_id: AtomicU64,
}

impl Default for Relay {
    fn default() -> Self {
        Self::new()
    }
}

impl Relay {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<SessionId, SessionHandle>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connection_count(&self) -> usize {
        self.connections().len()
    }

    /// Opens a new `Connecting` session. The receiver yields every frame
    /// routed to it, in order.
    pub fn connect(&self) -> (Session, mpsc::UnboundedReceiver<ServerFrame>) {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SessionHandle::new(id, tx);
        self.connections().insert(id, handle.clone());
        debug!(session = %id, "connection opened");
        (Session::new(handle), rx)
    }

    /// Parses and routes one text frame. Malformed frames are logged and
    /// dropped without a reply.
    pub fn handle_text(&self, session: &mut Session, text: &str) -> Flow {
        match parse_client_frame(text) {
            Ok(frame) => self.handle_frame(session, frame),
            Err(err) => {
                debug!(session = %session.id(), error = %err, "dropping frame");
                Flow::Continue
            }
        }
    }

    pub fn handle_frame(&self, session: &mut Session, frame: ClientFrame) -> Flow {
        let sender = match session.state() {
            SessionState::Closed => return Flow::Close,
            SessionState::Connecting => {
                return match frame {
                    ClientFrame::Login { username } => self.login(session, &username),
                    other => {
                        debug!(session = %session.id(), frame = ?other, "ignoring frame before login");
                        Flow::Continue
                    }
                };
            }
            SessionState::Authenticated { name } => name.clone(),
        };

        match frame {
            ClientFrame::Login { .. } => {
                debug!(session = %session.id(), name = %sender, "ignoring repeated login");
            }
            ClientFrame::PrivateMessage { to, message } => {
                self.private_message(session.handle(), &sender, to, message);
            }
            ClientFrame::Typing { to } => self.typing(&sender, &to),
            ClientFrame::Unknown => {
                debug!(session = %session.id(), "ignoring unknown frame type");
            }
        }
        Flow::Continue
    }

    /// Claims `username` exactly as sent; names are not normalized.
    fn login(&self, session: &mut Session, username: &str) -> Flow {
        match self.registry.register(username, session.handle().clone()) {
            Ok(()) => {
                session.authenticate(username.to_string());
                info!(session = %session.id(), name = username, "user logged in");
                reply(
                    session.handle(),
                    ServerFrame::system(format!("Welcome, {username}!")),
                );
                self.broadcast_roster();
                Flow::Continue
            }
            Err(err) => {
                info!(session = %session.id(), error = %err, "login rejected");
                reply(session.handle(), ServerFrame::system("Username already taken!"));
                Flow::Close
            }
        }
    }

    fn private_message(&self, sender: &SessionHandle, from: &str, to: String, message: String) {
        let timestamp = timestamp();
        let delivery = self.deliver(
            &to,
            ServerFrame::PrivateMessage {
                from: from.to_string(),
                message: message.clone(),
                timestamp: timestamp.clone(),
            },
        );

        match delivery {
            Ok(()) => reply(
                sender,
                ServerFrame::Delivered {
                    to,
                    message,
                    timestamp,
                },
            ),
            Err(err) => {
                debug!(from, error = %err, "private message not delivered");
                reply(sender, ServerFrame::system(format!("User {to} not available")));
            }
        }
    }

    fn typing(&self, from: &str, to: &str) {
        let frame = ServerFrame::Typing {
            from: from.to_string(),
        };
        if let Err(err) = self.deliver(to, frame) {
            debug!(from, error = %err, "typing notification dropped");
        }
    }

    /// Sends `frame` to whoever holds `name`. A connection that closes
    /// between lookup and send counts as unavailable.
    fn deliver(&self, name: &str, frame: ServerFrame) -> Result<(), RelayError> {
        let unavailable = || RelayError::RecipientUnavailable {
            name: name.to_string(),
        };
        let recipient = self.registry.lookup(name).ok_or_else(unavailable)?;
        recipient.send(frame).map_err(|_| unavailable())
    }

    /// Sends the full roster to every open connection.
    ///
    /// The snapshot is taken while the connection set is locked, so roster
    /// broadcasts are serialized and the last one anybody receives matches
    /// the settled registry.
    pub fn broadcast_roster(&self) {
        let mut connections = self.connections();
        let users = self.registry.snapshot();
        debug!(?users, "broadcasting roster");
        connections.retain(|_, handle| {
            handle
                .send(ServerFrame::UserList {
                    users: users.clone(),
                })
                .is_ok()
        });
    }

    /// Tears a session down. Safe to call more than once; only the first call
    /// for an authenticated session changes the roster.
    pub fn disconnect(&self, session: &mut Session) {
        let previous = session.close();
        if previous == SessionState::Closed {
            return;
        }

        self.connections().remove(&session.id());

        if let SessionState::Authenticated { name } = previous {
            if self.registry.unregister(&name, session.id()) {
                info!(session = %session.id(), %name, "user left");
            }
            self.broadcast_roster();
        } else {
            debug!(session = %session.id(), "connection closed before login");
        }
    }
}

fn reply(handle: &SessionHandle, frame: ServerFrame) {
    if let Err(err) = handle.send(frame) {
        warn!(session = %handle.id(), error = %err, "failed to reply");
    }
}
