//! In-memory private chat relay over WebSocket.
//!
//! Clients claim a unique display name, then exchange private messages,
//! typing notifications and delivery acknowledgements. Every connection
//! receives the roster of logged-in names whenever it changes. Nothing is
//! persisted.
//!
//! - [`registry`] maps live display names to sessions.
//! - [`router`] interprets inbound frames per session state and dispatches
//!   outbound frames.
//! - [`session`] holds the per-connection state machine and send handle.
//! - [`message`] defines the JSON wire frames.
//! - [`server`] runs the axum server: WebSocket endpoint plus static files.
//! - [`client`] is a terminal client for the relay.
//! - [`cli`] parses the command line for both modes.

pub mod cli;
pub mod client;
pub mod error;
pub mod message;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
