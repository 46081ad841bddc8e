use std::{
    future::Future,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
};
use futures_util::{SinkExt, Stream, StreamExt, stream::SplitSink};
use tokio::{net::TcpListener, select, sync::mpsc, task::JoinHandle};
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::{
    message::{ServerFrame, encode_frame},
    router::{Flow, Relay},
    session::SessionGuard,
};

/// HTTP server sharing one port between the WebSocket relay at `/ws` and the
/// static client files.
pub struct Server {
    listener: TcpListener,
    relay: Arc<Relay>,
    static_dir: PathBuf,
}

impl Server {
    pub fn new(listener: TcpListener, static_dir: impl Into<PathBuf>) -> Self {
        Self {
            listener,
            relay: Arc::new(Relay::new()),
            static_dir: static_dir.into(),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn relay(&self) -> Arc<Relay> {
        Arc::clone(&self.relay)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Server {
            listener,
            relay,
            static_dir,
        } = self;

        axum::serve(listener, app(relay, &static_dir))
            .with_graceful_shutdown(async move {
                shutdown.await;
                info!("relay shutting down");
            })
            .await
            .context("relay server failed")
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

pub fn app(relay: Arc<Relay>, static_dir: &Path) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .fallback_service(ServeDir::new(static_dir))
        .layer(TraceLayer::new_for_http())
        .with_state(relay)
}

async fn ws_upgrade(State(relay): State<Arc<Relay>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_connection(socket, relay))
}

/// Why the receive loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    Closed,
    WriterGone,
}

/// Serves one connection.
///
/// Outbound frames go through the session's queue to a dedicated writer
/// task; the loop itself only reads. Once the loop ends the guard releases
/// the session, which drops the last queue sender, so the writer flushes
/// whatever is pending (such as a login rejection) and then closes the
/// socket.
async fn run_connection(socket: WebSocket, relay: Arc<Relay>) {
    let (sink, mut stream) = socket.split();
    let (session, outbound) = relay.connect();
    let id = session.id();
    let mut writer = tokio::spawn(write_frames(sink, outbound));
    let mut guard = SessionGuard::new(relay, session);

    let exit = receive_frames(&mut guard, &mut stream, &mut writer).await;

    if let Some(name) = guard.session().display_name() {
        info!(session = %id, %name, ?exit, "connection closed");
    }
    drop(guard);

    if exit == LoopExit::Closed {
        if let Err(err) = writer.await {
            warn!(session = %id, error = ?err, "writer task failed");
        }
    }
}

/// Routes inbound frames until the client closes or the writer stops.
///
/// A writer that stopped means frames can no longer reach this client and
/// its name may already be claimed again, so the session must not keep
/// routing under it.
async fn receive_frames<S, E>(
    guard: &mut SessionGuard,
    stream: &mut S,
    writer: &mut JoinHandle<()>,
) -> LoopExit
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    let id = guard.session().id();
    loop {
        let inbound = select! {
            biased;
            inbound = stream.next() => inbound,
            _ = &mut *writer => {
                debug!(session = %id, "writer stopped");
                return LoopExit::WriterGone;
            }
        };

        let flow = match inbound {
            Some(Ok(Message::Text(text))) => guard.handle_text(&text),
            Some(Ok(Message::Binary(_))) => {
                debug!(session = %id, "dropping binary frame");
                Flow::Continue
            }
            Some(Ok(Message::Close(frame))) => {
                debug!(session = %id, ?frame, "client closed the connection");
                Flow::Close
            }
            // Pings are answered by the transport.
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => Flow::Continue,
            Some(Err(err)) => {
                warn!(session = %id, error = %err, "websocket receive error");
                Flow::Close
            }
            None => Flow::Close,
        };

        if flow == Flow::Close {
            return LoopExit::Closed;
        }
    }
}

async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<ServerFrame>,
) {
    while let Some(frame) = outbound.recv().await {
        let text = match encode_frame(&frame) {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "failed to encode frame");
                continue;
            }
        };
        if let Err(err) = sink.send(Message::Text(text)).await {
            // Dropping the receiver marks the session closed for lookups.
            debug!(error = %err, "failed to deliver frame");
            return;
        }
    }

    if let Err(err) = sink.close().await {
        debug!(error = %err, "failed to close websocket");
    }
}
