//! WebSocket endpoint the Penpot plugin connects to.
//!
//! One socket = one `PluginConnection`. A writer task drains the
//! connection's outbound queue and sends heartbeat pings; the reader loop
//! below runs the handshake and hands every decoded frame to the bridge.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

use crate::bridge::PluginTaskBridge;
use crate::config::BridgeConfig;
use crate::connection::{ConnectionId, ConnectionState};
use crate::error::LifecycleError;
use crate::protocol;
use crate::state::AppState;

/// How long the writer gets to flush and send a close frame after the
/// connection is closed.
const WRITER_DRAIN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub(super) struct SocketTimings {
    pub handshake: Duration,
    pub heartbeat: Duration,
    pub idle: Duration,
}

impl From<&BridgeConfig> for SocketTimings {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            handshake: config.handshake_timeout(),
            heartbeat: config.heartbeat_interval(),
            idle: config.idle_timeout(),
        }
    }
}

/// GET / on the plugin port — upgrade to the task socket.
pub(super) async fn plugin_ws(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_plugin_socket(socket, state))
}

async fn handle_plugin_socket(socket: WebSocket, state: Arc<AppState>) {
    let timings = SocketTimings::from(&*state.config.read());
    let bridge = state.bridge.clone();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let id = bridge.connections().accept(tx);

    let send_task = tokio::spawn(async move {
        let mut heartbeat =
            tokio::time::interval_at(Instant::now() + timings.heartbeat, timings.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let message = tokio::select! {
                frame = rx.recv() => match frame {
                    Some(text) => Message::Text(text.into()),
                    // Connection closed and its queue dropped
                    None => break,
                },
                _ = heartbeat.tick() => Message::Ping(Default::default()),
            };
            if ws_sender.send(message).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let reason = read_frames(&bridge, &id, &mut ws_receiver, timings).await;
    bridge.connections().close(&id, &reason);

    let writer = send_task.abort_handle();
    if tokio::time::timeout(WRITER_DRAIN, send_task).await.is_err() {
        writer.abort();
    }
}

/// Pump inbound frames until the socket ends or a timer fires. Returns the
/// close reason.
async fn read_frames(
    bridge: &PluginTaskBridge,
    id: &ConnectionId,
    receiver: &mut SplitStream<WebSocket>,
    timings: SocketTimings,
) -> String {
    let connections = bridge.connections();
    let handshake_deadline = Instant::now() + timings.handshake;
    let mut last_seen = Instant::now();

    loop {
        let state = connections.state(id);
        let deadline = match state {
            ConnectionState::Connecting => handshake_deadline,
            ConnectionState::Ready => last_seen + timings.idle,
            ConnectionState::Closed => return "connection closed".to_string(),
        };

        let next = match tokio::time::timeout_at(deadline, receiver.next()).await {
            Ok(next) => next,
            Err(_) if state == ConnectionState::Connecting => {
                tracing::warn!(connection = %id, "plugin never sent hello");
                return format!("no hello within {}ms", timings.handshake.as_millis());
            }
            Err(_) => {
                tracing::warn!(connection = %id, "plugin socket went idle");
                return format!("no traffic for {}ms", timings.idle.as_millis());
            }
        };

        let message = match next {
            None => return "socket closed".to_string(),
            Some(Err(e)) => return format!("socket error: {e}"),
            Some(Ok(message)) => message,
        };
        last_seen = Instant::now();
        connections.touch(id);

        match message {
            Message::Text(text) => match protocol::decode(text.as_str()) {
                Ok(frame) => match bridge.handle_plugin_message(id, frame) {
                    Ok(()) => {}
                    Err(LifecycleError::UnknownConnection(_)) => {
                        return "connection closed".to_string();
                    }
                    Err(e) => tracing::warn!(connection = %id, "{e}"),
                },
                Err(e) => {
                    tracing::warn!(connection = %id, "malformed plugin frame: {e}");
                    return format!("protocol error: {e}");
                }
            },
            Message::Close(_) => return "plugin closed the socket".to_string(),
            Message::Binary(_) => {
                tracing::debug!(connection = %id, "ignoring binary frame");
            }
            // Pings are answered by axum; pongs only count as activity
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}
