//! WebSocket upgrade handler and per-connection event loop.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use relay_common::protocol::ServerMessage;
use relay_common::UserId;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::auth::middleware::AuthUser;
use crate::error::ApiError;
use crate::AppState;

use super::connection::{ConnectionHandle, Outbound, TransportState};
use super::handler::handle_frame;
use super::relay::{CloseKind, Registration};

/// Close codes (4000-range for application-level).
const CLOSE_CAPACITY: u16 = 4008;
const CLOSE_EVICTED: u16 = 4009;

pub fn router() -> Router<AppState> {
    Router::new().route("/gateway", get(ws_upgrade))
}

/// Authenticate, then upgrade. A refused token never produces a connection.
async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    AuthUser { user_id }: AuthUser,
) -> Response {
    let limit = state.relay.limits().max_connections_per_user;
    if state.relay.presence().connection_count(&user_id) >= limit {
        tracing::debug!(%user_id, "refusing upgrade: connection limit reached");
        return ApiError::too_many_requests("Too many open connections").into_response();
    }

    ws.on_upgrade(move |socket| handle_connection(socket, state, user_id))
}

async fn handle_connection(socket: WebSocket, state: AppState, user_id: UserId) {
    let (mut ws_tx, ws_rx) = socket.split();

    let Registration {
        connection,
        outbound,
    } = match state.relay.register(user_id.clone()) {
        Ok(registration) => registration,
        Err(err) => {
            // Lost a race against the pre-upgrade capacity check.
            tracing::debug!(%user_id, error = %err, "registration refused");
            let event = ServerMessage::Error(err.to_payload());
            if let Ok(json) = event.to_json() {
                let _ = ws_tx.send(Message::Text(json.into())).await;
            }
            let _ = send_close(&mut ws_tx, CLOSE_CAPACITY, "Connection limit reached").await;
            return;
        }
    };

    let writer = tokio::spawn(write_events(connection.clone(), ws_tx, outbound));
    let kind = read_frames(&state, &connection, ws_rx, writer).await;
    state.relay.disconnect(&connection.id, kind);
}

/// Reader loop: dispatch client frames until the peer goes away, the writer
/// stops, or the relay closes the connection.
async fn read_frames(
    state: &AppState,
    connection: &Arc<ConnectionHandle>,
    mut ws_rx: SplitStream<WebSocket>,
    mut writer: JoinHandle<()>,
) -> CloseKind {
    let mut transport = connection.watch_state();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&state.relay, &connection.id, text.as_str());
                    }
                    Some(Ok(Message::Close(_))) => return CloseKind::Graceful,
                    None => return CloseKind::Abrupt,
                    Some(Err(e)) => {
                        tracing::debug!(?e, connection_id = %connection.id, "ws read error");
                        return CloseKind::Abrupt;
                    }
                    // Pings are answered by the transport; binary frames are ignored.
                    Some(Ok(_)) => continue,
                }
            }

            _ = &mut writer => {
                tracing::debug!(connection_id = %connection.id, "writer stopped");
                return CloseKind::Abrupt;
            }

            _ = transport.wait_for(|state| *state == TransportState::Closed) => {
                return CloseKind::Abrupt;
            }
        }
    }
}

/// Writer task: drain the outbound queue into the socket in enqueue order,
/// then send a close frame once the connection is closed.
async fn write_events(
    connection: Arc<ConnectionHandle>,
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
) {
    let mut transport: watch::Receiver<TransportState> = connection.watch_state();

    loop {
        tokio::select! {
            event = outbound.recv() => {
                let Some(event) = event else {
                    break;
                };
                let json = match event.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!(?e, event = event.event_name(), "failed to encode event");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    return;
                }
            }

            _ = async { let _ = transport.wait_for(|state| *state == TransportState::Closed).await; } => break,
        }
    }

    // Only reaches the peer when the relay closed the connection; after a
    // client close or transport loss the socket is already gone.
    let _ = send_close(&mut ws_tx, CLOSE_EVICTED, "Connection closed by relay").await;
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    code: u16,
    reason: &str,
) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
