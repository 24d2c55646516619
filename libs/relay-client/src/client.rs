//! The client connection: handshake, a background transport task, and the
//! reconnection loop.
//!
//! Frames are sent through an unbounded command queue so [`RelayClient::send`]
//! never waits. Inbound events reach the consumer in arrival order over a
//! bounded channel. [`RelayClient::close`] consumes the handle, so nothing can
//! be sent after a deliberate close.

use futures_util::{SinkExt, StreamExt};
use relay_common::protocol::{
    ClientMessage, ReadyPayload, SendMessagePayload, ServerMessage, TypingPayload,
};
use relay_common::RoomId;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::event::{ClientEvent, DisconnectReason};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client-side view of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    /// Transport lost; waiting for or running the given attempt.
    Reconnecting { attempt: u32 },
    /// Terminal.
    Closed,
}

enum Command {
    Send(ClientMessage),
    Close,
}

/// Handle to an authenticated relay connection.
pub struct RelayClient {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

impl RelayClient {
    /// Open a connection and wait for the relay's `ready` frame.
    ///
    /// The first event on the returned channel is `Connected`. An auth
    /// rejection fails here with [`ClientError::Auth`] and is never retried.
    pub async fn connect(
        config: ClientConfig,
    ) -> Result<(Self, mpsc::Receiver<ClientEvent>), ClientError> {
        let (socket, ready) = handshake(&config).await?;
        tracing::info!(
            connection_id = %ready.connection_id,
            user_id = %ready.user_identity,
            "relay connection established"
        );

        let (events_tx, events_rx) = mpsc::channel(config.event_channel_capacity.max(1));
        // Fresh channel; the first slot is always free.
        let _ = events_tx.try_send(ClientEvent::Connected {
            connection_id: ready.connection_id,
            user_identity: ready.user_identity,
            reconnected: false,
        });

        let (state_tx, state_rx) = watch::channel(ConnectionState::Open);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let transport = Transport {
            config,
            commands: commands_rx,
            events: events_tx,
            state: state_tx,
        };
        let task = tokio::spawn(transport.run(socket));

        Ok((
            Self {
                commands: commands_tx,
                state: state_rx,
                task,
            },
            events_rx,
        ))
    }

    /// Queue a frame. Frames queued while reconnecting are dropped.
    pub fn send(&self, msg: ClientMessage) -> Result<(), ClientError> {
        self.commands
            .send(Command::Send(msg))
            .map_err(|_| ClientError::Closed)
    }

    pub fn join_room(&self, room_id: impl Into<RoomId>) -> Result<(), ClientError> {
        self.send(ClientMessage::JoinRoom(room_id.into()))
    }

    pub fn leave_room(&self, room_id: impl Into<RoomId>) -> Result<(), ClientError> {
        self.send(ClientMessage::LeaveRoom(room_id.into()))
    }

    pub fn send_message(&self, room_id: impl Into<RoomId>, payload: Value) -> Result<(), ClientError> {
        self.send(ClientMessage::SendMessage(SendMessagePayload {
            room_id: room_id.into(),
            payload,
        }))
    }

    pub fn typing(&self, room_id: impl Into<RoomId>, is_typing: bool) -> Result<(), ClientError> {
        self.send(ClientMessage::Typing(TypingPayload {
            room_id: room_id.into(),
            is_typing,
        }))
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Close the connection without reconnecting. Resolves once the transport
    /// task has stopped, whether or not the consumer is draining events; the
    /// final `Disconnected` event is queued only if the channel has room.
    pub async fn close(self) {
        let _ = self.commands.send(Command::Close);
        if let Err(e) = self.task.await {
            tracing::warn!(?e, "relay transport task failed");
        }
    }
}

/// Outcome of one connected stretch of the transport.
enum Exit {
    Closed,
    Lost(String),
}

struct Transport {
    config: ClientConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::Sender<ClientEvent>,
    state: watch::Sender<ConnectionState>,
}

impl Transport {
    async fn run(mut self, mut socket: WsStream) {
        let mut greeting = None;
        loop {
            let reason = match self.pump(&mut socket, greeting.take()).await {
                Exit::Closed => {
                    self.finish(DisconnectReason::ClientClosed).await;
                    return;
                }
                Exit::Lost(reason) => reason,
            };
            tracing::warn!(%reason, "relay transport lost");

            if self.config.reconnect.max_attempts == 0 {
                self.finish(DisconnectReason::TransportLost(reason)).await;
                return;
            }

            let lost = ClientEvent::Disconnected {
                reason: DisconnectReason::TransportLost(reason),
                reconnecting: true,
            };
            if !self.emit_disconnected(lost).await {
                self.finish(DisconnectReason::ClientClosed).await;
                return;
            }

            match self.reconnect().await {
                Ok((next, ready)) => {
                    socket = next;
                    self.state.send_replace(ConnectionState::Open);
                    greeting = Some(ClientEvent::Connected {
                        connection_id: ready.connection_id,
                        user_identity: ready.user_identity,
                        reconnected: true,
                    });
                }
                Err(reason) => {
                    self.finish(reason).await;
                    return;
                }
            }
        }
    }

    /// Shuttle frames both ways until the transport ends. `greeting` is
    /// delivered before the first inbound frame.
    async fn pump(&mut self, socket: &mut WsStream, greeting: Option<ClientEvent>) -> Exit {
        if let Some(event) = greeting {
            if let Some(exit) = self.deliver(socket, event).await {
                return exit;
            }
        }

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    if let Some(exit) = apply(socket, command).await {
                        return exit;
                    }
                }

                frame = socket.next() => match frame {
                    Some(Ok(Message::Text(text))) => match ServerMessage::from_json(&text) {
                        Ok(msg) => {
                            let Some(event) = ClientEvent::from_server(msg) else {
                                continue;
                            };
                            if let Some(exit) = self.deliver(socket, event).await {
                                return exit;
                            }
                        }
                        Err(e) => tracing::debug!(?e, "ignoring unparseable frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let reason = match frame {
                            Some(f) => format!("closed by relay ({}): {}", u16::from(f.code), f.reason),
                            None => "closed by relay".to_string(),
                        };
                        return Exit::Lost(reason);
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Exit::Lost(e.to_string()),
                    None => return Exit::Lost("connection reset".to_string()),
                },
            }
        }
    }

    /// Hand an event to the consumer while connected. Outgoing commands keep
    /// flowing while the consumer's channel is full, so a close request is
    /// never stuck behind backpressure.
    async fn deliver(&mut self, socket: &mut WsStream, event: ClientEvent) -> Option<Exit> {
        let events = &self.events;
        let send = events.send(event);
        tokio::pin!(send);

        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => {
                    if let Some(exit) = apply(socket, command).await {
                        return Some(exit);
                    }
                }

                sent = &mut send => {
                    if sent.is_ok() {
                        return None;
                    }
                    // Consumer dropped the receiver.
                    let _ = socket.close(None).await;
                    return Some(Exit::Closed);
                }
            }
        }
    }

    /// Run the reconnection policy. A close request interrupts the wait.
    async fn reconnect(&mut self) -> Result<(WsStream, ReadyPayload), DisconnectReason> {
        let config = self.config.clone();

        for attempt in 1..=config.reconnect.max_attempts {
            self.state
                .send_replace(ConnectionState::Reconnecting { attempt });
            let delay = config.reconnect.delay_for(attempt);
            tracing::debug!(attempt, ?delay, "reconnecting to relay");

            let result = tokio::select! {
                result = async {
                    time::sleep(delay).await;
                    handshake(&config).await
                } => result,
                _ = close_requested(&mut self.commands) => {
                    return Err(DisconnectReason::ClientClosed);
                }
            };

            match result {
                Ok(connected) => {
                    tracing::info!(attempt, "reconnected to relay");
                    return Ok(connected);
                }
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "reconnect attempt failed");
                    let auth = err.is_auth();
                    let failed = ClientEvent::ConnectError {
                        attempt,
                        error: err.to_string(),
                    };
                    if !self.emit_disconnected(failed).await {
                        return Err(DisconnectReason::ClientClosed);
                    }
                    if auth {
                        return Err(DisconnectReason::AuthRejected);
                    }
                }
            }
        }

        Err(DisconnectReason::AttemptsExhausted)
    }

    /// Emit the terminal `Disconnected` event.
    ///
    /// After a deliberate close the event is only delivered if the channel has
    /// room, so `close()` never waits on the consumer. Other terminal reasons
    /// wait for room unless a close request arrives first.
    async fn finish(&mut self, reason: DisconnectReason) {
        self.state.send_replace(ConnectionState::Closed);
        tracing::info!(?reason, "relay connection closed");

        let closed_by_client = reason == DisconnectReason::ClientClosed;
        let event = ClientEvent::Disconnected {
            reason,
            reconnecting: false,
        };
        if closed_by_client {
            if self.events.try_send(event).is_err() {
                tracing::debug!("event channel full; final disconnect not delivered");
            }
        } else {
            self.emit_disconnected(event).await;
        }
    }

    /// Hand an event to the consumer while no transport is up. False when a
    /// close request (or dropped handle) arrived first, or the consumer is
    /// gone.
    async fn emit_disconnected(&mut self, event: ClientEvent) -> bool {
        let events = &self.events;
        tokio::select! {
            biased;
            _ = close_requested(&mut self.commands) => false,
            sent = events.send(event) => sent.is_ok(),
        }
    }
}

/// Carry out one command on a live socket. `Some` when the transport should
/// stop.
async fn apply(socket: &mut WsStream, command: Option<Command>) -> Option<Exit> {
    match command {
        Some(Command::Send(msg)) => {
            let json = match msg.to_json() {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!(?e, "failed to encode frame");
                    return None;
                }
            };
            match socket.send(Message::Text(json.into())).await {
                Ok(()) => None,
                Err(e) => Some(Exit::Lost(e.to_string())),
            }
        }
        // A dropped handle closes like an explicit close.
        Some(Command::Close) | None => {
            let _ = socket.close(None).await;
            Some(Exit::Closed)
        }
    }
}

/// Resolve on a close request or a dropped handle, discarding frames sent
/// while disconnected.
async fn close_requested(commands: &mut mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Close => return,
            Command::Send(msg) => {
                tracing::debug!(room_id = %msg.room_id(), "dropping frame while disconnected");
            }
        }
    }
}

/// Upgrade with the bearer token and wait for `ready`.
async fn handshake(config: &ClientConfig) -> Result<(WsStream, ReadyPayload), ClientError> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", config.token))
        .map_err(|_| ClientError::Handshake("token is not a valid header value".to_string()))?;
    request.headers_mut().insert(AUTHORIZATION, bearer);

    let (mut socket, _) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(ClientError::from_connect)?;

    match time::timeout(config.handshake_timeout, await_ready(&mut socket)).await {
        Ok(Ok(ready)) => Ok((socket, ready)),
        Ok(Err(e)) => Err(e),
        Err(_) => {
            let _ = socket.close(None).await;
            Err(ClientError::Handshake("timed out waiting for ready".to_string()))
        }
    }
}

async fn await_ready(socket: &mut WsStream) -> Result<ReadyPayload, ClientError> {
    while let Some(frame) = socket.next().await {
        match frame? {
            Message::Text(text) => match ServerMessage::from_json(&text) {
                Ok(ServerMessage::Ready(ready)) => return Ok(ready),
                Ok(ServerMessage::Error(err)) => return Err(ClientError::Handshake(err.message)),
                Ok(other) => {
                    tracing::debug!(event = other.event_name(), "ignoring frame before ready");
                }
                Err(e) => return Err(ClientError::Handshake(format!("malformed frame: {e}"))),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(ClientError::Handshake(
        "connection closed before ready".to_string(),
    ))
}
