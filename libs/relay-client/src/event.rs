use relay_common::protocol::{
    ChatMessage, ErrorPayload, MembershipPayload, RoomJoinedPayload, ServerMessage, TypingState,
};
use relay_common::{ConnectionId, RoomId, UserId};
use serde_json::Value;

/// Why the connection went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `close()` was called, or the client handle was dropped.
    ClientClosed,
    /// The transport failed or the relay closed it.
    TransportLost(String),
    /// A reconnection attempt was refused with an auth error.
    AuthRejected,
    /// Every reconnection attempt failed.
    AttemptsExhausted,
}

impl DisconnectReason {
    /// The token must be renewed before connecting again.
    pub fn requires_reauth(&self) -> bool {
        matches!(self, Self::AuthRejected | Self::AttemptsExhausted)
    }
}

/// Everything the consumer observes on a connection, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The relay accepted the connection. `reconnected` is set after a
    /// recovered transport loss; the session must re-join its rooms.
    Connected {
        connection_id: ConnectionId,
        user_identity: UserId,
        reconnected: bool,
    },
    Message(ChatMessage),
    Typing(TypingState),
    PresenceChange { user_identity: UserId, online: bool },
    Notification(Value),
    RoomJoined(RoomJoinedPayload),
    RoomLeft(RoomId),
    UserJoined(MembershipPayload),
    UserLeft(MembershipPayload),
    /// A request on this connection was rejected.
    Error(ErrorPayload),
    /// A reconnection attempt failed.
    ConnectError { attempt: u32, error: String },
    /// The transport is gone. With `reconnecting: false` this is terminal.
    Disconnected {
        reason: DisconnectReason,
        reconnecting: bool,
    },
}

impl ClientEvent {
    /// Map a relay frame. `ready` is consumed by the handshake and yields
    /// nothing here.
    pub fn from_server(msg: ServerMessage) -> Option<Self> {
        let event = match msg {
            ServerMessage::Ready(_) => return None,
            ServerMessage::ReceiveMessage(m) => Self::Message(m),
            ServerMessage::UserTyping(t) => Self::Typing(t),
            ServerMessage::UserOnline(p) => Self::PresenceChange {
                user_identity: p.user_identity,
                online: true,
            },
            ServerMessage::UserOffline(p) => Self::PresenceChange {
                user_identity: p.user_identity,
                online: false,
            },
            ServerMessage::Notification(n) => Self::Notification(n.payload),
            ServerMessage::RoomJoined(p) => Self::RoomJoined(p),
            ServerMessage::RoomLeft(p) => Self::RoomLeft(p.room_id),
            ServerMessage::UserJoined(p) => Self::UserJoined(p),
            ServerMessage::UserLeft(p) => Self::UserLeft(p),
            ServerMessage::Error(e) => Self::Error(e),
        };
        Some(event)
    }

    /// Room this event belongs to, if any.
    pub fn room_id(&self) -> Option<&RoomId> {
        match self {
            Self::Message(m) => Some(&m.room_id),
            Self::Typing(t) => Some(&t.room_id),
            Self::RoomJoined(p) => Some(&p.room_id),
            Self::RoomLeft(room_id) => Some(room_id),
            Self::UserJoined(p) | Self::UserLeft(p) => Some(&p.room_id),
            _ => None,
        }
    }
}
