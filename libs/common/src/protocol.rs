//! Relay wire protocol: event names, payloads, and error codes.
//!
//! Every frame is a JSON text message of the form
//! `{"event": "<name>", "data": <payload>}`. Payload fields are camelCase so
//! browser clients can consume them unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::{ConnectionId, RoomId, UserId};

// ---------------------------------------------------------------------------
// Client → Server
// ---------------------------------------------------------------------------

/// A frame sent by a client over the relay connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    JoinRoom(RoomId),
    LeaveRoom(RoomId),
    SendMessage(SendMessagePayload),
    Typing(TypingPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub room_id: RoomId,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub room_id: RoomId,
    pub is_typing: bool,
}

impl ClientMessage {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// The room this frame addresses.
    pub fn room_id(&self) -> &RoomId {
        match self {
            Self::JoinRoom(room_id) | Self::LeaveRoom(room_id) => room_id,
            Self::SendMessage(p) => &p.room_id,
            Self::Typing(p) => &p.room_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Server → Client
// ---------------------------------------------------------------------------

/// A frame sent by the relay to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    Ready(ReadyPayload),
    ReceiveMessage(ChatMessage),
    UserTyping(TypingState),
    UserOnline(PresencePayload),
    UserOffline(PresencePayload),
    Notification(NotificationPayload),
    RoomJoined(RoomJoinedPayload),
    RoomLeft(RoomLeftPayload),
    UserJoined(MembershipPayload),
    UserLeft(MembershipPayload),
    Error(ErrorPayload),
}

impl ServerMessage {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Wire name of the event, for logging.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Ready(_) => "ready",
            Self::ReceiveMessage(_) => "receive_message",
            Self::UserTyping(_) => "user_typing",
            Self::UserOnline(_) => "user_online",
            Self::UserOffline(_) => "user_offline",
            Self::Notification(_) => "notification",
            Self::RoomJoined(_) => "room_joined",
            Self::RoomLeft(_) => "room_left",
            Self::UserJoined(_) => "user_joined",
            Self::UserLeft(_) => "user_left",
            Self::Error(_) => "error",
        }
    }

    /// Typing indicators are advisory and may be dropped under backpressure.
    pub fn is_advisory(&self) -> bool {
        matches!(self, Self::UserTyping(_))
    }
}

/// First frame on every accepted connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyPayload {
    pub connection_id: ConnectionId,
    pub user_identity: UserId,
}

/// A chat message as relayed to room members. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub room_id: RoomId,
    pub sender_identity: UserId,
    pub payload: Value,
    pub server_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingState {
    pub room_id: RoomId,
    pub user_identity: UserId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    pub user_identity: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomJoinedPayload {
    pub room_id: RoomId,
    pub members: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomLeftPayload {
    pub room_id: RoomId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipPayload {
    pub room_id: RoomId,
    pub user_identity: UserId,
}

// ---------------------------------------------------------------------------
// Errors reported to the originating connection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotMember,
    Capacity,
    BadRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_room_carries_bare_room_id() {
        let msg = ClientMessage::from_json(r#"{"event":"join_room","data":"listing-42"}"#).unwrap();
        assert_eq!(msg, ClientMessage::JoinRoom(RoomId::from("listing-42")));
    }

    #[test]
    fn typing_uses_camel_case_fields() {
        let msg =
            ClientMessage::from_json(r#"{"event":"typing","data":{"roomId":"r1","isTyping":true}}"#)
                .unwrap();
        match msg {
            ClientMessage::Typing(p) => {
                assert_eq!(p.room_id.as_str(), "r1");
                assert!(p.is_typing);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_is_rejected() {
        assert!(ClientMessage::from_json(r#"{"event":"delete_room","data":"r1"}"#).is_err());
        assert!(ClientMessage::from_json("not json").is_err());
    }

    #[test]
    fn receive_message_wire_shape() {
        let ts = Utc::now();
        let msg = ServerMessage::ReceiveMessage(ChatMessage {
            room_id: RoomId::from("listing-42"),
            sender_identity: UserId::from("usr_a"),
            payload: json!({ "text": "hi" }),
            server_timestamp: ts,
        });
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["event"], "receive_message");
        assert_eq!(value["data"]["roomId"], "listing-42");
        assert_eq!(value["data"]["senderIdentity"], "usr_a");
        assert_eq!(value["data"]["payload"]["text"], "hi");
        assert!(value["data"]["serverTimestamp"].is_string());
    }

    #[test]
    fn error_omits_room_when_absent() {
        let msg = ServerMessage::Error(ErrorPayload {
            code: ErrorCode::BadRequest,
            message: "Invalid frame".to_string(),
            room_id: None,
        });
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["data"]["code"], "BAD_REQUEST");
        assert!(value["data"].get("roomId").is_none());
    }

    #[test]
    fn only_typing_is_advisory() {
        let typing = ServerMessage::UserTyping(TypingState {
            room_id: RoomId::from("r"),
            user_identity: UserId::from("u"),
            is_typing: false,
        });
        let online = ServerMessage::UserOnline(PresencePayload {
            user_identity: UserId::from("u"),
        });
        assert!(typing.is_advisory());
        assert!(!online.is_advisory());
    }
}
