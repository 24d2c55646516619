//! Inbound frame dispatch: parse a client frame and apply it to the engine.

use relay_common::protocol::{ClientMessage, ErrorCode, ErrorPayload, ServerMessage};
use relay_common::ConnectionId;

use super::relay::RelayEngine;

/// Longest accepted room name.
const MAX_ROOM_ID_LEN: usize = 128;

/// Handle one text frame from `conn_id`.
///
/// Errors are answered on the originating connection only; the connection
/// stays open.
pub fn handle_frame(relay: &RelayEngine, conn_id: &ConnectionId, text: &str) {
    let msg = match ClientMessage::from_json(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!(connection_id = %conn_id, error = %e, "unparseable frame");
            reply_error(relay, conn_id, bad_request("Invalid frame"));
            return;
        }
    };

    let room_id = msg.room_id();
    if room_id.as_str().is_empty() || room_id.as_str().len() > MAX_ROOM_ID_LEN {
        reply_error(relay, conn_id, bad_request("Invalid room id"));
        return;
    }

    let result = match msg {
        ClientMessage::JoinRoom(room_id) => relay.join(conn_id, &room_id),
        ClientMessage::LeaveRoom(room_id) => relay.leave(conn_id, &room_id),
        ClientMessage::SendMessage(p) => relay
            .send_message(conn_id, &p.room_id, p.payload)
            .map(|_| ()),
        ClientMessage::Typing(p) => relay.typing(conn_id, &p.room_id, p.is_typing).map(|_| ()),
    };

    if let Err(err) = result {
        tracing::debug!(connection_id = %conn_id, error = %err, "relay action rejected");
        reply_error(relay, conn_id, err.to_payload());
    }
}

fn bad_request(message: &str) -> ErrorPayload {
    ErrorPayload {
        code: ErrorCode::BadRequest,
        message: message.to_string(),
        room_id: None,
    }
}

fn reply_error(relay: &RelayEngine, conn_id: &ConnectionId, payload: ErrorPayload) {
    relay.reply(conn_id, ServerMessage::Error(payload));
}
