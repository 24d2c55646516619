//! Consumer-side session: which rooms the user considers active, and the
//! explicit re-join after a reconnection.

use std::collections::BTreeSet;

use relay_common::RoomId;
use serde_json::Value;

use crate::client::RelayClient;
use crate::error::ClientError;
use crate::event::ClientEvent;

pub struct ChatSession {
    client: RelayClient,
    active_rooms: BTreeSet<RoomId>,
    needs_reauth: bool,
}

impl ChatSession {
    pub fn new(client: RelayClient) -> Self {
        Self {
            client,
            active_rooms: BTreeSet::new(),
            needs_reauth: false,
        }
    }

    pub fn client(&self) -> &RelayClient {
        &self.client
    }

    pub fn join(&mut self, room_id: impl Into<RoomId>) -> Result<(), ClientError> {
        let room_id = room_id.into();
        self.client.join_room(room_id.clone())?;
        self.active_rooms.insert(room_id);
        Ok(())
    }

    /// Leave a room. Later events for it are filtered by [`Self::handle_event`].
    pub fn leave(&mut self, room_id: impl Into<RoomId>) -> Result<(), ClientError> {
        let room_id = room_id.into();
        self.active_rooms.remove(&room_id);
        self.client.leave_room(room_id)
    }

    pub fn send(&self, room_id: impl Into<RoomId>, payload: Value) -> Result<(), ClientError> {
        self.client.send_message(room_id, payload)
    }

    pub fn typing(&self, room_id: impl Into<RoomId>, is_typing: bool) -> Result<(), ClientError> {
        self.client.typing(room_id, is_typing)
    }

    pub fn active_rooms(&self) -> impl Iterator<Item = &RoomId> {
        self.active_rooms.iter()
    }

    pub fn is_active(&self, room_id: &RoomId) -> bool {
        self.active_rooms.contains(room_id)
    }

    /// Re-issue a join for every active room. Returns how many were sent.
    pub fn rejoin_active_rooms(&self) -> Result<usize, ClientError> {
        for room_id in &self.active_rooms {
            self.client.join_room(room_id.clone())?;
        }
        tracing::debug!(rooms = self.active_rooms.len(), "re-joined active rooms");
        Ok(self.active_rooms.len())
    }

    /// Apply session bookkeeping for an event. Returns false when the event
    /// belongs to a room the session has already left and should not be
    /// shown.
    pub fn handle_event(&mut self, event: &ClientEvent) -> bool {
        match event {
            ClientEvent::Connected {
                reconnected: true, ..
            } => {
                if let Err(e) = self.rejoin_active_rooms() {
                    tracing::debug!(error = %e, "could not re-join rooms");
                }
                true
            }
            ClientEvent::Disconnected {
                reason,
                reconnecting: false,
            } => {
                self.needs_reauth = reason.requires_reauth();
                true
            }
            ClientEvent::Message(_) | ClientEvent::Typing(_) => event
                .room_id()
                .is_some_and(|room_id| self.active_rooms.contains(room_id)),
            _ => true,
        }
    }

    /// Reconnection gave up or the token was refused; the consumer should
    /// treat the user as signed out.
    pub fn needs_reauth(&self) -> bool {
        self.needs_reauth
    }

    pub async fn close(self) {
        self.client.close().await;
    }
}
