//! The relay engine: owns every accepted connection and the presence and room
//! registries, and turns inbound actions into outbound fan-out.
//!
//! Membership mutations (register, join, leave, disconnect) run under a single
//! lock so they apply in a total order; the events they produce are queued
//! while the lock is held, which keeps presence and membership notices in
//! order for every recipient. Queueing is non-blocking, so a slow recipient
//! never holds the lock. Chat and typing fan-out read a membership snapshot
//! and do not take the lock at all.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use relay_common::protocol::{
    ChatMessage, MembershipPayload, PresencePayload, ReadyPayload, RoomJoinedPayload,
    RoomLeftPayload, ServerMessage, TypingState,
};
use relay_common::{ConnectionId, RoomId, UserId};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::error::RelayError;

use super::connection::{ConnectionHandle, Outbound, TransportState};
use super::fanout::{self, FanOut};
use super::presence::{PresenceRegistry, PresenceTransition};
use super::rooms::{LeaveOutcome, RoomRegistry};

/// Limits applied by the engine.
#[derive(Debug, Clone, Copy)]
pub struct RelayLimits {
    pub outbound_queue_capacity: usize,
    pub max_rooms_per_connection: usize,
    pub max_connections_per_user: usize,
}

impl Default for RelayLimits {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: 256,
            max_rooms_per_connection: 64,
            max_connections_per_user: 16,
        }
    }
}

impl From<&Config> for RelayLimits {
    fn from(config: &Config) -> Self {
        Self {
            outbound_queue_capacity: config.outbound_queue_capacity,
            max_rooms_per_connection: config.max_rooms_per_connection,
            max_connections_per_user: config.max_connections_per_user,
        }
    }
}

/// How a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// Close handshake (`open → closing → closed`).
    Graceful,
    /// Transport loss or eviction (`open → closed`).
    Abrupt,
}

/// A freshly accepted connection and the receiving end of its outbound queue.
pub struct Registration {
    pub connection: Arc<ConnectionHandle>,
    pub outbound: mpsc::Receiver<Outbound>,
}

pub struct RelayEngine {
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    presence: PresenceRegistry,
    rooms: RoomRegistry,
    limits: RelayLimits,
    membership: Mutex<()>,
}

impl RelayEngine {
    pub fn new(limits: RelayLimits) -> Self {
        let presence = PresenceRegistry::new();
        presence.on_transition(|transition| match transition {
            PresenceTransition::Online(user_id) => tracing::info!(%user_id, "user online"),
            PresenceTransition::Offline(user_id) => tracing::info!(%user_id, "user offline"),
        });

        Self {
            connections: DashMap::new(),
            presence,
            rooms: RoomRegistry::new(),
            limits,
            membership: Mutex::new(()),
        }
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    pub fn limits(&self) -> RelayLimits {
        self.limits
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection(&self, conn_id: &ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(conn_id).map(|c| c.value().clone())
    }

    /// Accept a connection for an authenticated user.
    ///
    /// The connection is opened, its `ready` frame queued, and presence
    /// updated; a 0→1 transition is broadcast as `user_online`.
    pub fn register(&self, user_id: UserId) -> Result<Registration, RelayError> {
        let (registration, failed) = {
            let _guard = self.membership.lock();

            if self.presence.connection_count(&user_id) >= self.limits.max_connections_per_user {
                return Err(RelayError::Capacity("too many connections for this user"));
            }

            let (handle, outbound) = ConnectionHandle::new(
                ConnectionId::next(),
                user_id.clone(),
                self.limits.outbound_queue_capacity,
            );
            let connection = Arc::new(handle);
            if connection.transition(TransportState::Open).is_err() {
                return Err(RelayError::ConnectionClosed);
            }

            let ready = Arc::new(ServerMessage::Ready(ReadyPayload {
                connection_id: connection.id.clone(),
                user_identity: user_id.clone(),
            }));
            // A fresh queue always has room for the first frame.
            let _ = connection.enqueue(ready);

            self.connections
                .insert(connection.id.clone(), connection.clone());

            let mut outcome = FanOut::default();
            if let Some(PresenceTransition::Online(user_id)) =
                self.presence.mark_connected(&user_id, &connection.id)
            {
                let event = Arc::new(ServerMessage::UserOnline(PresencePayload {
                    user_identity: user_id.clone(),
                }));
                outcome.merge(self.broadcast_except_user(&user_id, &event));
            }

            tracing::info!(
                connection_id = %connection.id,
                user_id = %connection.user_id,
                "connection registered"
            );

            (
                Registration {
                    connection,
                    outbound,
                },
                outcome.failed,
            )
        };

        self.evict(failed);
        Ok(registration)
    }

    /// Join `room_id` on behalf of a connection.
    pub fn join(&self, conn_id: &ConnectionId, room_id: &RoomId) -> Result<(), RelayError> {
        let failed = {
            let _guard = self.membership.lock();
            let conn = self.open_connection(conn_id)?;

            if !self.rooms.has_connection(room_id, conn_id)
                && self.rooms.rooms_of(conn_id).len() >= self.limits.max_rooms_per_connection
            {
                return Err(RelayError::Capacity("too many rooms for this connection"));
            }

            let newly_member = self.rooms.join(room_id, &conn.user_id, conn_id);

            let mut members: Vec<UserId> = self.rooms.members(room_id).into_iter().collect();
            members.sort();
            let ack = Arc::new(ServerMessage::RoomJoined(RoomJoinedPayload {
                room_id: room_id.clone(),
                members,
            }));
            let mut outcome = fanout::deliver([&conn], &ack);

            if newly_member {
                let notice = Arc::new(ServerMessage::UserJoined(MembershipPayload {
                    room_id: room_id.clone(),
                    user_identity: conn.user_id.clone(),
                }));
                outcome.merge(self.deliver_to_room(room_id, Some(&conn.user_id), &notice));
            }

            tracing::debug!(
                connection_id = %conn_id,
                user_id = %conn.user_id,
                room_id = %room_id,
                newly_member,
                "joined room"
            );
            outcome.failed
        };

        self.evict(failed);
        Ok(())
    }

    /// Leave `room_id` on behalf of a connection.
    pub fn leave(&self, conn_id: &ConnectionId, room_id: &RoomId) -> Result<(), RelayError> {
        let failed = {
            let _guard = self.membership.lock();
            let conn = self.open_connection(conn_id)?;

            let outcome = self.rooms.leave(room_id, &conn.user_id, conn_id);
            if outcome == LeaveOutcome::NotJoined {
                return Err(RelayError::NotMember(room_id.clone()));
            }

            let ack = Arc::new(ServerMessage::RoomLeft(RoomLeftPayload {
                room_id: room_id.clone(),
            }));
            let mut fan = fanout::deliver([&conn], &ack);

            if outcome == LeaveOutcome::Left {
                let notice = Arc::new(ServerMessage::UserLeft(MembershipPayload {
                    room_id: room_id.clone(),
                    user_identity: conn.user_id.clone(),
                }));
                fan.merge(self.deliver_to_room(room_id, None, &notice));
            }

            tracing::debug!(
                connection_id = %conn_id,
                user_id = %conn.user_id,
                room_id = %room_id,
                ?outcome,
                "left room"
            );
            fan.failed
        };

        self.evict(failed);
        Ok(())
    }

    /// Relay a chat message to every open connection of every room member,
    /// the sender's own connections included.
    pub fn send_message(
        &self,
        conn_id: &ConnectionId,
        room_id: &RoomId,
        payload: Value,
    ) -> Result<FanOut, RelayError> {
        let conn = self.open_connection(conn_id)?;
        if !self.rooms.is_member(room_id, &conn.user_id) {
            return Err(RelayError::NotMember(room_id.clone()));
        }

        let event = Arc::new(ServerMessage::ReceiveMessage(ChatMessage {
            room_id: room_id.clone(),
            sender_identity: conn.user_id.clone(),
            payload,
            server_timestamp: Utc::now(),
        }));

        let mut outcome = self.deliver_to_room(room_id, None, &event);
        tracing::debug!(
            connection_id = %conn_id,
            room_id = %room_id,
            delivered = outcome.delivered,
            "message relayed"
        );
        self.evict(std::mem::take(&mut outcome.failed));
        Ok(outcome)
    }

    /// Relay a typing indicator to room members other than the sender.
    pub fn typing(
        &self,
        conn_id: &ConnectionId,
        room_id: &RoomId,
        is_typing: bool,
    ) -> Result<FanOut, RelayError> {
        let conn = self.open_connection(conn_id)?;
        if !self.rooms.is_member(room_id, &conn.user_id) {
            return Err(RelayError::NotMember(room_id.clone()));
        }

        let event = Arc::new(ServerMessage::UserTyping(TypingState {
            room_id: room_id.clone(),
            user_identity: conn.user_id.clone(),
            is_typing,
        }));

        let mut outcome = self.deliver_to_room(room_id, Some(&conn.user_id), &event);
        self.evict(std::mem::take(&mut outcome.failed));
        Ok(outcome)
    }

    /// Queue `event` on every open connection of `user_id`. Returns how many
    /// connections took it.
    pub fn deliver_to_user(&self, user_id: &UserId, event: &Outbound) -> usize {
        let targets = self.handles(self.presence.connections(user_id));
        let mut outcome = fanout::deliver(&targets, event);
        self.evict(std::mem::take(&mut outcome.failed));
        outcome.delivered
    }

    /// Send an event to one connection only (replies and errors).
    pub fn reply(&self, conn_id: &ConnectionId, event: ServerMessage) {
        let Some(conn) = self.connection(conn_id) else {
            return;
        };
        let mut outcome = fanout::deliver([&conn], &Arc::new(event));
        self.evict(std::mem::take(&mut outcome.failed));
    }

    /// Tear down a connection: leave every room, drop presence, then announce
    /// departures and a possible offline transition. Idempotent.
    pub fn disconnect(&self, conn_id: &ConnectionId, kind: CloseKind) -> bool {
        let Some(failed) = self.disconnect_locked(conn_id, kind) else {
            return false;
        };
        self.evict(failed);
        true
    }

    fn disconnect_locked(&self, conn_id: &ConnectionId, kind: CloseKind) -> Option<Vec<ConnectionId>> {
        let _guard = self.membership.lock();

        let (_, conn) = self.connections.remove(conn_id)?;
        if kind == CloseKind::Graceful {
            let _ = conn.transition(TransportState::Closing);
        }
        let _ = conn.transition(TransportState::Closed);

        // Registry cleanup completes before anything is announced.
        let departures = self.rooms.remove_connection(conn_id);
        let transition = self.presence.mark_disconnected(&conn.user_id, conn_id);

        let mut outcome = FanOut::default();
        for departure in &departures {
            let notice = Arc::new(ServerMessage::UserLeft(MembershipPayload {
                room_id: departure.room_id.clone(),
                user_identity: departure.user_id.clone(),
            }));
            outcome.merge(self.deliver_to_room(&departure.room_id, None, &notice));
        }

        if let Some(PresenceTransition::Offline(user_id)) = transition {
            let event = Arc::new(ServerMessage::UserOffline(PresencePayload {
                user_identity: user_id.clone(),
            }));
            outcome.merge(self.broadcast_except_user(&user_id, &event));
        }

        tracing::info!(
            connection_id = %conn_id,
            user_id = %conn.user_id,
            ?kind,
            rooms_left = departures.len(),
            "connection closed"
        );
        Some(outcome.failed)
    }

    /// Disconnect connections whose transport failed during fan-out. Cleanup
    /// of one may fail further recipients, so this runs to a fixed point.
    fn evict(&self, mut pending: Vec<ConnectionId>) {
        while let Some(conn_id) = pending.pop() {
            if let Some(failed) = self.disconnect_locked(&conn_id, CloseKind::Abrupt) {
                tracing::warn!(connection_id = %conn_id, "evicted connection after delivery failure");
                pending.extend(failed);
            }
        }
    }

    fn open_connection(&self, conn_id: &ConnectionId) -> Result<Arc<ConnectionHandle>, RelayError> {
        self.connection(conn_id)
            .filter(|c| c.is_open())
            .ok_or(RelayError::ConnectionClosed)
    }

    fn handles(&self, ids: impl IntoIterator<Item = ConnectionId>) -> Vec<Arc<ConnectionHandle>> {
        ids.into_iter()
            .filter_map(|id| self.connection(&id))
            .collect()
    }

    /// Fan out to the open connections of every member of `room_id`,
    /// optionally skipping one user's connections.
    fn deliver_to_room(&self, room_id: &RoomId, exclude: Option<&UserId>, event: &Outbound) -> FanOut {
        let members = self.rooms.members(room_id);
        let targets = self.handles(
            members
                .iter()
                .filter(|user_id| Some(*user_id) != exclude)
                .flat_map(|user_id| self.presence.connections(user_id)),
        );
        fanout::deliver(&targets, event)
    }

    /// Fan out to every open connection not owned by `user_id`.
    fn broadcast_except_user(&self, user_id: &UserId, event: &Outbound) -> FanOut {
        let targets: Vec<Arc<ConnectionHandle>> = self
            .connections
            .iter()
            .filter(|entry| &entry.value().user_id != user_id)
            .map(|entry| entry.value().clone())
            .collect();
        fanout::deliver(&targets, event)
    }
}

impl Default for RelayEngine {
    fn default() -> Self {
        Self::new(RelayLimits::default())
    }
}
