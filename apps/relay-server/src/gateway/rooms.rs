//! Room membership: `room -> user -> connections` plus a reverse
//! `connection -> rooms` index for bulk cleanup on disconnect.
//!
//! Membership is per-user. A user with two connections in the same room is one
//! member; they leave the member set only once their last connection in that
//! room is gone.

use std::collections::{HashMap, HashSet};

use dashmap::DashMap;
use relay_common::{ConnectionId, RoomId, UserId};

#[derive(Default)]
struct Room {
    members: HashMap<UserId, HashSet<ConnectionId>>,
}

impl Room {
    /// Remove `conn_id` from `user_id`. Returns true if the user has no
    /// remaining connections in the room.
    fn detach(&mut self, user_id: &UserId, conn_id: &ConnectionId) -> Option<bool> {
        let conns = self.members.get_mut(user_id)?;
        if !conns.remove(conn_id) {
            return None;
        }
        if conns.is_empty() {
            self.members.remove(user_id);
            return Some(true);
        }
        Some(false)
    }
}

/// Result of [`RoomRegistry::leave`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// The connection was not registered in the room.
    NotJoined,
    /// The connection left but the user is still present through another one.
    StillMember,
    /// The user's last connection left; they are no longer a member.
    Left,
}

/// A user who stopped being a member of a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub room_id: RoomId,
    pub user_id: UserId,
}

pub struct RoomRegistry {
    rooms: DashMap<RoomId, Room>,
    by_connection: DashMap<ConnectionId, HashSet<RoomId>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            by_connection: DashMap::new(),
        }
    }

    /// Register `conn_id` of `user_id` in the room, creating it lazily.
    ///
    /// Returns true if the user newly became a member.
    pub fn join(&self, room_id: &RoomId, user_id: &UserId, conn_id: &ConnectionId) -> bool {
        let newly_member = {
            let mut room = self.rooms.entry(room_id.clone()).or_default();
            let newly_member = !room.members.contains_key(user_id);
            room.members
                .entry(user_id.clone())
                .or_default()
                .insert(conn_id.clone());
            newly_member
        };

        self.by_connection
            .entry(conn_id.clone())
            .or_default()
            .insert(room_id.clone());

        newly_member
    }

    pub fn leave(&self, room_id: &RoomId, user_id: &UserId, conn_id: &ConnectionId) -> LeaveOutcome {
        let outcome = match self.detach(room_id, user_id, conn_id) {
            None => return LeaveOutcome::NotJoined,
            Some(true) => LeaveOutcome::Left,
            Some(false) => LeaveOutcome::StillMember,
        };

        let now_unused = match self.by_connection.get_mut(conn_id) {
            Some(mut rooms) => {
                rooms.remove(room_id);
                rooms.is_empty()
            }
            None => false,
        };
        if now_unused {
            self.by_connection.remove_if(conn_id, |_, rooms| rooms.is_empty());
        }

        outcome
    }

    /// Remove a connection from every room it joined.
    ///
    /// Returns one [`Departure`] per room the owning user no longer belongs to.
    pub fn remove_connection(&self, conn_id: &ConnectionId) -> Vec<Departure> {
        let Some((_, rooms)) = self.by_connection.remove(conn_id) else {
            return Vec::new();
        };

        let mut departures = Vec::new();
        for room_id in rooms {
            let owner = self.rooms.get(&room_id).and_then(|room| {
                room.members
                    .iter()
                    .find(|(_, conns)| conns.contains(conn_id))
                    .map(|(user_id, _)| user_id.clone())
            });
            let Some(user_id) = owner else {
                continue;
            };
            if self.detach(&room_id, &user_id, conn_id) == Some(true) {
                departures.push(Departure { room_id, user_id });
            }
        }
        departures
    }

    /// Current member identities of a room.
    pub fn members(&self, room_id: &RoomId) -> HashSet<UserId> {
        self.rooms
            .get(room_id)
            .map(|room| room.members.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_member(&self, room_id: &RoomId, user_id: &UserId) -> bool {
        self.rooms
            .get(room_id)
            .is_some_and(|room| room.members.contains_key(user_id))
    }

    pub fn has_connection(&self, room_id: &RoomId, conn_id: &ConnectionId) -> bool {
        self.by_connection
            .get(conn_id)
            .is_some_and(|rooms| rooms.contains(room_id))
    }

    /// Rooms a connection has joined.
    pub fn rooms_of(&self, conn_id: &ConnectionId) -> Vec<RoomId> {
        self.by_connection
            .get(conn_id)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Detach a connection from one room, deleting the room once empty.
    fn detach(&self, room_id: &RoomId, user_id: &UserId, conn_id: &ConnectionId) -> Option<bool> {
        let (result, room_empty) = {
            let mut room = self.rooms.get_mut(room_id)?;
            let result = room.detach(user_id, conn_id)?;
            (result, room.members.is_empty())
        };
        if room_empty {
            self.rooms.remove_if(room_id, |_, room| room.members.is_empty());
        }
        Some(result)
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}
