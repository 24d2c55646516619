pub mod id;
pub mod protocol;

pub use id::{ConnectionId, PrefixedId, RoomId, UserId};
