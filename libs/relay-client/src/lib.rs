//! Client half of the relay: an authenticated connection with a bounded
//! reconnection policy, and a consumer session that tracks active rooms.

pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod session;

pub use client::{ConnectionState, RelayClient};
pub use config::{Backoff, ClientConfig, ReconnectPolicy};
pub use error::ClientError;
pub use event::{ClientEvent, DisconnectReason};
pub use session::ChatSession;
