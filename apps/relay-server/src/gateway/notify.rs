//! Targeted notifications: deliver a payload to every open connection of one
//! user, bypassing rooms entirely.

use std::sync::Arc;

use relay_common::protocol::{NotificationPayload, ServerMessage};
use relay_common::UserId;
use serde_json::Value;

use super::relay::RelayEngine;

/// Entry point for collaborators (REST handlers) that originate notifications,
/// e.g. a new lead or appointment. Cloneable; store it in `AppState`.
#[derive(Clone)]
pub struct NotificationDispatcher {
    relay: Arc<RelayEngine>,
}

impl NotificationDispatcher {
    pub fn new(relay: Arc<RelayEngine>) -> Self {
        Self { relay }
    }

    /// Queue `payload` on all of the user's open connections.
    ///
    /// Returns the number of connections it was queued on. A user with no open
    /// connection is a silent no-op; nothing is stored for later.
    pub fn notify(&self, user_id: &UserId, payload: Value) -> usize {
        let event = Arc::new(ServerMessage::Notification(NotificationPayload { payload }));
        let delivered = self.relay.deliver_to_user(user_id, &event);
        tracing::debug!(%user_id, delivered, "notification dispatched");
        delivered
    }
}
