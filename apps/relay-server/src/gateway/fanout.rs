//! Delivery of one event to many connections.
//!
//! Each target is handed the event through its own bounded queue with a
//! non-blocking `try_send`, so a slow or dead recipient never stalls the rest.
//! Recipients that cannot take a non-advisory event are reported back as
//! failed; the engine treats them as implicitly disconnected.

use std::sync::Arc;

use relay_common::ConnectionId;

use super::connection::{ConnectionHandle, EnqueueError, Outbound};

/// Outcome of a fan-out.
#[derive(Debug, Default)]
pub struct FanOut {
    /// Connections the event was queued on.
    pub delivered: usize,
    /// Advisory events skipped because the recipient's queue was full.
    pub dropped: usize,
    /// Connections whose transport is considered lost.
    pub failed: Vec<ConnectionId>,
}

impl FanOut {
    pub fn merge(&mut self, other: FanOut) {
        self.delivered += other.delivered;
        self.dropped += other.dropped;
        self.failed.extend(other.failed);
    }
}

/// Queue `event` on every open target.
pub fn deliver<'a, I>(targets: I, event: &Outbound) -> FanOut
where
    I: IntoIterator<Item = &'a Arc<ConnectionHandle>>,
{
    let mut outcome = FanOut::default();

    for conn in targets {
        if !conn.is_open() {
            continue;
        }
        match conn.enqueue(event.clone()) {
            Ok(()) => outcome.delivered += 1,
            Err(EnqueueError::Full) if event.is_advisory() => {
                tracing::debug!(
                    connection_id = %conn.id,
                    event = event.event_name(),
                    "dropping advisory event for busy connection"
                );
                outcome.dropped += 1;
            }
            Err(EnqueueError::Full) => {
                tracing::warn!(
                    connection_id = %conn.id,
                    user_id = %conn.user_id,
                    event = event.event_name(),
                    "outbound queue full; treating connection as lost"
                );
                outcome.failed.push(conn.id.clone());
            }
            Err(EnqueueError::Closed) => {
                tracing::debug!(connection_id = %conn.id, "outbound queue closed");
                outcome.failed.push(conn.id.clone());
            }
        }
    }

    outcome
}
