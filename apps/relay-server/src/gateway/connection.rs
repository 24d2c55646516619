//! Server-side state for a single relay connection.

use std::sync::Arc;

use relay_common::protocol::ServerMessage;
use relay_common::{ConnectionId, UserId};
use tokio::sync::{mpsc, watch};

/// An event queued for delivery to one connection.
pub type Outbound = Arc<ServerMessage>;

/// Transport lifecycle of a connection.
///
/// `Connecting → Open → Closing → Closed`, with `Open → Closed` on abrupt
/// transport loss and `Connecting → Closed` when setup is abandoned. `Closed`
/// is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl TransportState {
    pub fn can_transition_to(self, next: TransportState) -> bool {
        use TransportState::*;
        matches!(
            (self, next),
            (Connecting, Open) | (Connecting, Closed) | (Open, Closing) | (Open, Closed) | (Closing, Closed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid transport transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: TransportState,
    pub to: TransportState,
}

/// Why an event could not be queued for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// The outbound queue is at capacity (slow consumer).
    Full,
    /// The writer side is gone.
    Closed,
}

/// A connection as owned by the relay engine.
///
/// Outbound events go through a bounded queue drained by the connection's
/// writer task, so enqueueing never waits on the socket.
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub user_id: UserId,
    state: watch::Sender<TransportState>,
    outbound: mpsc::Sender<Outbound>,
}

impl ConnectionHandle {
    /// Create a handle in the `Connecting` state along with the receiving end
    /// of its outbound queue.
    pub fn new(id: ConnectionId, user_id: UserId, capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (state, _) = watch::channel(TransportState::Connecting);
        (
            Self {
                id,
                user_id,
                state,
                outbound: tx,
            },
            rx,
        )
    }

    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == TransportState::Open
    }

    /// Observe state changes (used by the socket tasks to stop on eviction).
    pub fn watch_state(&self) -> watch::Receiver<TransportState> {
        self.state.subscribe()
    }

    /// Move to `next`, returning the previous state.
    pub fn transition(&self, next: TransportState) -> Result<TransportState, InvalidTransition> {
        let mut result = Err(InvalidTransition {
            from: next,
            to: next,
        });
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                result = Ok(*current);
                *current = next;
                true
            } else {
                result = Err(InvalidTransition {
                    from: *current,
                    to: next,
                });
                false
            }
        });
        result
    }

    /// Queue an event without waiting.
    pub fn enqueue(&self, event: Outbound) -> Result<(), EnqueueError> {
        self.outbound.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }
}
