use std::time::Duration;

/// How the delay between reconnection attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Always wait `base_delay`.
    Fixed,
    /// Double the delay after each failed attempt, capped at `max_delay`.
    Exponential,
}

/// Bounded reconnection after unexpected transport loss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Attempts before giving up. Zero disables reconnection.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: Backoff,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff: Backoff::Fixed,
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Delay before the 1-based `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential => {
                let factor = 1u32
                    .checked_shl(attempt.saturating_sub(1))
                    .unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }
}

/// Everything needed to open and keep a relay connection.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Gateway URL, e.g. `ws://localhost:3001/gateway`.
    pub url: String,
    /// Bearer token presented in the upgrade request.
    pub token: String,
    pub reconnect: ReconnectPolicy,
    /// Capacity of the channel events are delivered on.
    pub event_channel_capacity: usize,
    /// How long to wait for the `ready` frame after the upgrade.
    pub handshake_timeout: Duration,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            reconnect: ReconnectPolicy::default(),
            event_channel_capacity: 256,
            handshake_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}
