use tokio_tungstenite::tungstenite;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The relay refused the presented token.
    #[error("authentication rejected (HTTP {status})")]
    Auth { status: u16 },

    #[error("invalid relay url: {0}")]
    InvalidUrl(String),

    /// The upgrade succeeded at the transport level but no `ready` frame
    /// followed, or the relay refused the connection for another reason.
    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    /// The connection was closed; nothing more can be sent on it.
    #[error("connection closed")]
    Closed,
}

impl ClientError {
    /// Classify a failed `connect_async`.
    pub(crate) fn from_connect(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(resp) => {
                let status = resp.status().as_u16();
                if status == 401 || status == 403 {
                    Self::Auth { status }
                } else {
                    Self::Handshake(format!("upgrade refused with HTTP {status}"))
                }
            }
            tungstenite::Error::Url(e) => Self::InvalidUrl(e.to_string()),
            other => Self::Transport(other),
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }
}
