use thiserror::Error;

use hearth_shared::{ChannelKind, ProtocolError};

/// Why a channel never reached `OPEN`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectFailure {
    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("server rejected the upgrade with HTTP {status}")]
    Rejected { status: u16 },

    /// Token refused, either as an HTTP 401/403 on the upgrade or as an
    /// immediate 4001/4003 close right after it.
    #[error("access token rejected (code {code})")]
    Unauthorized { code: u16 },

    #[error("closed before open (close code {code:?})")]
    ClosedBeforeOpen { code: Option<u16> },

    #[error("superseded by a newer connection request")]
    Superseded,
}

#[derive(Error, Debug)]
pub enum TransportError {
    /// The channel closed before it ever reached `OPEN`.
    #[error("connection to {channel} failed: {reason}")]
    Connection {
        channel: ChannelKind,
        reason: ConnectFailure,
    },

    /// Error event on a connecting or open socket.
    #[error("transport error on {channel}: {message}")]
    Transport {
        channel: ChannelKind,
        message: String,
    },

    /// Send attempted while the room channel is not `OPEN`.
    #[error("room channel is not open")]
    NotConnected,

    #[error("codec error: {0}")]
    Codec(#[from] ProtocolError),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl TransportError {
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    pub fn is_authentication_error(&self) -> bool {
        matches!(
            self,
            Self::Connection {
                reason: ConnectFailure::Unauthorized { .. },
                ..
            }
        )
    }
}
