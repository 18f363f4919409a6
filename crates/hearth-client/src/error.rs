use thiserror::Error;

use hearth_net::TransportError;
use hearth_shared::CryptoError;
use hearth_store::StoreError;

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("history request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("history request returned HTTP {0}")]
    Status(u16),

    #[error("invalid history payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid history endpoint: {0}")]
    Endpoint(String),

    #[error("history unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Send attempted before the room key was derived.
    #[error("room key not ready")]
    KeyNotReady,

    #[error("conversation is closed")]
    Closed,
}

impl ClientError {
    /// The access token was refused; the caller should refresh it before
    /// reconnecting.
    pub fn is_authentication_error(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_authentication_error())
    }
}
