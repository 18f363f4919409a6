//! WebSocket transport for the chat backend.
//!
//! Two independent channels: the per-room channel, which carries encrypted
//! messages in both directions, and the notification channel, which only
//! receives. Both authenticate with the access token in the URL query.

pub mod channel;
pub mod endpoint;
pub mod error;
pub mod handlers;
pub mod manager;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use channel::{ChannelState, CloseReason, ConnectionStatus};
pub use endpoint::{redact, TransportConfig, DEFAULT_OPEN_GRACE};
pub use error::{ConnectFailure, TransportError};
pub use handlers::{FrameHandler, HandlerId, RoomSubscription};
pub use manager::TransportManager;
