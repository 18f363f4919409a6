//! Client side of Hearth's end-to-end encrypted family chat.
//!
//! Wires the key ring, the WebSocket transport and the history source
//! together into per-room [`ConversationController`]s, plus an
//! [`UnreadTracker`] on the notification channel.

pub mod config;
pub mod conversation;
pub mod error;
pub mod events;
pub mod history;
pub mod keyring;
pub mod message;
pub mod unread;

use tracing_subscriber::{fmt, EnvFilter};

pub use config::ClientConfig;
pub use conversation::ConversationController;
pub use error::{ClientError, HistoryError};
pub use events::ConversationEvent;
pub use history::{HistorySource, MemoryHistory, RestHistory};
pub use keyring::Keyring;
pub use message::DecryptedMessage;
pub use unread::UnreadTracker;

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the default
/// filter. Calling it twice is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("hearth_client=debug,hearth_net=debug,hearth_store=info,warn")
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
