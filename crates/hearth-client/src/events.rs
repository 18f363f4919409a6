use hearth_net::ConnectionStatus;
use hearth_shared::MessageId;

/// Capacity of each conversation's event channel. Slow subscribers skip
/// ahead (`RecvError::Lagged`) rather than stall the conversation.
pub const EVENT_CAPACITY: usize = 256;

/// What a conversation view reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationEvent {
    /// Backlog merged. `failed` records showed up as the placeholder.
    HistoryLoaded { count: usize, failed: usize },
    HistoryFailed { reason: String },
    MessageAppended { id: MessageId },
    /// The view should scroll to the newest message.
    ScrollToNewest,
    DecryptFailed { id: MessageId },
    /// Latest room channel status. Changes that happen in quick succession
    /// are coalesced, so intermediate states may be skipped.
    Connection(ConnectionStatus),
    /// `{"type":"error"}` frame from the server.
    ServerError { message: String },
}
