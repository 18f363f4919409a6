//! Shared types for the Hearth chat transport: ids, wire frames, and the
//! message codec (room-key derivation plus XChaCha20-Poly1305 envelopes).

pub mod constants;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod types;

pub use crypto::{Envelope, FamilySecret, RoomKey};
pub use error::{CryptoError, ProtocolError};
pub use protocol::{ClientFrame, EncryptedMessage, RoomNotification, ServerFrame};
pub use types::{ChannelKind, FamilyId, MessageId, RoomId};
