use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use hearth_shared::constants::ENCRYPTED_PLACEHOLDER;
use hearth_shared::crypto::decrypt_text;
use hearth_shared::{EncryptedMessage, MessageId, RoomId, RoomKey};

/// A chat message as shown to the user. Lives in memory only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecryptedMessage {
    pub id: MessageId,
    pub room: RoomId,
    pub sender: Option<i64>,
    pub sender_username: Option<String>,
    pub sender_photo_url: Option<String>,
    /// Plaintext, or the placeholder when `decrypted` is false.
    pub text: String,
    pub decrypted: bool,
    pub created_at: Option<DateTime<Utc>>,
}

impl DecryptedMessage {
    /// Decrypt `message` with `key`. A failure never propagates: the text
    /// becomes the placeholder and `decrypted` is false.
    pub fn open(message: &EncryptedMessage, key: &RoomKey) -> Self {
        let (text, decrypted) = match decrypt_text(key, &message.envelope) {
            Ok(text) => (text, true),
            Err(e) => {
                debug!(id = %message.id, room = %message.room, error = %e, "message did not decrypt");
                (ENCRYPTED_PLACEHOLDER.to_string(), false)
            }
        };

        Self {
            id: message.id,
            room: message.room,
            sender: message.sender,
            sender_username: message.sender_username.clone(),
            sender_photo_url: message.sender_photo_url.clone(),
            text,
            decrypted,
            created_at: message.created_at,
        }
    }
}

/// Insert keeping `messages` sorted by id. Returns `false` for a duplicate.
pub(crate) fn insert_by_id(messages: &mut Vec<DecryptedMessage>, message: DecryptedMessage) -> bool {
    match messages.binary_search_by_key(&message.id, |m| m.id) {
        Ok(_) => false,
        Err(pos) => {
            messages.insert(pos, message);
            true
        }
    }
}
