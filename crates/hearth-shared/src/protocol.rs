use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::crypto::Envelope;
use crate::error::ProtocolError;
use crate::types::{MessageId, RoomId};

/// Frames the client sends. Only the room channel carries outbound traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Encrypted chat message; the server fills in id, sender and timestamp.
    Message { ciphertext: String, iv: String },
}

impl ClientFrame {
    pub fn message(envelope: Envelope) -> Self {
        Self::Message {
            ciphertext: envelope.ciphertext,
            iv: envelope.iv,
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Frames pushed by the server, keyed by their `type` field.
///
/// Anything the client does not model is kept verbatim in
/// [`ServerFrame::Unknown`] so handlers can still look at it.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    /// A stored chat message, broadcast to everyone in the room.
    Message(EncryptedMessage),
    /// Cross-room notification sent on the notification channel.
    RoomMessage(RoomNotification),
    /// Error reply to something this client sent.
    Error { message: String },
    /// Unrecognised `type`, or no `type` at all.
    Unknown { kind: Option<String>, raw: Value },
}

impl ServerFrame {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let kind = value.get("type").and_then(Value::as_str).map(str::to_owned);

        match kind.as_deref() {
            Some("message") => Ok(Self::Message(serde_json::from_value(value)?)),
            Some("room_message") => Ok(Self::RoomMessage(serde_json::from_value(value)?)),
            Some("error") => {
                let message = value
                    .get("message")
                    .and_then(Value::as_str)
                    .ok_or(ProtocolError::MissingField("message"))?;
                Ok(Self::Error {
                    message: message.to_owned(),
                })
            }
            _ => Ok(Self::Unknown { kind, raw: value }),
        }
    }

    /// The wire `type` of this frame, `"?"` when absent.
    pub fn kind(&self) -> &str {
        match self {
            Self::Message(_) => "message",
            Self::RoomMessage(_) => "room_message",
            Self::Error { .. } => "error",
            Self::Unknown { kind, .. } => kind.as_deref().unwrap_or("?"),
        }
    }
}

/// An encrypted chat message as stored by the server. Same shape whether it
/// arrives from REST history or live over the room channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMessage {
    pub id: MessageId,
    #[serde(deserialize_with = "lenient_room_id")]
    pub room: RoomId,
    /// Sender's family-member id.
    #[serde(default)]
    pub sender: Option<i64>,
    #[serde(default)]
    pub sender_username: Option<String>,
    #[serde(default)]
    pub sender_photo_url: Option<String>,
    #[serde(flatten)]
    pub envelope: Envelope,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Notification that a message landed in some room of the user's family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomNotification {
    #[serde(deserialize_with = "lenient_room_id")]
    pub room_id: RoomId,
    pub message_id: MessageId,
    #[serde(default)]
    pub sender: Option<i64>,
    #[serde(default)]
    pub sender_username: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
}

// The backend echoes the room id straight from the URL route on the
// notification channel, so it can arrive as "42" as well as 42.
fn lenient_room_id<'de, D>(deserializer: D) -> Result<RoomId, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IntOrString {
        Int(i64),
        Str(String),
    }

    match IntOrString::deserialize(deserializer)? {
        IntOrString::Int(n) => Ok(RoomId(n)),
        IntOrString::Str(s) => s
            .trim()
            .parse()
            .map(RoomId)
            .map_err(|e| serde::de::Error::custom(format!("invalid room id {s:?}: {e}"))),
    }
}

// ISO-8601 with or without an offset. Naive timestamps are taken as UTC;
// anything unparseable becomes `None` rather than failing the whole frame.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|s| parse_timestamp(&s)))
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
