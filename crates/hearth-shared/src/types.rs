use serde::{Deserialize, Serialize};

/// Chat room identifier assigned by the backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct RoomId(pub i64);

impl RoomId {
    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Family identifier. Every room belongs to exactly one family.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct FamilyId(pub i64);

impl FamilyId {
    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl std::fmt::Display for FamilyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-assigned message identifier, monotonic per backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which of the two logical WebSocket channels a connection serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Room(RoomId),
    Notifications,
}

impl ChannelKind {
    /// Path component of the WebSocket URL, always with a trailing slash.
    pub fn path(&self) -> String {
        match self {
            Self::Room(room) => format!("{}/{}/", crate::constants::WS_CHAT_PATH, room),
            Self::Notifications => format!("{}/notifications/", crate::constants::WS_CHAT_PATH),
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Room(room) => write!(f, "room:{room}"),
            Self::Notifications => write!(f, "notifications"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_paths() {
        assert_eq!(ChannelKind::Room(RoomId(42)).path(), "/ws/chat/42/");
        assert_eq!(ChannelKind::Notifications.path(), "/ws/chat/notifications/");
    }

    #[test]
    fn test_ids_serialize_as_plain_integers() {
        let json = serde_json::to_string(&MessageId(7)).unwrap();
        assert_eq!(json, "7");
        let room: RoomId = serde_json::from_str("42").unwrap();
        assert_eq!(room, RoomId(42));
    }
}
