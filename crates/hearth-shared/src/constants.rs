/// Application name
pub const APP_NAME: &str = "Hearth";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Family secret size in bytes
pub const FAMILY_SECRET_SIZE: usize = 32;

/// Key derivation context (BLAKE3)
pub const KDF_CONTEXT_ROOM_KEY: &str = "hearth-room-key-v1";

/// WebSocket path prefix for chat channels
pub const WS_CHAT_PATH: &str = "/ws/chat";

/// Query parameter carrying the access token on the WebSocket handshake
pub const TOKEN_QUERY_PARAM: &str = "token";

/// Text shown in place of a message that could not be decrypted
pub const ENCRYPTED_PLACEHOLDER: &str = "[Encrypted message]";

/// Close codes sent by the chat backend
pub const CLOSE_SERVER_ERROR: u16 = 4000;
pub const CLOSE_UNAUTHORIZED: u16 = 4001;
pub const CLOSE_FORBIDDEN: u16 = 4003;
