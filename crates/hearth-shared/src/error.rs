use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Invalid key length")]
    InvalidKeyLength,
}

impl CryptoError {
    /// True for every variant a reader of an inbound envelope can hit.
    pub fn is_decryption_error(&self) -> bool {
        matches!(self, Self::DecryptionFailed | Self::MalformedEnvelope(_))
    }
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame is missing field `{0}`")]
    MissingField(&'static str),
}
