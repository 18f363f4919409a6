use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{FAMILY_SECRET_SIZE, KDF_CONTEXT_ROOM_KEY, NONCE_SIZE, SYMMETRIC_KEY_SIZE};
use crate::error::CryptoError;
use crate::types::{FamilyId, RoomId};

/// Per-family symmetric seed. Lives only on this device.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct FamilySecret([u8; FAMILY_SECRET_SIZE]);

impl FamilySecret {
    /// Fresh secret from the OS RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; FAMILY_SECRET_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; FAMILY_SECRET_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; FAMILY_SECRET_SIZE] =
            bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength)?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; FAMILY_SECRET_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for FamilySecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FamilySecret(..)")
    }
}

/// Symmetric key for one room. Recomputed every session, never stored.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct RoomKey([u8; SYMMETRIC_KEY_SIZE]);

impl RoomKey {
    pub fn from_bytes(bytes: [u8; SYMMETRIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SYMMETRIC_KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for RoomKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RoomKey(..)")
    }
}

/// Ciphertext plus nonce, both base64 as they travel on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub ciphertext: String,
    pub iv: String,
}

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

// BLAKE3 KDF with domain separation. Ids are fixed-width so that
// (room, family) pairs can never collide through concatenation.
pub fn derive_room_key(room_id: RoomId, family_id: FamilyId, secret: &FamilySecret) -> RoomKey {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_ROOM_KEY);
    hasher.update(secret.as_bytes());
    hasher.update(&room_id.to_be_bytes());
    hasher.update(&family_id.to_be_bytes());
    let hash = hasher.finalize();
    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    key.copy_from_slice(&hash.as_bytes()[..SYMMETRIC_KEY_SIZE]);
    RoomKey(key)
}

pub fn encrypt(key: &RoomKey, plaintext: &[u8]) -> Result<Envelope, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let nonce_bytes = generate_nonce();
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok(Envelope {
        ciphertext: B64.encode(ciphertext),
        iv: B64.encode(nonce_bytes),
    })
}

pub fn decrypt(key: &RoomKey, envelope: &Envelope) -> Result<Vec<u8>, CryptoError> {
    let nonce_bytes = B64
        .decode(envelope.iv.as_bytes())
        .map_err(|e| CryptoError::MalformedEnvelope(format!("iv: {e}")))?;
    if nonce_bytes.len() != NONCE_SIZE {
        return Err(CryptoError::MalformedEnvelope(format!(
            "iv must be {NONCE_SIZE} bytes, got {}",
            nonce_bytes.len()
        )));
    }
    let ciphertext = B64
        .decode(envelope.ciphertext.as_bytes())
        .map_err(|e| CryptoError::MalformedEnvelope(format!("ciphertext: {e}")))?;

    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let nonce = XNonce::from_slice(&nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext.as_slice())
        .map_err(|_| CryptoError::DecryptionFailed)
}

pub fn encrypt_text(key: &RoomKey, plaintext: &str) -> Result<Envelope, CryptoError> {
    encrypt(key, plaintext.as_bytes())
}

pub fn decrypt_text(key: &RoomKey, envelope: &Envelope) -> Result<String, CryptoError> {
    let bytes = decrypt(key, envelope)?;
    String::from_utf8(bytes).map_err(|_| CryptoError::DecryptionFailed)
}
