//! Family secrets and room keys.
//!
//! The first use of a family creates its secret. Creation is serialized per
//! family in-process, and the store's insert-if-absent settles races with
//! other processes sharing the database. After that the secret is served
//! from memory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, info};

use hearth_shared::crypto::derive_room_key;
use hearth_shared::{FamilyId, FamilySecret, RoomId, RoomKey};
use hearth_store::SecretStore;

use crate::error::ClientError;

pub struct Keyring {
    store: Arc<dyn SecretStore>,
    cache: RwLock<HashMap<FamilyId, FamilySecret>>,
    creation: Mutex<HashMap<FamilyId, Arc<tokio::sync::Mutex<()>>>>,
}

impl Keyring {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
            creation: Mutex::new(HashMap::new()),
        }
    }

    /// The secret for `family`, generating and persisting one on first use.
    pub async fn get_or_create_family_secret(&self, family: FamilyId) -> Result<FamilySecret, ClientError> {
        if let Some(secret) = self.cached(family) {
            return Ok(secret);
        }

        let lock = self.creation_lock(family);
        let _guard = lock.lock().await;

        // Another task may have finished while we waited.
        if let Some(secret) = self.cached(family) {
            return Ok(secret);
        }

        let secret = match self.store.load_family_secret(family)? {
            Some(secret) => {
                debug!(family = %family, "loaded family secret");
                secret
            }
            None => {
                let stored = self
                    .store
                    .store_family_secret_if_absent(family, &FamilySecret::generate())?;
                info!(family = %family, "family secret ready");
                stored
            }
        };

        self.cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(family, secret.clone());
        Ok(secret)
    }

    pub async fn room_key(&self, room: RoomId, family: FamilyId) -> Result<RoomKey, ClientError> {
        let secret = self.get_or_create_family_secret(family).await?;
        Ok(derive_room_key(room, family, &secret))
    }

    /// Delete the family secret from memory and disk. Messages encrypted
    /// under it become unreadable on this device.
    pub fn forget_family(&self, family: FamilyId) -> Result<bool, ClientError> {
        self.cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&family);
        let existed = self.store.delete_family_secret(family)?;
        if existed {
            info!(family = %family, "family secret deleted");
        }
        Ok(existed)
    }

    fn cached(&self, family: FamilyId) -> Option<FamilySecret> {
        self.cache
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&family)
            .cloned()
    }

    fn creation_lock(&self, family: FamilyId) -> Arc<tokio::sync::Mutex<()>> {
        self.creation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(family)
            .or_default()
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use hearth_shared::crypto::{decrypt_text, encrypt_text};
    use hearth_store::{Database, MemorySecretStore, SqliteSecretStore};

    use super::*;

    fn memory_keyring() -> Keyring {
        Keyring::new(Arc::new(MemorySecretStore::default()))
    }

    #[tokio::test]
    async fn test_family_secret_is_idempotent() {
        let keyring = memory_keyring();
        let a = keyring.get_or_create_family_secret(FamilyId(7)).await.unwrap();
        let b = keyring.get_or_create_family_secret(FamilyId(7)).await.unwrap();
        assert_eq!(a, b);

        let other = keyring.get_or_create_family_secret(FamilyId(8)).await.unwrap();
        assert_ne!(a, other);
    }

    #[tokio::test]
    async fn test_concurrent_first_use_yields_one_secret() {
        let keyring = Arc::new(memory_keyring());
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let keyring = keyring.clone();
            tasks.push(tokio::spawn(async move {
                keyring.get_or_create_family_secret(FamilyId(7)).await.unwrap()
            }));
        }

        let mut secrets = Vec::new();
        for task in tasks {
            secrets.push(task.await.unwrap());
        }
        assert!(secrets.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_two_keyrings_sharing_a_store_agree() {
        let store: Arc<dyn SecretStore> = Arc::new(MemorySecretStore::default());
        let first = Keyring::new(store.clone());
        let second = Keyring::new(store);

        let (a, b) = tokio::join!(
            first.get_or_create_family_secret(FamilyId(3)),
            second.get_or_create_family_secret(FamilyId(3)),
        );
        assert_eq!(a.unwrap(), b.unwrap());
    }

    #[tokio::test]
    async fn test_secret_survives_restart() {
        let dir = tempfile::tempdir().unwrap();

        let key_before = {
            let store = SqliteSecretStore::new(Database::open_in(dir.path()).unwrap());
            let keyring = Keyring::new(Arc::new(store));
            keyring.room_key(RoomId(42), FamilyId(7)).await.unwrap()
        };

        let store = SqliteSecretStore::new(Database::open_in(dir.path()).unwrap());
        let keyring = Keyring::new(Arc::new(store));
        let key_after = keyring.room_key(RoomId(42), FamilyId(7)).await.unwrap();

        assert_eq!(key_before, key_after);
    }

    #[tokio::test]
    async fn test_room_keys_are_scoped_to_room() {
        let keyring = memory_keyring();
        let k42 = keyring.room_key(RoomId(42), FamilyId(7)).await.unwrap();
        let k43 = keyring.room_key(RoomId(43), FamilyId(7)).await.unwrap();
        assert_ne!(k42, k43);

        let envelope = encrypt_text(&k42, "Hello").unwrap();
        assert!(decrypt_text(&k43, &envelope).is_err());
        assert_eq!(decrypt_text(&k42, &envelope).unwrap(), "Hello");
    }

    #[tokio::test]
    async fn test_forget_family_rotates_secret() {
        let keyring = memory_keyring();
        let before = keyring.get_or_create_family_secret(FamilyId(1)).await.unwrap();

        assert!(keyring.forget_family(FamilyId(1)).unwrap());
        assert!(!keyring.forget_family(FamilyId(1)).unwrap());

        let after = keyring.get_or_create_family_secret(FamilyId(1)).await.unwrap();
        assert_ne!(before, after);
    }
}
