//! Local storage of per-family secrets.
//!
//! Secrets are created on this device and never leave it. Creation is
//! "insert if absent, then read back": when two writers race, the first
//! insert wins and both callers observe the same bytes.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use hearth_shared::{FamilyId, FamilySecret};

use crate::database::Database;
use crate::error::{Result, StoreError};

/// Storage backend for family secrets.
pub trait SecretStore: Send + Sync {
    /// Fetch the secret for `family`, if one was ever stored.
    fn load_family_secret(&self, family: FamilyId) -> Result<Option<FamilySecret>>;

    /// Persist `candidate` unless a secret already exists for `family`.
    ///
    /// Returns whichever secret is stored afterwards, so a caller that lost
    /// the race gets the winner's bytes.
    fn store_family_secret_if_absent(
        &self,
        family: FamilyId,
        candidate: &FamilySecret,
    ) -> Result<FamilySecret>;

    /// Forget the secret for `family`. Returns `true` if one existed.
    fn delete_family_secret(&self, family: FamilyId) -> Result<bool>;
}

impl Database {
    pub fn get_family_secret(&self, family: FamilyId) -> Result<Option<FamilySecret>> {
        let bytes: Option<Vec<u8>> = self
            .conn()
            .query_row(
                "SELECT secret FROM family_secrets WHERE family_id = ?1",
                params![family.0],
                |row| row.get(0),
            )
            .optional()?;

        bytes
            .map(|b| FamilySecret::from_slice(&b).map_err(|_| StoreError::CorruptSecret(family.0)))
            .transpose()
    }

    /// Insert unless present, then read back, inside one transaction.
    pub fn insert_family_secret_if_absent(
        &mut self,
        family: FamilyId,
        candidate: &FamilySecret,
    ) -> Result<FamilySecret> {
        let tx = self.conn_mut().transaction()?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO family_secrets (family_id, secret, created_at)
             VALUES (?1, ?2, ?3)",
            params![family.0, candidate.as_bytes().as_slice(), Utc::now().to_rfc3339()],
        )?;

        let stored: Vec<u8> = tx.query_row(
            "SELECT secret FROM family_secrets WHERE family_id = ?1",
            params![family.0],
            |row| row.get(0),
        )?;
        tx.commit()?;

        if inserted == 0 {
            tracing::debug!(family = %family, "family secret already present, keeping stored one");
        } else {
            tracing::info!(family = %family, "stored new family secret");
        }

        FamilySecret::from_slice(&stored).map_err(|_| StoreError::CorruptSecret(family.0))
    }

    pub fn delete_family_secret(&self, family: FamilyId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM family_secrets WHERE family_id = ?1",
            params![family.0],
        )?;
        Ok(affected > 0)
    }

    /// Families that have a secret on this device, ascending.
    pub fn list_families_with_secrets(&self) -> Result<Vec<FamilyId>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT family_id FROM family_secrets ORDER BY family_id ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;

        let mut families = Vec::new();
        for row in rows {
            families.push(FamilyId(row?));
        }
        Ok(families)
    }
}

/// [`SecretStore`] backed by the local SQLite database.
pub struct SqliteSecretStore {
    db: Mutex<Database>,
}

impl SqliteSecretStore {
    pub fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }
}

impl SecretStore for SqliteSecretStore {
    fn load_family_secret(&self, family: FamilyId) -> Result<Option<FamilySecret>> {
        let db = self.db.lock().map_err(|_| StoreError::Poisoned)?;
        db.get_family_secret(family)
    }

    fn store_family_secret_if_absent(
        &self,
        family: FamilyId,
        candidate: &FamilySecret,
    ) -> Result<FamilySecret> {
        let mut db = self.db.lock().map_err(|_| StoreError::Poisoned)?;
        db.insert_family_secret_if_absent(family, candidate)
    }

    fn delete_family_secret(&self, family: FamilyId) -> Result<bool> {
        let db = self.db.lock().map_err(|_| StoreError::Poisoned)?;
        db.delete_family_secret(family)
    }
}

/// Volatile [`SecretStore`], for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: Mutex<HashMap<FamilyId, FamilySecret>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemorySecretStore {
    fn load_family_secret(&self, family: FamilyId) -> Result<Option<FamilySecret>> {
        let secrets = self.secrets.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(secrets.get(&family).cloned())
    }

    fn store_family_secret_if_absent(
        &self,
        family: FamilyId,
        candidate: &FamilySecret,
    ) -> Result<FamilySecret> {
        let mut secrets = self.secrets.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(secrets
            .entry(family)
            .or_insert_with(|| candidate.clone())
            .clone())
    }

    fn delete_family_secret(&self, family: FamilyId) -> Result<bool> {
        let mut secrets = self.secrets.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(secrets.remove(&family).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_secret_is_none() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_family_secret(FamilyId(7)).unwrap().is_none());
    }

    #[test]
    fn first_writer_wins() {
        let mut db = Database::open_in_memory().unwrap();
        let first = FamilySecret::generate();
        let second = FamilySecret::generate();

        let stored_a = db.insert_family_secret_if_absent(FamilyId(7), &first).unwrap();
        let stored_b = db.insert_family_secret_if_absent(FamilyId(7), &second).unwrap();

        assert_eq!(stored_a, first);
        assert_eq!(stored_b, first);
        assert_eq!(db.get_family_secret(FamilyId(7)).unwrap(), Some(first));
    }

    #[test]
    fn secrets_are_per_family() {
        let mut db = Database::open_in_memory().unwrap();
        let a = db
            .insert_family_secret_if_absent(FamilyId(1), &FamilySecret::generate())
            .unwrap();
        let b = db
            .insert_family_secret_if_absent(FamilyId(2), &FamilySecret::generate())
            .unwrap();

        assert_ne!(a, b);
        assert_eq!(
            db.list_families_with_secrets().unwrap(),
            vec![FamilyId(1), FamilyId(2)]
        );
    }

    #[test]
    fn secret_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.db");
        let secret = FamilySecret::generate();

        {
            let mut db = Database::open_at(&path).unwrap();
            db.insert_family_secret_if_absent(FamilyId(3), &secret).unwrap();
        }

        let db = Database::open_at(&path).unwrap();
        assert_eq!(db.get_family_secret(FamilyId(3)).unwrap(), Some(secret));
    }

    #[test]
    fn corrupt_secret_is_reported() {
        let db = Database::open_in_memory().unwrap();
        db.conn()
            .execute(
                "INSERT INTO family_secrets (family_id, secret, created_at) VALUES (?1, ?2, ?3)",
                params![9i64, vec![1u8, 2, 3], "2024-01-01T00:00:00Z"],
            )
            .unwrap();

        assert!(matches!(
            db.get_family_secret(FamilyId(9)),
            Err(StoreError::CorruptSecret(9))
        ));
    }

    #[test]
    fn delete_removes_secret() {
        let store = SqliteSecretStore::new(Database::open_in_memory().unwrap());
        store
            .store_family_secret_if_absent(FamilyId(5), &FamilySecret::generate())
            .unwrap();

        assert!(store.delete_family_secret(FamilyId(5)).unwrap());
        assert!(!store.delete_family_secret(FamilyId(5)).unwrap());
        assert!(store.load_family_secret(FamilyId(5)).unwrap().is_none());
    }

    #[test]
    fn memory_store_keeps_first_candidate() {
        let store = MemorySecretStore::new();
        let first = FamilySecret::generate();

        let a = store.store_family_secret_if_absent(FamilyId(1), &first).unwrap();
        let b = store
            .store_family_secret_if_absent(FamilyId(1), &FamilySecret::generate())
            .unwrap();

        assert_eq!(a, first);
        assert_eq!(b, first);
    }
}
