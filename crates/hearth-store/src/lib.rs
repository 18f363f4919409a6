//! # hearth-store
//!
//! Local storage for the Hearth client, backed by SQLite.
//!
//! The only thing persisted is the per-family secret that room keys are
//! derived from. The crate exposes a synchronous `Database` handle plus the
//! [`SecretStore`] trait the key manager is written against.

pub mod database;
pub mod migrations;
pub mod secrets;

mod error;

pub use database::{default_data_dir, Database};
pub use error::StoreError;
pub use secrets::{MemorySecretStore, SecretStore, SqliteSecretStore};
