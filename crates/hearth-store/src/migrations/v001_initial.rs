//! v001 -- Initial schema creation.
//!
//! Creates the `family_secrets` table.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Family secrets (one symmetric seed per family, never synced)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS family_secrets (
    family_id  INTEGER PRIMARY KEY NOT NULL,
    secret     BLOB NOT NULL,                 -- 32 raw bytes
    created_at TEXT NOT NULL                  -- ISO-8601 / RFC-3339
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
