use rusqlite::Connection;

use crate::error::StorageError;

pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA cache_size = -32000;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    conn.execute_batch(INFRA_SQL)?;
    Ok(())
}

/// Infrastructure tables owned by the replication core. Every other table is
/// declared by the embedding application through migrations.
const INFRA_SQL: &str = "
CREATE TABLE IF NOT EXISTS migrations (
    id INTEGER PRIMARY KEY,
    up TEXT NOT NULL,
    down TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pending_patches (
    _patchedAt INTEGER NOT NULL,
    _peerId INTEGER NOT NULL,
    _sequenceId INTEGER NOT NULL,
    patchVersion INTEGER NOT NULL,
    tableName TEXT NOT NULL,
    delta TEXT
);
CREATE INDEX IF NOT EXISTS idx_pending_patches_patched_at ON pending_patches (_patchedAt);
";
