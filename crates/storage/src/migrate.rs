use rusqlite::params;

use crate::error::StorageError;
use crate::store::PatchStore;

/// One versioned schema change. Position in the application's migration list
/// is the schema version (1-based).
#[derive(Debug, Clone)]
pub struct Migration {
    pub up: String,
    pub down: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationOutcome {
    pub current_version: u32,
    pub previous_version: u32,
}

impl PatchStore {
    /// Bring the catalog to `migrations.len()`: surplus recorded migrations
    /// run their stored `down` in reverse, new entries run `up` forward. The
    /// whole batch is one savepoint; any failure rolls everything back and
    /// leaves the catalog unchanged. On success the statement plans are
    /// recompiled.
    pub fn migrate(&mut self, migrations: &[Migration]) -> Result<MigrationOutcome, StorageError> {
        let previous: u32 = self.conn().query_row(
            "SELECT coalesce(max(id), 0) FROM migrations",
            [],
            |row| row.get(0),
        )?;
        let target = migrations.len() as u32;

        self.conn().execute_batch("SAVEPOINT sp_migrate")?;
        let result = (|| -> Result<(), StorageError> {
            if target < previous {
                for id in ((target + 1)..=previous).rev() {
                    let down: String = self.conn().query_row(
                        "SELECT down FROM migrations WHERE id = ?1",
                        params![id],
                        |row| row.get(0),
                    )?;
                    self.conn().execute_batch(&down)?;
                    self.conn()
                        .execute("DELETE FROM migrations WHERE id = ?1", params![id])?;
                }
            } else {
                for id in (previous + 1)..=target {
                    let migration = &migrations[(id - 1) as usize];
                    self.conn().execute_batch(&migration.up)?;
                    self.conn().execute(
                        "INSERT INTO migrations (id, up, down) VALUES (?1, ?2, ?3)",
                        params![id, migration.up, migration.down],
                    )?;
                }
            }
            Ok(())
        })();

        match result {
            Ok(()) => self.conn().execute_batch("RELEASE sp_migrate")?,
            Err(e) => {
                let _ = self
                    .conn()
                    .execute_batch("ROLLBACK TO sp_migrate; RELEASE sp_migrate");
                return Err(e);
            }
        }

        self.replan()?;
        let current_version = if migrations.is_empty() { 1 } else { target };
        Ok(MigrationOutcome {
            current_version,
            previous_version: previous,
        })
    }
}
