use std::collections::BTreeMap;

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection};

use quiltdb_core::{Delta, Hlc, Message, Patch, PeerId, PeerStats, Value, STATS_TABLE};

use crate::catalog;
use crate::error::StorageError;
use crate::keep_last;
use crate::planner::{self, PlaceholderHook, Plans, TablePlan};
use crate::schema;

/// One detected hole in a producer's sequence axis: the row *before* the gap
/// plus the gap width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissingRange {
    pub peer: PeerId,
    pub seq: u64,
    pub at: Hlc,
    pub missing: u64,
}

fn value_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(n) => SqlValue::Integer(*n),
        Value::Real(x) => SqlValue::Real(*x),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Blob(b) => SqlValue::Blob(b.clone()),
        // Arrays only occur in peer-stat snapshots, which are persisted as
        // JSON text in the pending store, never bound into a shadow column.
        Value::Array(items) => SqlValue::Text(
            serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string()),
        ),
    }
}

/// Owns the database connection and the compiled statement plans.
///
/// All reads and writes of shadow stores, the pending store and the
/// materialised tables flow through here; the engine never touches SQL.
pub struct PatchStore {
    conn: Connection,
    plans: Plans,
    hook: PlaceholderHook,
}

impl PatchStore {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        Self::build(Connection::open(path)?, planner::default_placeholder())
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::build(Connection::open_in_memory()?, planner::default_placeholder())
    }

    pub fn open_with_hook(path: &str, hook: PlaceholderHook) -> Result<Self, StorageError> {
        Self::build(Connection::open(path)?, hook)
    }

    pub fn open_in_memory_with_hook(hook: PlaceholderHook) -> Result<Self, StorageError> {
        Self::build(Connection::open_in_memory()?, hook)
    }

    fn build(conn: Connection, hook: PlaceholderHook) -> Result<Self, StorageError> {
        schema::init_schema(&conn)?;
        keep_last::register(&conn)?;
        let mut store = Self {
            conn,
            plans: planner::plan(&[], &hook),
            hook,
        };
        store.replan()?;
        Ok(store)
    }

    /// Recompile every statement from the current catalog. Run after each
    /// migration batch.
    pub fn replan(&mut self) -> Result<(), StorageError> {
        let schemas = catalog::introspect(&self.conn)?;
        self.plans = planner::plan(&schemas, &self.hook);
        Ok(())
    }

    /// Expose the connection for reads from the embedding and from tests.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn table_plan(&self, table: &str) -> Option<&TablePlan> {
        self.plans.tables.get(table)
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.plans.tables.keys().map(String::as_str)
    }

    /// Persist one patch into its table's shadow store. Delta keys outside
    /// the planned column set are dropped; planned columns missing from the
    /// delta are stored as null ("not touched").
    pub fn save_patch(&self, patch: &Patch) -> Result<(), StorageError> {
        let plan = self
            .plans
            .tables
            .get(&patch.tab)
            .ok_or_else(|| StorageError::UnknownTable(patch.tab.clone()))?;
        let mut values: Vec<SqlValue> = vec![
            SqlValue::Integer(patch.at.as_u64() as i64),
            SqlValue::Integer(patch.seq as i64),
            SqlValue::Integer(patch.peer.get() as i64),
        ];
        for column in plan.schema.columns() {
            values.push(
                patch
                    .delta
                    .get(column)
                    .map(value_to_sql)
                    .unwrap_or(SqlValue::Null),
            );
        }
        self.conn
            .execute(&plan.save_patch, params_from_iter(values))?;
        Ok(())
    }

    /// Stage a patch whose schema version does not match the local one, or a
    /// persistent ping snapshot (reserved table name).
    pub fn save_pending(&self, patch: &Patch) -> Result<(), StorageError> {
        let delta = serde_json::to_string(&patch.delta)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.conn.execute(
            "INSERT INTO pending_patches (_patchedAt, _peerId, _sequenceId, patchVersion, tableName, delta)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                patch.at.as_u64() as i64,
                patch.peer.get() as i64,
                patch.seq as i64,
                patch.ver,
                patch.tab,
                delta,
            ],
        )?;
        Ok(())
    }

    /// Build and stage a persistent peer-stat snapshot: a patch on the
    /// reserved table whose delta maps each peer id to its counter vector.
    /// Returns the staged patch so the caller can broadcast it.
    pub fn save_ping_snapshot(
        &self,
        at: Hlc,
        peer: PeerId,
        seq: u64,
        ver: u32,
        stats: &BTreeMap<PeerId, PeerStats>,
    ) -> Result<Patch, StorageError> {
        let mut delta = Delta::new();
        for (id, entry) in stats {
            delta.insert(
                id.to_string(),
                Value::Array(vec![
                    Value::Integer(entry.last_patch_at.as_u64() as i64),
                    Value::Integer(entry.last_sequence_id as i64),
                    Value::Integer(entry.contiguous_patch_at.as_u64() as i64),
                    Value::Integer(entry.contiguous_sequence_id as i64),
                    Value::Integer(entry.last_message_ms as i64),
                ]),
            );
        }
        let patch = Patch {
            at,
            peer,
            seq,
            ver,
            tab: STATS_TABLE.to_string(),
            delta,
        };
        self.save_pending(&patch)?;
        Ok(patch)
    }

    /// Fold every shadow row at or after `from` into the materialised table.
    pub fn apply_patches(&self, table: &str, from: Hlc) -> Result<usize, StorageError> {
        let plan = self
            .plans
            .tables
            .get(table)
            .ok_or_else(|| StorageError::UnknownTable(table.to_string()))?;
        let count = self
            .conn
            .execute(&plan.apply_patches, params![from.as_u64() as i64])?;
        Ok(count)
    }

    /// Retention sweep: drop rows older than `cutoff` from every shadow store
    /// and the pending store. Returns the number of rows deleted.
    pub fn delete_old_patches(&self, cutoff: Hlc) -> Result<usize, StorageError> {
        let cutoff = cutoff.as_u64() as i64;
        let mut deleted = 0;
        for plan in self.plans.tables.values() {
            deleted += self.conn.execute(&plan.delete_old_patches, params![cutoff])?;
        }
        deleted += self
            .conn
            .execute(&self.plans.delete_old_pending, params![cutoff])?;
        Ok(deleted)
    }

    /// List every sequence hole visible at or after `from`, ordered by
    /// `(peer, seq)`. Leading holes (a producer whose first visible sequence
    /// exceeds 1) are only reported on a full scan (`from == 0`).
    pub fn list_missing(&self, from: Hlc) -> Result<Vec<MissingRange>, StorageError> {
        let from = from.as_u64() as i64;
        // Two binds per store: the row filter and the anchor-row guard.
        let members = self.plans.tables.len() + 1;
        let bindings = vec![from; members * 2];
        let mut stmt = self.conn.prepare(&self.plans.list_missing)?;
        let rows = stmt.query_map(params_from_iter(bindings), |row| {
            Ok(MissingRange {
                peer: PeerId::new(row.get::<_, i64>(0)? as u64),
                seq: row.get::<_, i64>(1)? as u64,
                at: Hlc::from_raw(row.get::<_, i64>(2)? as u64),
                missing: row.get::<_, i64>(3)? as u64,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Highest `(at, seq)` among one producer's rows across every store.
    /// Restores the local sequence counters at startup.
    pub fn last_patch_info(
        &self,
        peer: PeerId,
        from: Hlc,
    ) -> Result<Option<(Hlc, u64)>, StorageError> {
        let members = self.plans.tables.len() + 1;
        let mut bindings = Vec::with_capacity(members * 2);
        for _ in 0..members {
            bindings.push(peer.get() as i64);
            bindings.push(from.as_u64() as i64);
        }
        let row: (Option<i64>, Option<i64>) = self.conn.query_row(
            &self.plans.last_patch_info,
            params_from_iter(bindings),
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        match row {
            (Some(at), Some(seq)) => Ok(Some((Hlc::from_raw(at as u64), seq as u64))),
            _ => Ok(None),
        }
    }

    /// Serve one producer's patches in `[min..=max]` from whichever store
    /// holds them, ordered by sequence id. Shadow rows carry `ver`; pending
    /// rows keep their staged version.
    pub fn patches_in_range(
        &self,
        peer: PeerId,
        min_seq: u64,
        max_seq: u64,
        ver: u32,
    ) -> Result<Vec<Patch>, StorageError> {
        let mut bindings: Vec<i64> = Vec::new();
        for _ in self.plans.tables.values() {
            bindings.push(ver as i64);
            bindings.push(peer.get() as i64);
            bindings.push(min_seq as i64);
            bindings.push(max_seq as i64);
        }
        bindings.push(peer.get() as i64);
        bindings.push(min_seq as i64);
        bindings.push(max_seq as i64);

        let mut stmt = self.conn.prepare(&self.plans.select_range)?;
        let envelopes: Vec<String> = stmt
            .query_map(params_from_iter(bindings), |row| row.get(1))?
            .collect::<Result<_, _>>()?;
        let mut patches = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            match Message::decode_json(&envelope)? {
                Message::Patch(patch) => patches.push(patch),
                other => {
                    return Err(StorageError::Serialization(format!(
                        "expected patch envelope, got type {}",
                        other.kind()
                    )))
                }
            }
        }
        Ok(patches)
    }

    /// Drain staged patches whose version now matches the local schema.
    /// Ping snapshots (reserved table) stay staged until retention removes
    /// them. Returns the drained patches ordered by `(peer, seq)`.
    pub fn take_pending(&self, version: u32) -> Result<Vec<Patch>, StorageError> {
        self.conn.execute_batch("SAVEPOINT sp_take_pending")?;
        let result = (|| -> Result<Vec<Patch>, StorageError> {
            let mut stmt = self.conn.prepare(
                "SELECT _patchedAt, _peerId, _sequenceId, tableName, delta
                 FROM pending_patches
                 WHERE patchVersion = ?1 AND tableName <> '_'
                 ORDER BY _peerId, _sequenceId",
            )?;
            let rows = stmt.query_map(params![version], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })?;
            let mut patches = Vec::new();
            for row in rows {
                let (at, peer, seq, tab, delta) = row?;
                let delta = match delta {
                    Some(text) => serde_json::from_str(&text)
                        .map_err(|e| StorageError::Serialization(e.to_string()))?,
                    None => Default::default(),
                };
                patches.push(Patch {
                    at: Hlc::from_raw(at as u64),
                    peer: PeerId::new(peer as u64),
                    seq: seq as u64,
                    ver: version,
                    tab,
                    delta,
                });
            }
            drop(stmt);
            self.conn.execute(
                "DELETE FROM pending_patches WHERE patchVersion = ?1 AND tableName <> '_'",
                params![version],
            )?;
            Ok(patches)
        })();
        match result {
            Ok(patches) => {
                self.conn.execute_batch("RELEASE sp_take_pending")?;
                Ok(patches)
            }
            Err(e) => {
                let _ = self
                    .conn
                    .execute_batch("ROLLBACK TO sp_take_pending; RELEASE sp_take_pending");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiltdb_core::Delta;
    use std::collections::BTreeMap;

    const TEST_DDL: &str = "
        CREATE TABLE testA (id INTEGER PRIMARY KEY, tenantId INTEGER, name TEXT, deletedAt INTEGER, createdAt INTEGER);
        CREATE TABLE testA_patches (
            _patchedAt INTEGER NOT NULL, _sequenceId INTEGER NOT NULL, _peerId INTEGER NOT NULL,
            id INTEGER, tenantId INTEGER, name TEXT, deletedAt INTEGER, createdAt INTEGER);
        CREATE INDEX idx_testA_patches_at ON testA_patches (_patchedAt);
    ";

    fn store() -> PatchStore {
        let mut store = PatchStore::open_in_memory().unwrap();
        store.conn().execute_batch(TEST_DDL).unwrap();
        store.replan().unwrap();
        store
    }

    fn patch(peer: u64, seq: u64, at: u64, pairs: &[(&str, Value)]) -> Patch {
        let mut delta = Delta::new();
        for (key, value) in pairs {
            delta.insert((*key).to_string(), value.clone());
        }
        Patch {
            at: Hlc::from_raw(at),
            peer: PeerId::new(peer),
            seq,
            ver: 1,
            tab: "testA".into(),
            delta,
        }
    }

    #[test]
    fn save_projects_unknown_columns_away() {
        let store = store();
        let mut delta = Delta::new();
        delta.insert("id".into(), Value::Integer(1));
        delta.insert("name".into(), Value::Text("x".into()));
        delta.insert("unknownColumn".into(), Value::Text("dropped".into()));
        let patch = Patch {
            at: Hlc::from_raw(100),
            peer: PeerId::new(1800),
            seq: 1,
            ver: 1,
            tab: "testA".into(),
            delta,
        };
        store.save_patch(&patch).unwrap();
        let (seq, peer, name): (i64, i64, String) = store
            .conn()
            .query_row(
                "SELECT _sequenceId, _peerId, name FROM testA_patches",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!((seq, peer, name.as_str()), (1, 1800, "x"));
    }

    #[test]
    fn apply_merges_lww_per_column() {
        let store = store();
        // Row 1 written twice; the later patch leaves `name` untouched.
        store
            .save_patch(&patch(
                20,
                1,
                100,
                &[("id", 1.into()), ("tenantId", 7.into()), ("name", "first".into())],
            ))
            .unwrap();
        store
            .save_patch(&patch(20, 2, 200, &[("id", 1.into()), ("tenantId", 8.into())]))
            .unwrap();
        store.apply_patches("testA", Hlc::ZERO).unwrap();
        let (tenant, name): (i64, String) = store
            .conn()
            .query_row("SELECT tenantId, name FROM testA WHERE id = 1", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!(tenant, 8);
        assert_eq!(name, "first");
    }

    #[test]
    fn apply_from_timestamp_never_nulls_existing_values() {
        let store = store();
        store
            .save_patch(&patch(20, 1, 100, &[("id", 1.into()), ("name", "keep".into())]))
            .unwrap();
        store.apply_patches("testA", Hlc::ZERO).unwrap();
        // A later partial patch applied from its own timestamp: the fold only
        // sees the new row, whose other columns are null.
        store
            .save_patch(&patch(20, 2, 200, &[("id", 1.into()), ("tenantId", 5.into())]))
            .unwrap();
        store.apply_patches("testA", Hlc::from_raw(200)).unwrap();
        let (tenant, name): (i64, String) = store
            .conn()
            .query_row("SELECT tenantId, name FROM testA WHERE id = 1", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!(tenant, 5);
        assert_eq!(name, "keep");
    }

    #[test]
    fn list_missing_reports_leading_and_interior_gaps() {
        let store = store();
        for seq in [2u64, 4] {
            store
                .save_patch(&patch(2, seq, 100 + seq, &[("id", 1.into())]))
                .unwrap();
        }
        let gaps = store.list_missing(Hlc::ZERO).unwrap();
        assert_eq!(gaps.len(), 2);
        assert_eq!((gaps[0].seq, gaps[0].missing), (0, 1));
        assert_eq!((gaps[1].seq, gaps[1].missing), (2, 1));
        assert_eq!(gaps[1].at, Hlc::from_raw(102));
    }

    #[test]
    fn list_missing_after_cutoff_ignores_leading_holes() {
        let store = store();
        // Retention removed seq 1; a scan from a later timestamp must not
        // resurrect the leading hole.
        for seq in [5u64, 6, 8] {
            store
                .save_patch(&patch(2, seq, 100 + seq, &[("id", 1.into())]))
                .unwrap();
        }
        let gaps = store.list_missing(Hlc::from_raw(100)).unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!((gaps[0].seq, gaps[0].missing), (6, 1));
    }

    #[test]
    fn last_patch_info_spans_pending() {
        let store = store();
        store
            .save_patch(&patch(1800, 2, 100, &[("id", 1.into())]))
            .unwrap();
        let mut staged = patch(1800, 4, 300, &[("id", 2.into())]);
        staged.ver = 9;
        store.save_pending(&staged).unwrap();
        let (at, seq) = store
            .last_patch_info(PeerId::new(1800), Hlc::ZERO)
            .unwrap()
            .unwrap();
        assert_eq!(seq, 4);
        assert_eq!(at, Hlc::from_raw(300));
        assert!(store
            .last_patch_info(PeerId::new(77), Hlc::ZERO)
            .unwrap()
            .is_none());
    }

    #[test]
    fn range_serving_orders_by_sequence() {
        let store = store();
        for (seq, at) in [(3u64, 300u64), (1, 100), (5, 500)] {
            store
                .save_patch(&patch(3, seq, at, &[("id", Value::Integer(seq as i64 + 10))]))
                .unwrap();
        }
        let served = store
            .patches_in_range(PeerId::new(3), 2, 100, 1)
            .unwrap();
        assert_eq!(served.len(), 2);
        assert_eq!(served[0].seq, 3);
        assert_eq!(served[1].seq, 5);
        assert_eq!(served[0].tab, "testA");
        assert_eq!(served[0].ver, 1);
    }

    #[test]
    fn take_pending_drains_only_matching_version() {
        let store = store();
        let mut v2 = patch(9, 1, 100, &[("id", 1.into()), ("name", "v2".into())]);
        v2.ver = 2;
        let mut v3 = patch(9, 2, 200, &[("id", 2.into())]);
        v3.ver = 3;
        store.save_pending(&v2).unwrap();
        store.save_pending(&v3).unwrap();

        let drained = store.take_pending(2).unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].seq, 1);
        assert_eq!(drained[0].delta.get("name"), Some(&Value::Text("v2".into())));

        let left: i64 = store
            .conn()
            .query_row("SELECT count(*) FROM pending_patches", [], |row| row.get(0))
            .unwrap();
        assert_eq!(left, 1);
    }

    #[test]
    fn retention_sweeps_shadow_and_pending() {
        let store = store();
        store
            .save_patch(&patch(1, 1, 100, &[("id", 1.into())]))
            .unwrap();
        store
            .save_patch(&patch(1, 2, 900, &[("id", 2.into())]))
            .unwrap();
        let mut staged = patch(2, 1, 50, &[("id", 3.into())]);
        staged.ver = 4;
        store.save_pending(&staged).unwrap();

        let deleted = store.delete_old_patches(Hlc::from_raw(500)).unwrap();
        assert_eq!(deleted, 2);
        let left: i64 = store
            .conn()
            .query_row("SELECT count(*) FROM testA_patches", [], |row| row.get(0))
            .unwrap();
        assert_eq!(left, 1);
    }

    #[test]
    fn ping_snapshots_stage_stat_vectors_as_json() {
        let store = store();
        let mut stats = BTreeMap::new();
        stats.insert(
            PeerId::new(100),
            PeerStats {
                last_patch_at: Hlc::from_raw(900),
                last_sequence_id: 3,
                contiguous_patch_at: Hlc::from_raw(700),
                contiguous_sequence_id: 2,
                last_message_ms: 5,
            },
        );
        let snapshot = store
            .save_ping_snapshot(Hlc::from_raw(950), PeerId::new(1800), 9, 1, &stats)
            .unwrap();
        assert_eq!(snapshot.tab, "_");
        assert_eq!(snapshot.seq, 9);
        let (seq, text): (i64, String) = store
            .conn()
            .query_row(
                "SELECT _sequenceId, delta FROM pending_patches WHERE tableName = '_'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(seq, 9);
        assert_eq!(text, "{\"100\":[900,3,700,2,5]}");
    }
}
