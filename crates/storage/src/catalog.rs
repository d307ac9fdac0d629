use rusqlite::Connection;

use crate::error::StorageError;

pub const PENDING_TABLE: &str = "pending_patches";
pub const SHADOW_SUFFIX: &str = "_patches";

pub const COL_PATCHED_AT: &str = "_patchedAt";
pub const COL_SEQUENCE_ID: &str = "_sequenceId";
pub const COL_PEER_ID: &str = "_peerId";

/// One replicated user table and its shadow, as discovered from the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    /// Base (materialised) table name.
    pub table: String,
    /// `<table>_patches`.
    pub shadow: String,
    /// Primary-key columns of the base table, in key order.
    pub pk_columns: Vec<String>,
    /// Remaining base-table columns.
    pub data_columns: Vec<String>,
}

impl TableSchema {
    /// Every user column, key columns first.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.pk_columns
            .iter()
            .chain(self.data_columns.iter())
            .map(String::as_str)
    }
}

/// Discover every `<T>_patches` shadow table (except the pending store) and
/// resolve its base table's key layout. The shadow must carry exactly the
/// three provenance columns followed by the base table's columns; a missing
/// `_patchedAt` index is tolerated but logged.
pub fn introspect(conn: &Connection) -> Result<Vec<TableSchema>, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name LIKE '%\\_patches' ESCAPE '\\' AND name <> ?1
         ORDER BY name",
    )?;
    let shadows: Vec<String> = stmt
        .query_map([PENDING_TABLE], |row| row.get(0))?
        .collect::<Result<_, _>>()?;
    drop(stmt);

    let mut schemas = Vec::with_capacity(shadows.len());
    for shadow in shadows {
        let table = shadow
            .strip_suffix(SHADOW_SUFFIX)
            .unwrap_or(&shadow)
            .to_string();

        let base_info = table_info(conn, &table)?;
        if base_info.is_empty() {
            return Err(StorageError::InvalidSchema(format!(
                "shadow table `{shadow}` has no base table `{table}`"
            )));
        }
        let mut keyed: Vec<(i64, String)> = base_info
            .iter()
            .filter(|(_, pk)| *pk > 0)
            .map(|(name, pk)| (*pk, name.clone()))
            .collect();
        keyed.sort();
        let pk_columns: Vec<String> = keyed.into_iter().map(|(_, name)| name).collect();
        if pk_columns.is_empty() {
            return Err(StorageError::InvalidSchema(format!(
                "replicated table `{table}` must declare a primary key"
            )));
        }
        let data_columns: Vec<String> = base_info
            .iter()
            .filter(|(_, pk)| *pk == 0)
            .map(|(name, _)| name.clone())
            .collect();

        check_shadow_columns(conn, &table, &shadow, &pk_columns, &data_columns)?;
        if !has_patched_at_index(conn, &shadow)? {
            tracing::warn!(shadow, "shadow table has no index on _patchedAt");
        }

        schemas.push(TableSchema {
            table,
            shadow,
            pk_columns,
            data_columns,
        });
    }
    Ok(schemas)
}

fn table_info(conn: &Connection, table: &str) -> Result<Vec<(String, i64)>, StorageError> {
    let mut stmt = conn.prepare("SELECT name, pk FROM pragma_table_info(?1)")?;
    let rows = stmt
        .query_map([table], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn check_shadow_columns(
    conn: &Connection,
    table: &str,
    shadow: &str,
    pk_columns: &[String],
    data_columns: &[String],
) -> Result<(), StorageError> {
    let actual: Vec<String> = table_info(conn, shadow)?
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    let mut expected: Vec<String> = vec![
        COL_PATCHED_AT.to_string(),
        COL_SEQUENCE_ID.to_string(),
        COL_PEER_ID.to_string(),
    ];
    expected.extend(pk_columns.iter().cloned());
    expected.extend(data_columns.iter().cloned());

    let mut actual_sorted = actual.clone();
    let mut expected_sorted = expected.clone();
    actual_sorted.sort();
    expected_sorted.sort();
    if actual_sorted != expected_sorted {
        return Err(StorageError::InvalidSchema(format!(
            "shadow `{shadow}` columns {actual:?} do not match `{table}` plus provenance"
        )));
    }
    Ok(())
}

fn has_patched_at_index(conn: &Connection, shadow: &str) -> Result<bool, StorageError> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_index_list(?1)")?;
    let indexes: Vec<String> = stmt
        .query_map([shadow], |row| row.get(0))?
        .collect::<Result<_, _>>()?;
    drop(stmt);
    for index in indexes {
        let first: Option<String> = conn
            .query_row(
                "SELECT name FROM pragma_index_info(?1) WHERE seqno = 0",
                [&index],
                |row| row.get(0),
            )
            .ok();
        if first.as_deref() == Some(COL_PATCHED_AT) {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn_with(ddl: &str) -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        crate::schema::init_schema(&conn).unwrap();
        conn.execute_batch(ddl).unwrap();
        conn
    }

    const TEST_DDL: &str = "
        CREATE TABLE testA (id INTEGER PRIMARY KEY, tenantId INTEGER, name TEXT);
        CREATE TABLE testA_patches (
            _patchedAt INTEGER NOT NULL, _sequenceId INTEGER NOT NULL, _peerId INTEGER NOT NULL,
            id INTEGER, tenantId INTEGER, name TEXT);
        CREATE INDEX idx_testA_patches_at ON testA_patches (_patchedAt);
    ";

    #[test]
    fn discovers_shadow_pairs() {
        let conn = conn_with(TEST_DDL);
        let schemas = introspect(&conn).unwrap();
        assert_eq!(schemas.len(), 1);
        let schema = &schemas[0];
        assert_eq!(schema.table, "testA");
        assert_eq!(schema.shadow, "testA_patches");
        assert_eq!(schema.pk_columns, vec!["id"]);
        assert_eq!(schema.data_columns, vec!["tenantId", "name"]);
    }

    #[test]
    fn pending_store_is_not_a_shadow() {
        let conn = conn_with("");
        assert!(introspect(&conn).unwrap().is_empty());
    }

    #[test]
    fn missing_base_table_is_an_error() {
        let conn = conn_with(
            "CREATE TABLE orphan_patches (_patchedAt INTEGER, _sequenceId INTEGER, _peerId INTEGER);",
        );
        assert!(matches!(
            introspect(&conn),
            Err(StorageError::InvalidSchema(_))
        ));
    }

    #[test]
    fn keyless_base_table_is_an_error() {
        let conn = conn_with(
            "CREATE TABLE nokey (a INTEGER);
             CREATE TABLE nokey_patches (_patchedAt INTEGER, _sequenceId INTEGER, _peerId INTEGER, a INTEGER);",
        );
        assert!(matches!(
            introspect(&conn),
            Err(StorageError::InvalidSchema(_))
        ));
    }

    #[test]
    fn composite_keys_keep_declaration_order() {
        let conn = conn_with(
            "CREATE TABLE pairs (b INTEGER, a INTEGER, v TEXT, PRIMARY KEY (a, b));
             CREATE TABLE pairs_patches (_patchedAt INTEGER, _sequenceId INTEGER, _peerId INTEGER,
                 b INTEGER, a INTEGER, v TEXT);",
        );
        let schemas = introspect(&conn).unwrap();
        assert_eq!(schemas[0].pk_columns, vec!["a", "b"]);
        assert_eq!(schemas[0].data_columns, vec!["v"]);
    }
}
