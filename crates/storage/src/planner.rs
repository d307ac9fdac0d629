use std::collections::BTreeMap;

use crate::catalog::{TableSchema, COL_PATCHED_AT, COL_PEER_ID, COL_SEQUENCE_ID, PENDING_TABLE};

/// Chooses the parameter placeholder for a given (table, column). The default
/// emits plain `?`; embeddings with a different prepare layer can override.
pub type PlaceholderHook = Box<dyn Fn(&str, &str) -> String>;

pub fn default_placeholder() -> PlaceholderHook {
    Box::new(|_table, _column| "?".to_string())
}

fn q(ident: &str) -> String {
    format!("\"{ident}\"")
}

/// Compiled SQL for one replicated table.
pub struct TablePlan {
    pub schema: TableSchema,
    /// Insert one patch row into the shadow table.
    pub save_patch: String,
    /// Fold shadow rows at or after a timestamp into the materialised table.
    pub apply_patches: String,
    /// Retention delete on the shadow table.
    pub delete_old_patches: String,
    /// Serve `(seq, json envelope)` rows for one producer and range.
    select_range: String,
}

/// Compiled SQL spanning every store, pending included.
pub struct Plans {
    pub tables: BTreeMap<String, TablePlan>,
    /// Gap listing: rows whose next same-peer sibling skips sequence ids.
    /// Binds, in table order then pending: `[from_ts, from_ts]` per store.
    pub list_missing: String,
    /// `(max at, max seq)` over one producer's rows across every store.
    /// Binds `[peer, from_ts]` per store.
    pub last_patch_info: String,
    /// `(seq, json envelope)` for one producer and range across every store,
    /// ordered by seq. Binds `[ver, peer, min, max]` per table then
    /// `[peer, min, max]` for pending.
    pub select_range: String,
    /// Retention delete on the pending store.
    pub delete_old_pending: String,
}

pub fn plan(schemas: &[TableSchema], hook: &PlaceholderHook) -> Plans {
    let mut tables = BTreeMap::new();
    for schema in schemas {
        tables.insert(schema.table.clone(), plan_table(schema, hook));
    }

    let ph = |column: &str| hook(PENDING_TABLE, column);

    let mut missing_members = Vec::new();
    let mut info_members = Vec::new();
    let mut range_members = Vec::new();
    for table_plan in tables.values() {
        let shadow = q(&table_plan.schema.shadow);
        let p_at = hook(&table_plan.schema.table, COL_PATCHED_AT);
        let p_peer = hook(&table_plan.schema.table, COL_PEER_ID);
        missing_members.push(format!(
            "SELECT {peer} AS peer, {seq} AS seq, {at} AS at FROM {shadow} WHERE {at} >= {p_at}\n\
             UNION ALL\n\
             SELECT DISTINCT {peer}, 0, 0 FROM {shadow} WHERE {p_at} <= 0",
            peer = q(COL_PEER_ID),
            seq = q(COL_SEQUENCE_ID),
            at = q(COL_PATCHED_AT),
        ));
        info_members.push(format!(
            "SELECT {at} AS at, {seq} AS seq FROM {shadow} WHERE {peer} = {p_peer} AND {at} >= {p_at}",
            peer = q(COL_PEER_ID),
            seq = q(COL_SEQUENCE_ID),
            at = q(COL_PATCHED_AT),
        ));
        range_members.push(table_plan.select_range.clone());
    }

    missing_members.push(format!(
        "SELECT {peer} AS peer, {seq} AS seq, {at} AS at FROM {pending} WHERE {at} >= {p_at}\n\
         UNION ALL\n\
         SELECT DISTINCT {peer}, 0, 0 FROM {pending} WHERE {p_at} <= 0",
        peer = q(COL_PEER_ID),
        seq = q(COL_SEQUENCE_ID),
        at = q(COL_PATCHED_AT),
        pending = q(PENDING_TABLE),
        p_at = ph(COL_PATCHED_AT),
    ));
    info_members.push(format!(
        "SELECT {at} AS at, {seq} AS seq FROM {pending} WHERE {peer} = {p_peer} AND {at} >= {p_at}",
        peer = q(COL_PEER_ID),
        seq = q(COL_SEQUENCE_ID),
        at = q(COL_PATCHED_AT),
        pending = q(PENDING_TABLE),
        p_peer = ph(COL_PEER_ID),
        p_at = ph(COL_PATCHED_AT),
    ));
    range_members.push(format!(
        "SELECT {seq} AS seq, json_object('type', 10, 'at', {at}, 'peer', {peer}, 'seq', {seq}, \
         'ver', \"patchVersion\", 'tab', \"tableName\", 'delta', json(\"delta\")) AS envelope \
         FROM {pending} WHERE {peer} = {p_peer} AND {seq} BETWEEN {p_min} AND {p_max}",
        seq = q(COL_SEQUENCE_ID),
        at = q(COL_PATCHED_AT),
        peer = q(COL_PEER_ID),
        pending = q(PENDING_TABLE),
        p_peer = ph(COL_PEER_ID),
        p_min = ph(COL_SEQUENCE_ID),
        p_max = ph(COL_SEQUENCE_ID),
    ));

    let list_missing = format!(
        "SELECT peer, seq, at, next_seq - seq - 1 AS missing\n\
         FROM (\n\
           SELECT peer, seq, at, lead(seq) OVER (PARTITION BY peer ORDER BY seq) AS next_seq\n\
           FROM (\n{}\n)\n\
         )\n\
         WHERE next_seq > seq + 1\n\
         ORDER BY peer, seq",
        missing_members.join("\nUNION ALL\n"),
    );
    let last_patch_info = format!(
        "SELECT max(at), max(seq) FROM (\n{}\n)",
        info_members.join("\nUNION ALL\n"),
    );
    let select_range = format!(
        "SELECT seq, envelope FROM (\n{}\n) ORDER BY seq",
        range_members.join("\nUNION ALL\n"),
    );
    let delete_old_pending = format!(
        "DELETE FROM {pending} WHERE {at} < {p_at}",
        pending = q(PENDING_TABLE),
        at = q(COL_PATCHED_AT),
        p_at = ph(COL_PATCHED_AT),
    );

    Plans {
        tables,
        list_missing,
        last_patch_info,
        select_range,
        delete_old_pending,
    }
}

fn plan_table(schema: &TableSchema, hook: &PlaceholderHook) -> TablePlan {
    let table = q(&schema.table);
    let shadow = q(&schema.shadow);
    let provenance = [COL_PATCHED_AT, COL_SEQUENCE_ID, COL_PEER_ID];

    // savePatch: every shadow column, provenance first.
    let mut save_columns: Vec<String> = provenance.iter().map(|c| q(c)).collect();
    let mut save_params: Vec<String> = provenance
        .iter()
        .map(|c| hook(&schema.table, c))
        .collect();
    for column in schema.columns() {
        save_columns.push(q(column));
        save_params.push(hook(&schema.table, column));
    }
    let save_patch = format!(
        "INSERT INTO {shadow} ({}) VALUES ({})",
        save_columns.join(", "),
        save_params.join(", "),
    );

    // applyPatches: per-column keep_last grouped by primary key, upserted
    // with nulls never overwriting existing values.
    let pk_list: Vec<String> = schema.pk_columns.iter().map(|c| q(c)).collect();
    let mut select_exprs = pk_list.clone();
    for column in &schema.data_columns {
        select_exprs.push(format!(
            "keep_last({col}, {at}, {peer}, {seq}) AS {col}",
            col = q(column),
            at = q(COL_PATCHED_AT),
            peer = q(COL_PEER_ID),
            seq = q(COL_SEQUENCE_ID),
        ));
    }
    let conflict_action = if schema.data_columns.is_empty() {
        "DO NOTHING".to_string()
    } else {
        let sets: Vec<String> = schema
            .data_columns
            .iter()
            .map(|column| {
                format!(
                    "{col} = coalesce(excluded.{col}, {table}.{col})",
                    col = q(column),
                    table = table,
                )
            })
            .collect();
        format!("DO UPDATE SET {}", sets.join(", "))
    };
    let all_columns: Vec<String> = schema.columns().map(q).collect();
    let apply_patches = format!(
        "INSERT INTO {table} ({cols})\n\
         SELECT {exprs}\n\
         FROM {shadow}\n\
         WHERE {at} >= {p_at}\n\
         GROUP BY {pks}\n\
         ON CONFLICT({pks}) {action}",
        cols = all_columns.join(", "),
        exprs = select_exprs.join(", "),
        at = q(COL_PATCHED_AT),
        p_at = hook(&schema.table, COL_PATCHED_AT),
        pks = pk_list.join(", "),
        action = conflict_action,
    );

    let delete_old_patches = format!(
        "DELETE FROM {shadow} WHERE {at} < {p_at}",
        at = q(COL_PATCHED_AT),
        p_at = hook(&schema.table, COL_PATCHED_AT),
    );

    // Range serving: rebuild the full patch envelope in SQL. The schema
    // version is bound by the caller.
    let delta_pairs: Vec<String> = schema
        .columns()
        .map(|column| format!("'{column}', {}", q(column)))
        .collect();
    let select_range = format!(
        "SELECT {seq} AS seq, json_object('type', 10, 'at', {at}, 'peer', {peer}, 'seq', {seq}, \
         'ver', {p_ver}, 'tab', '{tab}', 'delta', json_object({delta})) AS envelope \
         FROM {shadow} WHERE {peer} = {p_peer} AND {seq} BETWEEN {p_min} AND {p_max}",
        seq = q(COL_SEQUENCE_ID),
        at = q(COL_PATCHED_AT),
        peer = q(COL_PEER_ID),
        p_ver = hook(&schema.table, "patchVersion"),
        tab = schema.table,
        delta = delta_pairs.join(", "),
        p_peer = hook(&schema.table, COL_PEER_ID),
        p_min = hook(&schema.table, COL_SEQUENCE_ID),
        p_max = hook(&schema.table, COL_SEQUENCE_ID),
    );

    TablePlan {
        schema: schema.clone(),
        save_patch,
        apply_patches,
        delete_old_patches,
        select_range,
    }
}
