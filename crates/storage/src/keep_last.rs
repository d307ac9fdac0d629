use rusqlite::functions::{Aggregate, Context, FunctionFlags, WindowAggregate};
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;

/// Register the last-writer-wins aggregate on a connection, under both its
/// plain aggregate name and a window-function name. Arguments are
/// `(value, patchedAt, peerId, sequenceId)`; the result is the `value` of the
/// row with the greatest `(patchedAt, peerId, sequenceId)` triple, where null
/// values are kept only if they were the first row seen.
pub fn register(conn: &Connection) -> rusqlite::Result<()> {
    let flags =
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC | FunctionFlags::SQLITE_INNOCUOUS;
    conn.create_aggregate_function("keep_last", 4, flags, KeepLast)?;
    conn.create_window_function("keep_last_window", 4, flags, KeepLast)
}

struct KeepLast;

#[derive(Default)]
pub struct KeepLastState {
    best: Option<(SqlValue, (i64, i64, i64))>,
}

impl KeepLastState {
    fn step(&mut self, value: SqlValue, triple: (i64, i64, i64)) {
        match &mut self.best {
            None => self.best = Some((value, triple)),
            Some((current, best_triple)) => {
                if !matches!(value, SqlValue::Null) && triple > *best_triple {
                    *current = value;
                    *best_triple = triple;
                }
            }
        }
    }
}

impl Aggregate<KeepLastState, SqlValue> for KeepLast {
    fn init(&self, _ctx: &mut Context<'_>) -> rusqlite::Result<KeepLastState> {
        Ok(KeepLastState::default())
    }

    fn step(&self, ctx: &mut Context<'_>, state: &mut KeepLastState) -> rusqlite::Result<()> {
        let value: SqlValue = ctx.get(0)?;
        let triple = (ctx.get::<i64>(1)?, ctx.get::<i64>(2)?, ctx.get::<i64>(3)?);
        state.step(value, triple);
        Ok(())
    }

    fn finalize(
        &self,
        _ctx: &mut Context<'_>,
        state: Option<KeepLastState>,
    ) -> rusqlite::Result<SqlValue> {
        Ok(state
            .and_then(|s| s.best)
            .map(|(value, _)| value)
            .unwrap_or(SqlValue::Null))
    }
}

impl WindowAggregate<KeepLastState, SqlValue> for KeepLast {
    fn value(&self, state: Option<&mut KeepLastState>) -> rusqlite::Result<SqlValue> {
        Ok(state
            .and_then(|s| s.best.as_ref())
            .map(|(value, _)| value.clone())
            .unwrap_or(SqlValue::Null))
    }

    // The window form recomputes per frame; removing a row never rolls the
    // winner back.
    fn inverse(&self, _ctx: &mut Context<'_>, _state: &mut KeepLastState) -> rusqlite::Result<()> {
        Ok(())
    }
}
