//! Merge engine: applies queued pending rows to canonical tables.
//!
//! One generic find-or-insert upsert serves all four entity kinds, driven
//! by [`EntityKind`] metadata. For each pending row, in queue order: build
//! an equality key from the row's leading key columns, probe the canonical
//! table's unique index, insert the full row if the key is absent or
//! replace every non-key column if it is present, then delete the pending
//! row. Concurrent pending rows for one key therefore resolve to the last
//! write in queue order.
//!
//! The engine never opens or closes a transaction; every effect commits as
//! part of whatever transaction the caller has open, so the pending-row
//! delete and its application are always atomic together.

use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension};

use crate::error::{KindlingError, Result};
use crate::model::EntityKind;
use crate::staging::object_exists;

/// Apply every row currently queued for `kind` against its canonical
/// table. Returns whether at least one row was processed.
///
/// If the queue table, the canonical table, or its unique index cannot be
/// found, nothing is touched and the call fails with the non-fatal
/// feature-unavailable error.
pub fn apply_pending(conn: &Connection, kind: EntityKind) -> Result<bool> {
    let queue = kind.queue_table();
    let canonical = kind.canonical_table();
    let index = kind.index_name();

    for (object_type, name) in [("table", queue), ("table", canonical), ("index", index)] {
        if !object_exists(conn, object_type, name)? {
            return Err(KindlingError::unavailable(name));
        }
    }

    let columns = kind.column_names();
    let nkeys = kind.key_column_count();
    let column_list = columns.join(", ");
    let key_predicates = columns[..nkeys]
        .iter()
        .enumerate()
        .map(|(i, name)| format!("{name} = ?{}", i + 1))
        .collect::<Vec<_>>()
        .join(" AND ");
    let placeholders = vec!["?"; columns.len()].join(", ");
    let assignments = columns[nkeys..]
        .iter()
        .enumerate()
        .map(|(i, name)| format!("{name} = ?{}", i + 1))
        .collect::<Vec<_>>()
        .join(", ");

    let scan_sql = format!("SELECT rowid, {column_list} FROM {queue} ORDER BY rowid");
    let probe_sql = format!("SELECT rowid FROM {canonical} WHERE {key_predicates}");
    let insert_sql = format!("INSERT INTO {canonical} ({column_list}) VALUES ({placeholders})");
    let update_sql = format!(
        "UPDATE {canonical} SET {assignments} WHERE rowid = ?{}",
        columns.len() - nkeys + 1
    );
    let delete_sql = format!("DELETE FROM {queue} WHERE rowid = ?1");

    // Materialize the scan so deletions below cannot disturb the cursor;
    // a drain pass applies exactly the rows present when it started.
    let mut scan = conn.prepare(&scan_sql)?;
    let pending: Vec<(i64, Vec<Value>)> = scan
        .query_map([], |row| {
            let pending_rowid: i64 = row.get(0)?;
            let mut values = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                values.push(row.get::<_, Value>(i + 1)?);
            }
            Ok((pending_rowid, values))
        })?
        .collect::<rusqlite::Result<_>>()?;
    drop(scan);

    let mut applied = false;
    for (pending_rowid, values) in pending {
        let existing: Option<i64> = conn
            .query_row(
                &probe_sql,
                rusqlite::params_from_iter(&values[..nkeys]),
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            None => {
                conn.execute(&insert_sql, rusqlite::params_from_iter(&values))?;
            }
            Some(canonical_rowid) => {
                let mut params: Vec<Value> = values[nkeys..].to_vec();
                params.push(Value::Integer(canonical_rowid));
                conn.execute(&update_sql, rusqlite::params_from_iter(params))?;
            }
        }

        conn.execute(&delete_sql, [pending_rowid])?;
        applied = true;
    }

    Ok(applied)
}
