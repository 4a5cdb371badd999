//! Staging of pending mutations.
//!
//! Foreground query contexts never write canonical tables. They stage
//! every mutation as one pending row, and the background worker applies
//! it later. Staging has two implementations of one capability, selected
//! once per session from the node role:
//!
//! - [`LocalStagingWriter`] inserts the pending row on the caller's own
//!   connection, inside whatever transaction the caller has open, so a
//!   rollback of the caller's work also discards the staged mutation.
//! - [`RemoteStagingWriter`](crate::remote::RemoteStagingWriter) forwards
//!   the row to the primary, because a replica cannot write locally.

use rusqlite::Connection;

use crate::codec::WireValue;
use crate::error::{KindlingError, Result};
use crate::model::EntityKind;

/// The "stage a mutation" capability.
pub trait StagingWriter: Send + Sync {
    /// Append one pending row for `kind`, with one value per queue-table
    /// column in declaration order.
    fn enqueue(&self, conn: &Connection, kind: EntityKind, row: &[WireValue]) -> Result<()>;
}

/// Check whether a table or index exists in the store.
pub(crate) fn object_exists(conn: &Connection, object_type: &str, name: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = ?1 AND name = ?2",
        (object_type, name),
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Validate that a staged row is exactly as wide as its queue table.
pub(crate) fn check_row_width(kind: EntityKind, row: &[WireValue]) -> Result<()> {
    let expected = kind.column_decls().len();
    if row.len() != expected {
        return Err(KindlingError::encoding(format!(
            "staged row for {} has {} fields, expected {}",
            kind.queue_table(),
            row.len(),
            expected
        )));
    }
    Ok(())
}

/// Staging writer for a primary node: a plain insert into the queue table
/// on the caller's connection.
#[derive(Debug, Default)]
pub struct LocalStagingWriter;

impl StagingWriter for LocalStagingWriter {
    fn enqueue(&self, conn: &Connection, kind: EntityKind, row: &[WireValue]) -> Result<()> {
        check_row_width(kind, row)?;
        if !object_exists(conn, "table", kind.queue_table())? {
            return Err(KindlingError::unavailable(kind.queue_table()));
        }

        let values = row
            .iter()
            .map(WireValue::to_storage)
            .collect::<Result<Vec<_>>>()?;

        let placeholders = vec!["?"; values.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} VALUES ({placeholders})",
            kind.queue_table()
        );
        conn.execute(&sql, rusqlite::params_from_iter(values))?;
        Ok(())
    }
}
