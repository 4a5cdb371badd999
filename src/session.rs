//! Foreground session: the storage API the cost-estimation hooks consume.
//!
//! Each in-flight query gets its own session with its own connection.
//! Sessions only enqueue pending rows and perform read-only point lookups
//! against canonical tables; they never read-modify-write a canonical
//! row, so they contend neither with each other nor with the background
//! writer. The write path (local insert vs. remote forward) is chosen
//! once when the session is opened, from the node role at that moment.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension};
use tracing::warn;

use crate::codec::{self, WireValue};
use crate::deactivated::DeactivatedQuerySet;
use crate::error::{KindlingError, Result};
use crate::model::{EntityKind, FeatureSubspaceRecord, QueryRecord, QueryStatRecord};
use crate::staging::{object_exists, StagingWriter};

/// Open a connection to the store file with the settings every context
/// uses: WAL journaling so readers never block the single writer, and a
/// busy timeout so brief lock contention waits instead of failing.
pub(crate) fn open_connection(path: impl AsRef<Path>) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
    conn.execute_batch("PRAGMA synchronous = NORMAL")?;
    Ok(conn)
}

/// Training data loaded for one feature subspace.
#[derive(Debug, Clone, PartialEq)]
pub struct SubspaceData {
    /// Row-major feature matrix.
    pub features: Vec<Vec<f64>>,
    /// Target values, one per matrix row.
    pub targets: Vec<f64>,
    /// Number of training rows found.
    pub rows: usize,
}

/// One foreground context's view of the feedback store.
pub struct Session {
    conn: Connection,
    writer: Box<dyn StagingWriter>,
    deactivated: Arc<DeactivatedQuerySet>,
}

impl Session {
    pub(crate) fn new(
        conn: Connection,
        writer: Box<dyn StagingWriter>,
        deactivated: Arc<DeactivatedQuerySet>,
    ) -> Self {
        Self {
            conn,
            writer,
            deactivated,
        }
    }

    // -- transaction control ------------------------------------------------

    /// Open an explicit transaction. Staged mutations ride it: rolling
    /// back the caller's work also discards anything staged inside it.
    pub fn begin(&self) -> Result<()> {
        self.conn.execute_batch("BEGIN")?;
        Ok(())
    }

    /// Commit the open transaction.
    pub fn commit(&self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    /// Roll back the open transaction, discarding staged mutations with it.
    pub fn rollback(&self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    // -- query settings -----------------------------------------------------

    /// Look up the settings row for a query fingerprint.
    pub fn find_query(&self, query_hash: i64) -> Result<Option<QueryRecord>> {
        self.require("table", EntityKind::Queries.canonical_table())?;
        self.require("index", EntityKind::Queries.index_name())?;
        let record = self
            .conn
            .query_row(
                "SELECT query_hash, learn_model, use_model, space_hash, auto_tune \
                 FROM queries WHERE query_hash = ?1",
                [query_hash],
                |row| {
                    Ok(QueryRecord {
                        query_hash: row.get(0)?,
                        learn_model: row.get::<_, i64>(1)? != 0,
                        use_model: row.get::<_, i64>(2)? != 0,
                        space_hash: row.get(3)?,
                        auto_tune: row.get::<_, i64>(4)? != 0,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Stage a settings row for a new query.
    ///
    /// The deferred write-back path makes no distinction between creating
    /// and updating; both stage the full record.
    pub fn add_query(&self, record: &QueryRecord) -> Result<()> {
        self.update_query(record)
    }

    /// Stage a full replacement of a query's settings row.
    pub fn update_query(&self, record: &QueryRecord) -> Result<()> {
        self.writer
            .enqueue(&self.conn, EntityKind::Queries, &record.to_wire())
    }

    /// Stage the original text for a query fingerprint.
    pub fn add_query_text(&self, query_hash: i64, query_text: &str) -> Result<()> {
        let row = vec![
            WireValue::Int(query_hash),
            WireValue::Text(query_text.to_string()),
        ];
        self.writer.enqueue(&self.conn, EntityKind::QueryTexts, &row)
    }

    // -- feature subspaces --------------------------------------------------

    /// Load the training set for one feature subspace.
    ///
    /// Returns `None` when no row exists, and also when the stored column
    /// count does not match `expected_ncols` — a count mismatch is logged
    /// and treated as cold start for this subspace, never raised.
    pub fn load_feature_subspace(
        &self,
        space_hash: i64,
        subspace_hash: i64,
        expected_ncols: usize,
    ) -> Result<Option<SubspaceData>> {
        self.require("table", EntityKind::Subspaces.canonical_table())?;
        self.require("index", EntityKind::Subspaces.index_name())?;

        let row = self
            .conn
            .query_row(
                "SELECT ncols, features, targets FROM subspaces \
                 WHERE space_hash = ?1 AND subspace_hash = ?2",
                [space_hash, subspace_hash],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((ncols, features_blob, targets_blob)) = row else {
            return Ok(None);
        };
        if ncols != expected_ncols as i64 {
            warn!(
                space_hash,
                subspace_hash,
                expected = expected_ncols,
                found = ncols,
                "unexpected column count for feature subspace"
            );
            return Ok(None);
        }

        let decoded = codec::decode_matrix(&features_blob)
            .and_then(|m| codec::decode_vector(&targets_blob).map(|t| (m, t)));
        match decoded {
            Ok(((features, rows, found_ncols), targets)) if found_ncols == expected_ncols => {
                Ok(Some(SubspaceData {
                    features,
                    targets,
                    rows,
                }))
            }
            Ok(((_, _, found_ncols), _)) => {
                warn!(
                    space_hash,
                    subspace_hash,
                    expected = expected_ncols,
                    found = found_ncols,
                    "stored matrix shape disagrees with column count"
                );
                Ok(None)
            }
            Err(err) => {
                warn!(
                    space_hash,
                    subspace_hash,
                    error = %err,
                    "undecodable feature subspace payload"
                );
                Ok(None)
            }
        }
    }

    /// Stage a full replacement of one feature subspace's training set.
    ///
    /// The staged payload is always the complete matrix and target
    /// vector; the caller has already recomputed them before calling.
    pub fn update_feature_subspace(
        &self,
        space_hash: i64,
        subspace_hash: i64,
        ncols: usize,
        features: &[Vec<f64>],
        targets: &[f64],
    ) -> Result<()> {
        if features.len() != targets.len() {
            return Err(KindlingError::encoding(format!(
                "{} matrix rows but {} targets",
                features.len(),
                targets.len()
            )));
        }
        let record = FeatureSubspaceRecord {
            space_hash,
            subspace_hash,
            ncols,
            features: features.to_vec(),
            targets: targets.to_vec(),
        };
        self.writer
            .enqueue(&self.conn, EntityKind::Subspaces, &record.to_wire())
    }

    // -- execution statistics -----------------------------------------------

    /// Load the execution history for a query fingerprint.
    ///
    /// Returns an empty record when none is stored yet.
    pub fn get_stat(&self, query_hash: i64) -> Result<QueryStatRecord> {
        self.require("table", EntityKind::QueryStats.canonical_table())?;
        self.require("index", EntityKind::QueryStats.index_name())?;

        let row = self
            .conn
            .query_row(
                "SELECT exec_time_with, exec_time_without, plan_time_with, \
                        plan_time_without, est_error_with, est_error_without, \
                        execs_with, execs_without \
                 FROM query_stats WHERE query_hash = ?1",
                [query_hash],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, Vec<u8>>(3)?,
                        row.get::<_, Vec<u8>>(4)?,
                        row.get::<_, Vec<u8>>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, i64>(7)?,
                    ))
                },
            )
            .optional()?;

        let Some((ewm, ewom, pwm, pwom, cwm, cwom, execs_with, execs_without)) = row else {
            return Ok(QueryStatRecord::default());
        };
        Ok(QueryStatRecord {
            execution_time_with_model: codec::decode_vector(&ewm)?,
            execution_time_without_model: codec::decode_vector(&ewom)?,
            planning_time_with_model: codec::decode_vector(&pwm)?,
            planning_time_without_model: codec::decode_vector(&pwom)?,
            cardinality_error_with_model: codec::decode_vector(&cwm)?,
            cardinality_error_without_model: codec::decode_vector(&cwom)?,
            executions_with_model: execs_with,
            executions_without_model: execs_without,
        })
    }

    /// Stage a full replacement of a query's execution history.
    ///
    /// The counters are replaced wholesale, not incremented: two contexts
    /// staging divergent snapshots of the same record resolve to whichever
    /// lands later in the queue, and the other snapshot is lost. Inherited
    /// behavior; callers that need exact counters must serialize
    /// themselves.
    pub fn update_stat(&self, query_hash: i64, record: &QueryStatRecord) -> Result<()> {
        self.writer
            .enqueue(&self.conn, EntityKind::QueryStats, &record.to_wire(query_hash))
    }

    // -- deactivated-query cache --------------------------------------------

    /// Whether the model is administratively disabled for this query.
    pub fn is_deactivated(&self, query_hash: i64) -> bool {
        self.deactivated.is_deactivated(query_hash)
    }

    /// Disable the model for this query. Idempotent.
    pub fn add_deactivated(&self, query_hash: i64) {
        self.deactivated.add(query_hash);
    }

    /// Drop the deactivated-query cache after out-of-band edits to the
    /// query-settings table.
    pub fn invalidate_deactivated_cache(&self) {
        self.deactivated.invalidate();
    }

    // -- helpers ------------------------------------------------------------

    fn require(&self, object_type: &str, name: &str) -> Result<()> {
        if !object_exists(&self.conn, object_type, name)? {
            return Err(KindlingError::unavailable(name));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::schema_ddl;
    use crate::staging::LocalStagingWriter;
    use crate::{merge, model};

    fn open_session() -> Session {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(&schema_ddl()).unwrap();
        Session::new(
            conn,
            Box::new(LocalStagingWriter),
            Arc::new(DeactivatedQuerySet::new()),
        )
    }

    fn drain(session: &Session) {
        loop {
            let mut applied = false;
            for kind in model::EntityKind::ALL {
                applied |= merge::apply_pending(&session.conn, kind).unwrap();
            }
            if !applied {
                break;
            }
        }
    }

    #[test]
    fn test_find_query_absent() {
        let session = open_session();
        assert!(session.find_query(1).unwrap().is_none());
    }

    #[test]
    fn test_stage_and_find_query() {
        let session = open_session();
        let record = QueryRecord {
            query_hash: 42,
            learn_model: true,
            use_model: false,
            space_hash: 42,
            auto_tune: true,
        };
        session.add_query(&record).unwrap();
        assert!(
            session.find_query(42).unwrap().is_none(),
            "staged but not yet merged"
        );

        drain(&session);
        assert_eq!(session.find_query(42).unwrap(), Some(record));
    }

    #[test]
    fn test_subspace_column_mismatch_is_cold_start() {
        let session = open_session();
        session
            .update_feature_subspace(1, 2, 3, &[vec![1.0, 2.0, 3.0]], &[0.5])
            .unwrap();
        drain(&session);

        assert!(session.load_feature_subspace(1, 2, 3).unwrap().is_some());
        // Wrong expectation: logged, reported as not found.
        assert!(session.load_feature_subspace(1, 2, 4).unwrap().is_none());
    }

    #[test]
    fn test_subspace_row_target_mismatch_rejected() {
        let session = open_session();
        let err = session
            .update_feature_subspace(1, 2, 2, &[vec![1.0, 2.0]], &[0.5, 0.6])
            .unwrap_err();
        assert!(matches!(err, KindlingError::Encoding { .. }));
    }

    #[test]
    fn test_stat_defaults_then_round_trips() {
        let session = open_session();
        assert_eq!(session.get_stat(9).unwrap(), QueryStatRecord::default());

        let record = QueryStatRecord {
            execution_time_with_model: vec![0.1, 0.2],
            execution_time_without_model: vec![0.4],
            planning_time_with_model: vec![0.01],
            planning_time_without_model: vec![0.02],
            cardinality_error_with_model: vec![1.5],
            cardinality_error_without_model: vec![4.0],
            executions_with_model: 2,
            executions_without_model: 1,
        };
        session.update_stat(9, &record).unwrap();
        drain(&session);
        assert_eq!(session.get_stat(9).unwrap(), record);
    }

    #[test]
    fn test_missing_canonical_table_is_unavailable() {
        let session = open_session();
        session.conn.execute_batch("DROP TABLE query_stats").unwrap();
        let err = session.get_stat(1).unwrap_err();
        assert!(err.is_unavailable());
    }

    #[test]
    fn test_deactivated_cache_via_session() {
        let session = open_session();
        assert!(!session.is_deactivated(5));
        session.add_deactivated(5);
        assert!(session.is_deactivated(5));
        session.invalidate_deactivated_cache();
        assert!(!session.is_deactivated(5));
    }
}
