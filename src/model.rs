//! Entity records and per-kind storage metadata.
//!
//! Four entity kinds flow through the deferred write-back path. Each kind
//! has a canonical table holding authoritative state, a queue table with
//! identical columns holding not-yet-applied mutations, and one unique
//! index on the canonical table used both by the merge upsert and by
//! foreground point lookups. All per-kind behavior in the merge engine is
//! driven by the metadata here rather than ad hoc branching.

use crate::codec::WireValue;

/// Maximum number of training rows retained per feature subspace.
///
/// Callers recompute and stage the full matrix; this layer persists what
/// it is given, so the bound is advisory for them, not enforced here.
pub const MAX_SUBSPACE_ROWS: usize = 30;

/// Length of each bounded history vector in [`QueryStatRecord`].
///
/// Trimming is owned by the caller.
pub const STAT_WINDOW: usize = 20;

/// The closed set of entity kinds handled by the write-back path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// Per-query learn/use settings ([`QueryRecord`]).
    Queries,
    /// Original query text cache ([`QueryTextRecord`]).
    QueryTexts,
    /// Training data for one feature subspace ([`FeatureSubspaceRecord`]).
    Subspaces,
    /// Execution history for one query ([`QueryStatRecord`]).
    QueryStats,
}

impl EntityKind {
    /// All kinds, in the order a drain pass visits them.
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Queries,
        EntityKind::Subspaces,
        EntityKind::QueryTexts,
        EntityKind::QueryStats,
    ];

    /// Name of the canonical table.
    pub fn canonical_table(self) -> &'static str {
        match self {
            EntityKind::Queries => "queries",
            EntityKind::QueryTexts => "query_texts",
            EntityKind::Subspaces => "subspaces",
            EntityKind::QueryStats => "query_stats",
        }
    }

    /// Name of the queue table staged mutations land in.
    pub fn queue_table(self) -> &'static str {
        match self {
            EntityKind::Queries => "queries_pending",
            EntityKind::QueryTexts => "query_texts_pending",
            EntityKind::Subspaces => "subspaces_pending",
            EntityKind::QueryStats => "query_stats_pending",
        }
    }

    /// Name of the canonical table's unique index.
    pub fn index_name(self) -> &'static str {
        match self {
            EntityKind::Queries => "queries_hash_idx",
            EntityKind::QueryTexts => "query_texts_hash_idx",
            EntityKind::Subspaces => "subspaces_key_idx",
            EntityKind::QueryStats => "query_stats_hash_idx",
        }
    }

    /// Column names and declared types, key columns first.
    pub fn column_decls(self) -> &'static [(&'static str, &'static str)] {
        match self {
            EntityKind::Queries => &[
                ("query_hash", "INTEGER"),
                ("learn_model", "INTEGER"),
                ("use_model", "INTEGER"),
                ("space_hash", "INTEGER"),
                ("auto_tune", "INTEGER"),
            ],
            EntityKind::QueryTexts => &[("query_hash", "INTEGER"), ("query_text", "TEXT")],
            EntityKind::Subspaces => &[
                ("space_hash", "INTEGER"),
                ("subspace_hash", "INTEGER"),
                ("ncols", "INTEGER"),
                ("features", "BLOB"),
                ("targets", "BLOB"),
            ],
            EntityKind::QueryStats => &[
                ("query_hash", "INTEGER"),
                ("exec_time_with", "BLOB"),
                ("exec_time_without", "BLOB"),
                ("plan_time_with", "BLOB"),
                ("plan_time_without", "BLOB"),
                ("est_error_with", "BLOB"),
                ("est_error_without", "BLOB"),
                ("execs_with", "INTEGER"),
                ("execs_without", "INTEGER"),
            ],
        }
    }

    /// Number of leading key columns (immutable once set).
    pub fn key_column_count(self) -> usize {
        match self {
            EntityKind::Subspaces => 2,
            _ => 1,
        }
    }

    /// Column names only, in declaration order.
    pub fn column_names(self) -> Vec<&'static str> {
        self.column_decls().iter().map(|(name, _)| *name).collect()
    }
}

/// Build the DDL for every canonical table, queue table, and unique index.
pub fn schema_ddl() -> String {
    let mut ddl = String::new();
    for kind in EntityKind::ALL {
        let cols: Vec<String> = kind
            .column_decls()
            .iter()
            .map(|(name, ty)| format!("{name} {ty}"))
            .collect();
        let cols = cols.join(", ");
        let keys: Vec<&str> = kind
            .column_names()
            .into_iter()
            .take(kind.key_column_count())
            .collect();

        ddl.push_str(&format!(
            "CREATE TABLE IF NOT EXISTS {} ({cols});\n",
            kind.canonical_table()
        ));
        ddl.push_str(&format!(
            "CREATE TABLE IF NOT EXISTS {} ({cols});\n",
            kind.queue_table()
        ));
        ddl.push_str(&format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({});\n",
            kind.index_name(),
            kind.canonical_table(),
            keys.join(", ")
        ));
    }
    ddl
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Per-query learned-model settings. One row per query fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRecord {
    /// Query fingerprint.
    pub query_hash: i64,
    /// Whether execution feedback for this query trains the model.
    pub learn_model: bool,
    /// Whether the model's predictions are used when planning this query.
    pub use_model: bool,
    /// Feature space the query's training examples pool into.
    pub space_hash: i64,
    /// Whether the learn/use flags are adjusted automatically.
    pub auto_tune: bool,
}

impl QueryRecord {
    pub(crate) fn to_wire(&self) -> Vec<WireValue> {
        vec![
            WireValue::Int(self.query_hash),
            WireValue::Bool(self.learn_model),
            WireValue::Bool(self.use_model),
            WireValue::Int(self.space_hash),
            WireValue::Bool(self.auto_tune),
        ]
    }
}

/// Original query text, keyed by fingerprint. Append-only cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTextRecord {
    pub query_hash: i64,
    pub query_text: String,
}

impl QueryTextRecord {
    pub(crate) fn to_wire(&self) -> Vec<WireValue> {
        vec![
            WireValue::Int(self.query_hash),
            WireValue::Text(self.query_text.clone()),
        ]
    }
}

/// Current training set for one clause/relation combination.
///
/// Every merge replaces the whole matrix/vector payload; the caller has
/// already recomputed the full contents before staging.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSubspaceRecord {
    /// Feature space key.
    pub space_hash: i64,
    /// Feature subspace key within the space.
    pub subspace_hash: i64,
    /// Number of feature columns.
    pub ncols: usize,
    /// Row-major training matrix, at most [`MAX_SUBSPACE_ROWS`] rows of
    /// `ncols` columns each.
    pub features: Vec<Vec<f64>>,
    /// Target values, one per matrix row.
    pub targets: Vec<f64>,
}

impl FeatureSubspaceRecord {
    pub(crate) fn to_wire(&self) -> Vec<WireValue> {
        vec![
            WireValue::Int(self.space_hash),
            WireValue::Int(self.subspace_hash),
            WireValue::Int(self.ncols as i64),
            WireValue::Matrix(self.features.clone()),
            WireValue::Vector(self.targets.clone()),
        ]
    }
}

/// Execution history for one query: six bounded vectors plus two counters.
///
/// The vectors hold at most [`STAT_WINDOW`] entries each; appending and
/// trimming are owned by the caller, and updates replace the whole record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryStatRecord {
    pub execution_time_with_model: Vec<f64>,
    pub execution_time_without_model: Vec<f64>,
    pub planning_time_with_model: Vec<f64>,
    pub planning_time_without_model: Vec<f64>,
    pub cardinality_error_with_model: Vec<f64>,
    pub cardinality_error_without_model: Vec<f64>,
    pub executions_with_model: i64,
    pub executions_without_model: i64,
}

impl QueryStatRecord {
    pub(crate) fn to_wire(&self, query_hash: i64) -> Vec<WireValue> {
        vec![
            WireValue::Int(query_hash),
            WireValue::Vector(self.execution_time_with_model.clone()),
            WireValue::Vector(self.execution_time_without_model.clone()),
            WireValue::Vector(self.planning_time_with_model.clone()),
            WireValue::Vector(self.planning_time_without_model.clone()),
            WireValue::Vector(self.cardinality_error_with_model.clone()),
            WireValue::Vector(self.cardinality_error_without_model.clone()),
            WireValue::Int(self.executions_with_model),
            WireValue::Int(self.executions_without_model),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_widths_match_column_counts() {
        let query = QueryRecord {
            query_hash: 1,
            learn_model: true,
            use_model: false,
            space_hash: 1,
            auto_tune: false,
        };
        assert_eq!(
            query.to_wire().len(),
            EntityKind::Queries.column_decls().len()
        );

        let text = QueryTextRecord {
            query_hash: 1,
            query_text: "SELECT 1".into(),
        };
        assert_eq!(
            text.to_wire().len(),
            EntityKind::QueryTexts.column_decls().len()
        );

        let subspace = FeatureSubspaceRecord {
            space_hash: 1,
            subspace_hash: 2,
            ncols: 1,
            features: vec![vec![0.5]],
            targets: vec![1.0],
        };
        assert_eq!(
            subspace.to_wire().len(),
            EntityKind::Subspaces.column_decls().len()
        );

        let stat = QueryStatRecord::default();
        assert_eq!(
            stat.to_wire(1).len(),
            EntityKind::QueryStats.column_decls().len()
        );
    }

    #[test]
    fn test_key_columns_lead_declarations() {
        for kind in EntityKind::ALL {
            assert!(kind.key_column_count() <= kind.column_decls().len());
        }
        assert_eq!(EntityKind::Subspaces.key_column_count(), 2);
        assert_eq!(
            EntityKind::Subspaces.column_names()[..2],
            ["space_hash", "subspace_hash"]
        );
    }

    #[test]
    fn test_schema_ddl_covers_all_objects() {
        let ddl = schema_ddl();
        for kind in EntityKind::ALL {
            assert!(ddl.contains(kind.canonical_table()));
            assert!(ddl.contains(kind.queue_table()));
            assert!(ddl.contains(kind.index_name()));
        }
    }
}
