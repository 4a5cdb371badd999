//! Kindling is the feedback store of a learned query-cost estimator:
//! deferred write-back storage for per-query settings, query texts,
//! training data, and execution statistics.
//!
//! Foreground contexts never write authoritative state. Every mutation is
//! staged as a full-record row in a queue table; a single background
//! worker periodically drains the queues and upserts each row into its
//! canonical table, in queue order. On a replica node the queues are not
//! writable at all and staged rows are forwarded to the primary over a
//! small text protocol.
//!
//! # Architecture
//!
//! - [`model`] — the four entity kinds, their records, and the schema
//!   metadata that drives every generic code path
//! - [`codec`] — binary array blobs and the lossy text encoding used on
//!   the forwarding wire
//! - [`staging`] — the [`StagingWriter`](staging::StagingWriter) seam and
//!   the local queue-insert writer
//! - [`remote`] — replica-to-primary forwarding, client and listener
//! - [`merge`] — the generic find-or-insert upsert that applies queued
//!   rows to canonical tables
//! - [`worker`] — the background drain loop and its signal-style controls
//! - [`session`] — the per-context storage API the estimator hooks call
//! - [`deactivated`] — the shared deactivated-query cache
//!
//! # Example
//!
//! ```no_run
//! use kindling::model::QueryRecord;
//! use kindling::{FeedbackStore, StoreConfig};
//!
//! fn main() -> kindling::Result<()> {
//!     let store = FeedbackStore::open(StoreConfig::new("feedback.db"))?;
//!     let worker = store.spawn_worker()?;
//!
//!     let session = store.session()?;
//!     session.add_query(&QueryRecord {
//!         query_hash: 42,
//!         learn_model: true,
//!         use_model: true,
//!         space_hash: 42,
//!         auto_tune: false,
//!     })?;
//!
//!     worker.join()
//! }
//! ```

pub mod codec;
pub mod config;
pub mod deactivated;
pub mod error;
pub mod merge;
pub mod model;
pub mod remote;
pub mod session;
pub mod staging;
pub mod worker;

use std::sync::Arc;

use parking_lot::RwLock;

pub use config::{StoreConfig, DEFAULT_NAPTIME_MS, MAX_NAPTIME_MS};
pub use error::{KindlingError, Result};
pub use session::{Session, SubspaceData};
pub use worker::{WorkerHandle, WorkerState};

use deactivated::DeactivatedQuerySet;
use remote::{ForwardListener, RemoteStagingWriter};
use staging::{LocalStagingWriter, StagingWriter};

/// Handle to one feedback store: configuration, the shared
/// deactivated-query cache, and factories for sessions, the merge worker,
/// and the forward listener.
///
/// The handle itself holds no connection; each session and the worker
/// open their own.
pub struct FeedbackStore {
    config: Arc<RwLock<StoreConfig>>,
    deactivated: Arc<DeactivatedQuerySet>,
}

impl FeedbackStore {
    /// Open (creating if necessary) the store described by `config`.
    ///
    /// On a primary the schema is created if missing. A replica's store
    /// file is maintained by replication, so no DDL runs there.
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        if !config.in_recovery {
            let conn = session::open_connection(&config.path)?;
            conn.execute_batch(&model::schema_ddl())?;
        }
        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            deactivated: Arc::new(DeactivatedQuerySet::new()),
        })
    }

    /// Open a session for one foreground context.
    ///
    /// The write path is fixed at this point from the current node role:
    /// local queue inserts on a primary, forwarding on a replica.
    pub fn session(&self) -> Result<Session> {
        let config = self.config.read().clone();
        let conn = session::open_connection(&config.path)?;
        let writer: Box<dyn StagingWriter> = if config.in_recovery {
            let addr = config.primary_addr.ok_or_else(|| {
                KindlingError::config("replica configuration requires a primary address")
            })?;
            Box::new(RemoteStagingWriter::new(addr))
        } else {
            Box::new(LocalStagingWriter)
        };
        Ok(Session::new(conn, writer, Arc::clone(&self.deactivated)))
    }

    /// Spawn the background merge worker for this store.
    pub fn spawn_worker(&self) -> Result<WorkerHandle> {
        worker::MergeWorker::spawn(Arc::clone(&self.config))
    }

    /// Start accepting forwarded inserts from replicas on `addr`.
    pub fn spawn_forward_listener(&self, addr: impl AsRef<str>) -> Result<ForwardListener> {
        ForwardListener::bind(addr, self.config.read().path.clone())
    }

    /// Mutate the shared configuration, keeping it valid.
    ///
    /// Already-open sessions keep their write path; a running worker picks
    /// the change up on its next [`reload`](WorkerHandle::reload).
    pub fn update_config(&self, f: impl FnOnce(&mut StoreConfig)) -> Result<()> {
        let mut updated = self.config.read().clone();
        f(&mut updated);
        updated.validate()?;
        *self.config.write() = updated;
        Ok(())
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> StoreConfig {
        self.config.read().clone()
    }

    /// Drop the deactivated-query cache after out-of-band edits to the
    /// query-settings table.
    pub fn invalidate_deactivated_cache(&self) {
        self.deactivated.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_schema() {
        let dir = TempDir::new().unwrap();
        let store = FeedbackStore::open(StoreConfig::new(dir.path().join("s.db"))).unwrap();
        let session = store.session().unwrap();
        assert!(session.find_query(1).unwrap().is_none());
    }

    #[test]
    fn test_update_config_rejects_invalid_role() {
        let dir = TempDir::new().unwrap();
        let store = FeedbackStore::open(StoreConfig::new(dir.path().join("s.db"))).unwrap();

        let err = store
            .update_config(|c| c.in_recovery = true)
            .unwrap_err();
        assert!(matches!(err, KindlingError::Config { .. }));
        assert!(!store.config().in_recovery, "invalid update not applied");

        store
            .update_config(|c| {
                c.in_recovery = true;
                c.primary_addr = Some("127.0.0.1:7433".into());
            })
            .unwrap();
        assert!(store.config().in_recovery);
    }

    #[test]
    fn test_replica_session_forwards() {
        // Primary store with a listener; replica store pointed at it.
        let dir = TempDir::new().unwrap();
        let primary =
            FeedbackStore::open(StoreConfig::new(dir.path().join("primary.db"))).unwrap();
        let listener = primary.spawn_forward_listener("127.0.0.1:0").unwrap();

        let replica_config = StoreConfig::new(dir.path().join("primary.db"))
            .with_in_recovery(true)
            .with_primary_addr(listener.local_addr().to_string());
        let replica = FeedbackStore::open(replica_config).unwrap();

        let session = replica.session().unwrap();
        session.add_query_text(7, "SELECT 7").unwrap();

        // Staged in the primary's queue, not yet merged.
        let conn = session::open_connection(dir.path().join("primary.db")).unwrap();
        let queued: i64 = conn
            .query_row("SELECT COUNT(*) FROM query_texts_pending", [], |r| r.get(0))
            .unwrap();
        assert_eq!(queued, 1);

        listener.shutdown();
    }
}
