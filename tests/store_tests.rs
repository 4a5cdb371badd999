//! End-to-end tests for the deferred write-back path: stage through a
//! session, drain with the background worker, observe through reads.

use std::time::Duration;

use kindling::model::{QueryRecord, QueryStatRecord};
use kindling::{FeedbackStore, StoreConfig, WorkerHandle};
use tempfile::TempDir;

fn open_store(dir: &TempDir, naptime_ms: u64) -> FeedbackStore {
    let config = StoreConfig::new(dir.path().join("store.db")).with_naptime_ms(naptime_ms);
    FeedbackStore::open(config).unwrap()
}

fn wait_for<F: Fn() -> bool>(cond: F) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("condition not reached within five seconds");
}

fn queue_depth(dir: &TempDir) -> i64 {
    let conn = rusqlite::Connection::open(dir.path().join("store.db")).unwrap();
    let mut total = 0;
    for queue in [
        "queries_pending",
        "query_texts_pending",
        "subspaces_pending",
        "query_stats_pending",
    ] {
        let n: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM {queue}"), [], |r| r.get(0))
            .unwrap();
        total += n;
    }
    total
}

fn drained(dir: &TempDir, worker: WorkerHandle) {
    wait_for(|| queue_depth(dir) == 0);
    worker.join().unwrap();
}

#[test]
fn test_settings_visible_after_drain() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 10);
    let session = store.session().unwrap();

    // First sighting of query 42: learning on, prediction off until a
    // model exists.
    session
        .add_query(&QueryRecord {
            query_hash: 42,
            learn_model: true,
            use_model: false,
            space_hash: 42,
            auto_tune: true,
        })
        .unwrap();
    session.add_query_text(42, "SELECT * FROM t WHERE a = 1").unwrap();

    let worker = store.spawn_worker().unwrap();
    wait_for(|| session.find_query(42).unwrap().is_some());

    let record = session.find_query(42).unwrap().unwrap();
    assert!(record.learn_model);
    assert!(!record.use_model);
    assert_eq!(record.space_hash, 42);
    assert!(record.auto_tune);

    // Later execution flips prediction on; the same upsert path replaces
    // the row instead of duplicating it.
    session
        .update_query(&QueryRecord {
            use_model: true,
            ..record
        })
        .unwrap();
    wait_for(|| session.find_query(42).unwrap().is_some_and(|r| r.use_model));
    drained(&dir, worker);

    let conn = rusqlite::Connection::open(dir.path().join("store.db")).unwrap();
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM queries WHERE query_hash = 42", [], |r| {
            r.get(0)
        })
        .unwrap();
    assert_eq!(count, 1);
}

#[test]
fn test_queues_reach_quiescence() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 10);
    let session = store.session().unwrap();

    // A burst of staged mutations across every entity kind, including
    // several writes to one key where only the last may survive.
    for i in 0..20i64 {
        session
            .add_query(&QueryRecord {
                query_hash: 100,
                learn_model: true,
                use_model: false,
                space_hash: i,
                auto_tune: false,
            })
            .unwrap();
    }
    session.add_query_text(100, "SELECT 100").unwrap();
    session
        .update_feature_subspace(100, 7, 2, &[vec![1.0, 2.0]], &[0.5])
        .unwrap();
    session
        .update_stat(
            100,
            &QueryStatRecord {
                execution_time_with_model: vec![0.25],
                executions_with_model: 1,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(queue_depth(&dir), 23);

    let worker = store.spawn_worker().unwrap();
    drained(&dir, worker);

    // Last write in queue order won.
    let record = session.find_query(100).unwrap().unwrap();
    assert_eq!(record.space_hash, 19);

    let stat = session.get_stat(100).unwrap();
    assert_eq!(stat.executions_with_model, 1);
    assert_eq!(stat.execution_time_with_model, vec![0.25]);
}

#[test]
fn test_subspaces_keep_composite_keys_distinct() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 10);
    let session = store.session().unwrap();

    session
        .update_feature_subspace(1, 100, 2, &[vec![1.0, 2.0]], &[10.0])
        .unwrap();
    session
        .update_feature_subspace(1, 200, 2, &[vec![3.0, 4.0], vec![5.0, 6.0]], &[20.0, 30.0])
        .unwrap();

    let worker = store.spawn_worker().unwrap();
    drained(&dir, worker);

    let first = session.load_feature_subspace(1, 100, 2).unwrap().unwrap();
    let second = session.load_feature_subspace(1, 200, 2).unwrap().unwrap();
    assert_eq!(first.rows, 1);
    assert_eq!(first.targets, vec![10.0]);
    assert_eq!(second.rows, 2);
    assert_eq!(second.features[1], vec![5.0, 6.0]);
}

#[test]
fn test_rollback_discards_staged_rows() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 10);
    let session = store.session().unwrap();

    session.begin().unwrap();
    session.add_query_text(1, "SELECT 1").unwrap();
    session.rollback().unwrap();
    assert_eq!(queue_depth(&dir), 0, "rolled-back staging leaves no trace");

    session.begin().unwrap();
    session.add_query_text(2, "SELECT 2").unwrap();
    session.commit().unwrap();
    assert_eq!(queue_depth(&dir), 1);
}

#[test]
fn test_binary_blobs_survive_drain_bit_for_bit() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 10);
    let session = store.session().unwrap();

    // Values chosen to break any lossy intermediate representation.
    let features = vec![vec![0.1 + 0.2, f64::MIN_POSITIVE], vec![-0.0, 1e300]];
    let targets = vec![std::f64::consts::PI, 5e-324];
    session
        .update_feature_subspace(3, 4, 2, &features, &targets)
        .unwrap();

    let worker = store.spawn_worker().unwrap();
    drained(&dir, worker);

    let data = session.load_feature_subspace(3, 4, 2).unwrap().unwrap();
    for (stored, original) in data.features.iter().flatten().zip(features.iter().flatten()) {
        assert_eq!(stored.to_bits(), original.to_bits());
    }
    for (stored, original) in data.targets.iter().zip(&targets) {
        assert_eq!(stored.to_bits(), original.to_bits());
    }
}

#[test]
fn test_replica_forwarding_end_to_end() {
    let primary_dir = TempDir::new().unwrap();
    let primary = open_store(&primary_dir, 10);
    let listener = primary.spawn_forward_listener("127.0.0.1:0").unwrap();

    let replica_config = StoreConfig::new(primary_dir.path().join("store.db"))
        .with_in_recovery(true)
        .with_primary_addr(listener.local_addr().to_string());
    let replica = FeedbackStore::open(replica_config).unwrap();
    let replica_session = replica.session().unwrap();

    replica_session
        .update_stat(
            55,
            &QueryStatRecord {
                cardinality_error_without_model: vec![2.5, 4.0],
                executions_without_model: 2,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(queue_depth(&primary_dir), 1, "forwarded into primary queue");

    let worker = primary.spawn_worker().unwrap();
    drained(&primary_dir, worker);
    listener.shutdown();

    let session = primary.session().unwrap();
    let stat = session.get_stat(55).unwrap();
    assert_eq!(stat.executions_without_model, 2);
    // The forwarding wire re-encodes doubles as text, so values survive
    // only to its printed precision.
    assert!((stat.cardinality_error_without_model[0] - 2.5).abs() < 1e-8);
}

#[test]
fn test_missing_schema_disables_feature() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 10);

    let conn = rusqlite::Connection::open(dir.path().join("store.db")).unwrap();
    conn.execute_batch("DROP TABLE queries_pending").unwrap();

    let session = store.session().unwrap();
    let err = session
        .add_query(&QueryRecord {
            query_hash: 1,
            learn_model: true,
            use_model: false,
            space_hash: 1,
            auto_tune: false,
        })
        .unwrap_err();
    assert!(err.is_unavailable(), "staging without a queue table is the non-fatal class");
}
