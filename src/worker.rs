//! Background merge worker.
//!
//! Exactly one worker runs per store instance, and it is the sole writer
//! of canonical tables. It wakes on a configurable timer or on an
//! explicit control signal, and on each wake drains every queue table to
//! quiescence, one bounded transaction per entity kind per pass. A
//! replica node skips draining entirely; its staged mutations travel to
//! the primary instead.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use rusqlite::Connection;
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::error::{KindlingError, Result};
use crate::merge;
use crate::model::EntityKind;

/// Lifecycle state of the merge worker.
///
/// `Running → AwaitingWake → (Running | ShuttingDown)`; the worker starts
/// in `Running` right after its control flags are installed and ends in
/// `ShuttingDown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Handling a wake: processing signals and draining queues.
    Running,
    /// Sleeping until the naptime elapses or a signal arrives.
    AwaitingWake,
    /// Terminate observed; the loop is exiting.
    ShuttingDown,
}

impl WorkerState {
    fn as_u8(self) -> u8 {
        match self {
            WorkerState::Running => 0,
            WorkerState::AwaitingWake => 1,
            WorkerState::ShuttingDown => 2,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => WorkerState::Running,
            1 => WorkerState::AwaitingWake,
            _ => WorkerState::ShuttingDown,
        }
    }
}

/// Control flags shared between the worker thread and its handle — the
/// analogue of signal-handler flags plus a wakeable latch.
struct WorkerControl {
    terminate: AtomicBool,
    reload: AtomicBool,
    state: AtomicU8,
    wake_lock: Mutex<()>,
    wake: Condvar,
}

impl WorkerControl {
    fn new() -> Self {
        Self {
            terminate: AtomicBool::new(false),
            reload: AtomicBool::new(false),
            state: AtomicU8::new(WorkerState::Running.as_u8()),
            wake_lock: Mutex::new(()),
            wake: Condvar::new(),
        }
    }

    fn signal(&self, flag: &AtomicBool) {
        let _guard = self.wake_lock.lock();
        flag.store(true, Ordering::SeqCst);
        self.wake.notify_all();
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }
}

/// Handle to a spawned merge worker.
///
/// The two control operations mirror the process signals of the reference
/// deployment: `reload` re-reads configuration, `terminate` stops the
/// loop after the current cycle. An in-flight drain transaction always
/// commits or rolls back before a termination request is honored.
pub struct WorkerHandle {
    control: Arc<WorkerControl>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Ask the worker to re-read its configuration on the next wake, and
    /// wake it now.
    pub fn reload(&self) {
        self.control.signal(&self.control.reload);
    }

    /// Ask the worker to shut down, and wake it now.
    pub fn terminate(&self) {
        self.control.signal(&self.control.terminate);
    }

    /// Current lifecycle state of the worker.
    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.control.state.load(Ordering::SeqCst))
    }

    /// Wait for the worker thread to exit. Implies [`terminate`].
    ///
    /// [`terminate`]: WorkerHandle::terminate
    pub fn join(mut self) -> Result<()> {
        self.terminate();
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| KindlingError::worker("merge worker panicked"))?;
        }
        Ok(())
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.terminate();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// The background scheduler loop.
pub struct MergeWorker;

impl MergeWorker {
    /// Spawn the merge worker for the store described by `config`.
    ///
    /// The worker opens its own connection; the shared configuration is
    /// re-read whenever a reload signal is observed.
    pub fn spawn(config: Arc<RwLock<StoreConfig>>) -> Result<WorkerHandle> {
        let conn = crate::session::open_connection(&config.read().path)?;
        let control = Arc::new(WorkerControl::new());
        let loop_control = Arc::clone(&control);

        let thread = std::thread::Builder::new()
            .name("kindling-merge".to_string())
            .spawn(move || run_loop(conn, config, loop_control))
            .map_err(|e| KindlingError::worker(format!("failed to spawn worker: {e}")))?;

        Ok(WorkerHandle {
            control,
            thread: Some(thread),
        })
    }
}

fn run_loop(conn: Connection, config: Arc<RwLock<StoreConfig>>, control: Arc<WorkerControl>) {
    let mut naptime = Duration::from_millis(config.read().naptime_ms);
    debug!(naptime_ms = naptime.as_millis() as u64, "merge worker started");

    loop {
        control.set_state(WorkerState::AwaitingWake);
        {
            let mut guard = control.wake_lock.lock();
            let signaled = control.terminate.load(Ordering::SeqCst)
                || control.reload.load(Ordering::SeqCst);
            if !signaled {
                control.wake.wait_for(&mut guard, naptime);
            }
        }
        control.set_state(WorkerState::Running);

        if control.terminate.load(Ordering::SeqCst) {
            control.set_state(WorkerState::ShuttingDown);
            break;
        }

        if control.reload.swap(false, Ordering::SeqCst) {
            naptime = Duration::from_millis(config.read().naptime_ms);
            debug!(
                naptime_ms = naptime.as_millis() as u64,
                "merge worker reloaded configuration"
            );
        }

        // A replica never applies merges locally, only forwards toward
        // the primary.
        if config.read().in_recovery {
            continue;
        }

        drain_to_quiescence(&conn);
    }

    debug!("merge worker stopped");
}

/// Drain every queue table until one full pass applies zero rows.
///
/// Each entity kind is drained in its own transaction: a failure on one
/// kind is logged and must not prevent the others from draining, and the
/// per-kind commit naturally bounds transaction size to whatever
/// accumulated since the last drain.
fn drain_to_quiescence(conn: &Connection) {
    loop {
        let mut applied_any = false;
        for kind in EntityKind::ALL {
            match apply_one_kind(conn, kind) {
                Ok(applied) => applied_any |= applied,
                Err(err) => {
                    warn!(
                        entity = kind.canonical_table(),
                        error = %err,
                        "skipping entity kind in this drain pass"
                    );
                }
            }
        }
        if !applied_any {
            break;
        }
    }
}

fn apply_one_kind(conn: &Connection, kind: EntityKind) -> Result<bool> {
    let tx = conn.unchecked_transaction()?;
    let applied = merge::apply_pending(&tx, kind)?;
    tx.commit()?;
    Ok(applied)
}
