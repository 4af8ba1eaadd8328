//! # Atomic Operations Manager
//!
//! Scopes multi-page mutations into units that either commit as a whole or
//! leave no trace. A component brackets its work between `start` and `end`;
//! inside the bracket every durable-page release appends page operations to
//! the WAL under the operation's id.
//!
//! ## Lifecycle
//!
//! ```text
//! start ──► atomic-begin logged            (buffered)
//!   │        page ops logged as pages are released
//! end(false) ─► atomic-commit logged, WAL flushed through it
//! end(true)  ─► buffered ops undone in reverse on their pages,
//!               page LSNs restored, atomic-rollback logged, WAL flushed
//! ```
//!
//! `start` is re-entrant per thread: a nested start joins the in-progress
//! operation and only the outermost `end` completes it. An inner `end`
//! requesting rollback forces the outermost completion to roll back.
//!
//! ## Failure Discipline
//!
//! Rollback touches the same pages the operation touched; if that itself
//! fails, in-memory state can no longer be trusted. The manager then poisons
//! the engine: every subsequent `start` fails until the process restarts and
//! crash recovery reconciles the log.

pub mod recovery;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::storage::{PageCache, PageKey};
use crate::wal::{Lsn, PageOp, Wal, WalRecord};

/// One buffered page operation of an in-progress atomic operation.
struct OpEntry {
    key: PageKey,
    prev_lsn: Lsn,
    op: PageOp,
}

/// Mutable state of one atomic operation.
struct OpState {
    op_id: u64,
    entries: Vec<OpEntry>,
    lsns: Vec<Lsn>,
}

/// Handle to the current thread's atomic operation. Cloned freely inside
/// the operation's scope; all clones refer to the same state.
#[derive(Clone)]
pub struct AtomicHandle {
    state: Arc<Mutex<OpState>>,
    wal: Arc<Wal>,
}

impl AtomicHandle {
    pub fn op_id(&self) -> u64 {
        self.state.lock().op_id
    }

    /// Appends one page operation to the WAL and records it for rollback.
    /// `prev_lsn` is the page's LSN before this operation applies.
    pub fn add_page_op(&self, key: PageKey, prev_lsn: Lsn, op: PageOp) -> Result<Lsn> {
        let mut state = self.state.lock();
        let record = WalRecord::PageOp {
            op_id: state.op_id,
            file_id: key.file_id,
            page_index: key.page_index,
            prev_lsn,
            op: op.clone(),
        };
        let lsn = self.wal.log(&record)?;
        state.lsns.push(lsn);
        state.entries.push(OpEntry { key, prev_lsn, op });
        Ok(lsn)
    }

    /// Logs a file-created record inside this operation's scope.
    pub fn log_file_created(&self, name: &str, file_id: u32) -> Result<Lsn> {
        let mut state = self.state.lock();
        let lsn = self.wal.log(&WalRecord::FileCreated {
            name: name.to_string(),
            file_id,
        })?;
        state.lsns.push(lsn);
        Ok(lsn)
    }

    /// Logs a file-deleted record. File deletion is applied immediately and
    /// is not undone by rollback.
    pub fn log_file_deleted(&self, file_id: u32) -> Result<Lsn> {
        let mut state = self.state.lock();
        let lsn = self.wal.log(&WalRecord::FileDeleted { file_id })?;
        state.lsns.push(lsn);
        Ok(lsn)
    }

    /// LSNs appended under this operation, in order.
    pub fn lsns(&self) -> Vec<Lsn> {
        self.state.lock().lsns.clone()
    }
}

struct ThreadSlot {
    state: Arc<Mutex<OpState>>,
    depth: u32,
    rollback_requested: bool,
}

pub struct AtomicOperationsManager {
    wal: Arc<Wal>,
    cache: Arc<PageCache>,
    current: Mutex<HashMap<ThreadId, ThreadSlot>>,
    next_op_id: AtomicU64,
    poisoned: AtomicBool,
}

impl AtomicOperationsManager {
    pub fn new(wal: Arc<Wal>, cache: Arc<PageCache>) -> Self {
        Self {
            wal,
            cache,
            current: Mutex::new(HashMap::new()),
            next_op_id: AtomicU64::new(1),
            poisoned: AtomicBool::new(false),
        }
    }

    /// Recovery found op ids in the log; keep the allocator above them.
    pub(crate) fn bump_op_id(&self, seen: u64) {
        let mut current = self.next_op_id.load(Ordering::Relaxed);
        while current <= seen {
            match self.next_op_id.compare_exchange(
                current,
                seen + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Begins (or joins) the current thread's atomic operation.
    pub fn start(&self, component: &str) -> Result<AtomicHandle> {
        ensure!(
            !self.is_poisoned(),
            "storage is read-only after a failed rollback; restart to recover"
        );

        let thread = std::thread::current().id();
        let mut current = self.current.lock();

        if let Some(slot) = current.get_mut(&thread) {
            slot.depth += 1;
            trace!(component, depth = slot.depth, "joined atomic operation");
            return Ok(AtomicHandle {
                state: Arc::clone(&slot.state),
                wal: Arc::clone(&self.wal),
            });
        }

        let op_id = self.next_op_id.fetch_add(1, Ordering::Relaxed);
        self.wal
            .log(&WalRecord::AtomicBegin { op_id })
            .wrap_err("failed to log atomic-begin")?;

        let state = Arc::new(Mutex::new(OpState {
            op_id,
            entries: Vec::new(),
            lsns: Vec::new(),
        }));
        current.insert(
            thread,
            ThreadSlot {
                state: Arc::clone(&state),
                depth: 1,
                rollback_requested: false,
            },
        );

        trace!(component, op_id, "started atomic operation");
        Ok(AtomicHandle {
            state,
            wal: Arc::clone(&self.wal),
        })
    }

    /// Ends the current thread's atomic operation. Only the outermost end
    /// commits or rolls back; an inner `rollback = true` is remembered and
    /// forces the outermost completion to roll back.
    pub fn end(&self, rollback: bool) -> Result<()> {
        let thread = std::thread::current().id();
        let mut current = self.current.lock();

        let slot = match current.get_mut(&thread) {
            Some(slot) => slot,
            None => bail!("endAtomicOperation without a matching start"),
        };

        slot.rollback_requested |= rollback;
        slot.depth -= 1;
        if slot.depth > 0 {
            return Ok(());
        }

        let slot = current.remove(&thread).unwrap(); // INVARIANT: fetched above under the same lock
        drop(current);

        let state = slot.state;
        let state = state.lock();

        if slot.rollback_requested {
            self.rollback(&state)
        } else {
            self.commit(&state)
        }
    }

    fn commit(&self, state: &OpState) -> Result<()> {
        let lsn = self
            .wal
            .log(&WalRecord::AtomicCommit { op_id: state.op_id })?;
        self.wal.flush_through(lsn)?;
        trace!(op_id = state.op_id, records = state.lsns.len(), "committed atomic operation");
        Ok(())
    }

    fn rollback(&self, state: &OpState) -> Result<()> {
        debug!(
            op_id = state.op_id,
            records = state.entries.len(),
            "rolling back atomic operation"
        );

        let result = self.apply_undo(state);
        if let Err(e) = result {
            self.poisoned.store(true, Ordering::Release);
            error!(op_id = state.op_id, "rollback failed, storage is now read-only: {e:#}");
            return Err(e).wrap_err("rollback failed; storage marked read-only");
        }

        let lsn = self
            .wal
            .log(&WalRecord::AtomicRollback { op_id: state.op_id })?;
        self.wal.flush_through(lsn)?;
        Ok(())
    }

    fn apply_undo(&self, state: &OpState) -> Result<()> {
        for entry in state.entries.iter().rev() {
            let mut guard = self.cache.load_for_write(entry.key)?;
            entry.op.undo(guard.data_mut());
            guard.set_lsn(entry.prev_lsn);
        }
        Ok(())
    }

    /// Runs `f` inside an atomic operation, guaranteeing exactly one `end`
    /// on every exit path: commit on `Ok`, rollback on `Err`.
    pub fn run_atomic<T>(
        &self,
        component: &str,
        f: impl FnOnce(&AtomicHandle) -> Result<T>,
    ) -> Result<T> {
        let handle = self.start(component)?;
        let result = f(&handle);
        let end_result = self.end(result.is_err());

        match (result, end_result) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(end_err)) => Err(end_err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(end_err)) => {
                error!("atomic end failed after operation error: {end_err:#}");
                Err(err)
            }
        }
    }
}
