//! # Crash Recovery
//!
//! Reconciles the data files with the write-ahead log on engine open.
//!
//! The forward scan classifies every atomic operation by its terminal
//! record: a durable commit means the operation's page operations are
//! replayed (redo) wherever a page's LSN shows it missed them. Anything
//! else, whether explicitly rolled back or cut off by the crash, is undone
//! in reverse wherever a page's LSN shows the operation reached it. Both
//! directions are idempotent under the LSN guards, so an interrupted
//! recovery can simply run again.
//!
//! File-created and file-deleted records replay idempotently against the
//! filesystem: creation attaches the existing file under its recorded id
//! when present, deletion of an unknown file is a no-op.

use std::sync::Arc;

use eyre::{Result, WrapErr};
use hashbrown::HashSet;
use tracing::{debug, info, warn};

use super::AtomicOperationsManager;
use crate::storage::{PageCache, PageKey, WriteCache};
use crate::wal::{Wal, WalRecord};

/// Counters describing what a recovery pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryStats {
    pub committed_ops: usize,
    pub rolled_back_ops: usize,
    pub redone_records: usize,
    pub undone_records: usize,
    pub files_created: usize,
    pub files_deleted: usize,
}

impl RecoveryStats {
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

/// Replays the WAL against the data files. Called once on engine open,
/// before any component is loaded.
pub fn recover(
    wal: &Wal,
    cache: &Arc<PageCache>,
    write_cache: &Arc<WriteCache>,
    manager: &AtomicOperationsManager,
) -> Result<RecoveryStats> {
    let records = wal.read_forward(0)?;
    if records.is_empty() {
        debug!("write-ahead log is empty, no recovery needed");
        return Ok(RecoveryStats::default());
    }

    let mut committed: HashSet<u64> = HashSet::new();
    let mut rolled_back: HashSet<u64> = HashSet::new();
    let mut seen_ops: HashSet<u64> = HashSet::new();
    let mut max_op_id = 0u64;

    for (_, record) in &records {
        if let Some(op_id) = record.op_id() {
            seen_ops.insert(op_id);
            max_op_id = max_op_id.max(op_id);
        }
        match record {
            WalRecord::AtomicCommit { op_id } => {
                committed.insert(*op_id);
            }
            WalRecord::AtomicRollback { op_id } => {
                rolled_back.insert(*op_id);
            }
            _ => {}
        }
    }
    manager.bump_op_id(max_op_id);

    let mut stats = RecoveryStats {
        committed_ops: committed.len(),
        ..Default::default()
    };

    // Forward pass: file lifecycle and redo for committed operations.
    // Ops belonging to uncommitted operations are collected for the
    // reverse undo pass.
    let mut undo_list: Vec<(PageKey, u64, crate::wal::Lsn, crate::wal::PageOp)> = Vec::new();
    let mut deleted_files: HashSet<u32> = HashSet::new();

    for (lsn, record) in records {
        match record {
            WalRecord::FileCreated { name, file_id } => {
                if write_cache.file_name(file_id).is_ok() {
                    // Already attached through the persisted id map.
                } else if write_cache.exists(&name) {
                    write_cache
                        .open_file_with_id(&name, file_id)
                        .wrap_err_with(|| format!("failed to reattach file '{}'", name))?;
                } else {
                    write_cache
                        .add_file(&name, file_id)
                        .wrap_err_with(|| format!("failed to recreate file '{}'", name))?;
                    stats.files_created += 1;
                }
            }

            WalRecord::FileDeleted { file_id } => {
                deleted_files.insert(file_id);
                if write_cache.file_name(file_id).is_ok() {
                    cache.drop_file_pages(file_id)?;
                    write_cache.delete_file(file_id)?;
                    stats.files_deleted += 1;
                }
            }

            WalRecord::PageOp {
                op_id,
                file_id,
                page_index,
                prev_lsn,
                op,
            } => {
                // Ops for files that are gone (deleted later in this log,
                // or deleted before the last checkpoint) have nothing to
                // apply to.
                if deleted_files.contains(&file_id) || write_cache.file_name(file_id).is_err() {
                    continue;
                }
                let key = PageKey::new(file_id, page_index);

                if committed.contains(&op_id) {
                    // Page allocation may never have reached the file.
                    while write_cache.filled_up_to(file_id)? <= page_index {
                        write_cache.extend(file_id)?;
                    }

                    let mut guard = cache.load_for_write(key)?;
                    if guard.lsn() < lsn {
                        op.redo(guard.data_mut());
                        guard.set_lsn(lsn);
                        stats.redone_records += 1;
                    }
                } else {
                    undo_list.push((key, op_id, prev_lsn, op));
                }
            }

            WalRecord::AtomicBegin { .. }
            | WalRecord::AtomicCommit { .. }
            | WalRecord::AtomicRollback { .. } => {}
        }
    }

    // Reverse pass: undo every operation that did not commit. The LSN guard
    // makes this safe for records that never reached the page.
    for (key, _op_id, prev_lsn, op) in undo_list.iter().rev() {
        let pages = write_cache.filled_up_to(key.file_id).unwrap_or(0);
        if key.page_index >= pages {
            // The mutated page never made it to the file; nothing to undo.
            continue;
        }
        let mut guard = cache.load_for_write(*key)?;
        if guard.lsn() > *prev_lsn {
            op.undo(guard.data_mut());
            guard.set_lsn(*prev_lsn);
            stats.undone_records += 1;
        }
    }

    // Close the book on uncommitted operations with synthetic rollback
    // records so a second crash does not repeat the work against a log
    // that has meanwhile grown.
    for &op_id in seen_ops.iter() {
        if !committed.contains(&op_id) && !rolled_back.contains(&op_id) {
            wal.log(&WalRecord::AtomicRollback { op_id })?;
            stats.rolled_back_ops += 1;
        }
    }
    stats.rolled_back_ops += rolled_back.len();

    cache.flush_all()?;
    wal.flush()?;

    if stats.redone_records > 0 || stats.undone_records > 0 {
        info!(
            committed = stats.committed_ops,
            rolled_back = stats.rolled_back_ops,
            redone = stats.redone_records,
            undone = stats.undone_records,
            "crash recovery applied changes"
        );
    } else if stats.rolled_back_ops > 0 {
        warn!(
            rolled_back = stats.rolled_back_ops,
            "crash recovery closed interrupted operations"
        );
    }

    Ok(stats)
}
