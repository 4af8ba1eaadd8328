//! # Engine Context
//!
//! The explicit context handle threaded through every durable component:
//! write cache, page cache, write-ahead log, atomic-operations manager and
//! the per-file lock manager live here rather than in process-wide
//! singletons.
//!
//! Components use the helper surface on [`Engine`] for all page and file
//! traffic. `load_for_write` hands out a [`DurablePage`] whose mutations are
//! journalled; `release_page` drains that journal into the current atomic
//! operation, assigns LSNs and stamps the page. The pairing mirrors the
//! write discipline every index structure in this crate follows:
//!
//! ```text
//! let atomic = engine.atomic().start("component")?;
//! let mut page = engine.load_for_write(file_id, page_index)?;
//! page.set_u64(SIZE_OFFSET, size + 1);
//! engine.release_page(page, &atomic)?;        // ops -> WAL, page LSN set
//! engine.atomic().end(false)?;                // commit record + flush
//! ```
//!
//! Opening an engine runs crash recovery before returning, so components
//! always load against reconciled files.

use std::path::Path;
use std::sync::Arc;

use eyre::{Result, WrapErr};
use tracing::{debug, info};

use crate::atomic::recovery::{recover, RecoveryStats};
use crate::atomic::{AtomicHandle, AtomicOperationsManager};
use crate::config::EngineConfig;
use crate::storage::{DurablePage, FileLockManager, PageCache, PageKey, PageView, WriteCache};
use crate::wal::Wal;

pub struct Engine {
    config: EngineConfig,
    write_cache: Arc<WriteCache>,
    cache: Arc<PageCache>,
    wal: Arc<Wal>,
    atomic: AtomicOperationsManager,
    file_locks: FileLockManager,
    recovery: RecoveryStats,
}

impl Engine {
    /// Opens the engine rooted at `dir`, running crash recovery against the
    /// write-ahead log before returning.
    pub fn open<P: AsRef<Path>>(dir: P, config: EngineConfig) -> Result<Arc<Self>> {
        let dir = dir.as_ref();
        let write_cache = Arc::new(WriteCache::open(dir)?);
        let wal = Arc::new(
            Wal::open(dir.join("wal"), config.wal_segment_size)
                .wrap_err("failed to open write-ahead log")?,
        );
        let cache = Arc::new(PageCache::new(
            config.cache_pages,
            Arc::clone(&write_cache),
            Arc::clone(&wal),
        ));
        let atomic = AtomicOperationsManager::new(Arc::clone(&wal), Arc::clone(&cache));

        let recovery =
            recover(&wal, &cache, &write_cache, &atomic).wrap_err("crash recovery failed")?;
        if !recovery.is_clean() {
            info!(?recovery, "engine opened after recovery");
        } else {
            debug!(dir = ?dir, "engine opened clean");
        }

        Ok(Arc::new(Self {
            config,
            write_cache,
            cache,
            wal,
            atomic,
            file_locks: FileLockManager::new(),
            recovery,
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn atomic(&self) -> &AtomicOperationsManager {
        &self.atomic
    }

    pub fn file_locks(&self) -> &FileLockManager {
        &self.file_locks
    }

    pub fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    /// What recovery did when this engine was opened.
    pub fn recovery_stats(&self) -> RecoveryStats {
        self.recovery
    }

    // ---- file lifecycle -------------------------------------------------

    /// Books an id, logs the creation under the current atomic operation and
    /// creates the backing file.
    pub fn add_file(&self, name: &str, atomic: &AtomicHandle) -> Result<u32> {
        let file_id = self.write_cache.book_file_id(name)?;
        atomic.log_file_created(name, file_id)?;
        self.write_cache.add_file(name, file_id)?;
        Ok(file_id)
    }

    pub fn open_file(&self, name: &str) -> Result<u32> {
        self.write_cache.open_file(name)
    }

    pub fn file_exists(&self, name: &str) -> bool {
        self.write_cache.exists(name)
    }

    /// Logs the deletion and drops the file. Deletion applies immediately;
    /// it is not reversed by rollback, so callers only delete from
    /// dedicated top-level delete operations.
    pub fn delete_file(&self, file_id: u32, atomic: &AtomicHandle) -> Result<()> {
        atomic.log_file_deleted(file_id)?;
        self.cache.drop_file_pages(file_id)?;
        self.write_cache.delete_file(file_id)
    }

    /// Drops all cached pages of the file and resets it to zero pages.
    pub fn truncate_file(&self, file_id: u32) -> Result<()> {
        self.cache.drop_file_pages(file_id)?;
        self.write_cache.truncate_file(file_id)
    }

    pub fn filled_up_to(&self, file_id: u32) -> Result<u32> {
        self.write_cache.filled_up_to(file_id)
    }

    // ---- page access ----------------------------------------------------

    pub fn load_for_read(&self, file_id: u32, page_index: u32) -> Result<PageView<'_>> {
        let guard = self.cache.load_for_read(PageKey::new(file_id, page_index))?;
        Ok(PageView::new(guard))
    }

    pub fn load_for_write(&self, file_id: u32, page_index: u32) -> Result<DurablePage<'_>> {
        let guard = self.cache.load_for_write(PageKey::new(file_id, page_index))?;
        Ok(DurablePage::new(guard))
    }

    /// Extends the file by one page, returned write-pinned and zeroed.
    pub fn add_page(&self, file_id: u32) -> Result<(DurablePage<'_>, u32)> {
        let (guard, page_index) = self.cache.allocate_new_page(file_id)?;
        Ok((DurablePage::new(guard), page_index))
    }

    /// Marks a page as retained in memory across evictions.
    pub fn pin_page(&self, file_id: u32, page_index: u32) {
        self.cache.pin_page(PageKey::new(file_id, page_index));
    }

    /// Drains the page's recorded operations into the WAL under `atomic`,
    /// in mutation order, and stamps the page with the last assigned LSN.
    pub fn release_page(&self, page: DurablePage<'_>, atomic: &AtomicHandle) -> Result<()> {
        let (mut guard, ops) = page.into_parts();
        if ops.is_empty() {
            return Ok(());
        }

        let key = guard.key();
        let mut prev = guard.lsn();
        for op in ops {
            prev = atomic.add_page_op(key, prev, op)?;
        }
        guard.set_lsn(prev);
        Ok(())
    }

    // ---- durability -----------------------------------------------------

    pub fn flush_file(&self, file_id: u32) -> Result<()> {
        self.cache.flush_file(file_id)
    }

    pub fn flush_all(&self) -> Result<()> {
        self.cache.flush_all()
    }

    /// Quiescent checkpoint: write every dirty page through (WAL first),
    /// fsync the data files, then drop the log. Call with no operations in
    /// flight.
    pub fn checkpoint(&self) -> Result<()> {
        self.wal.flush()?;
        self.cache.flush_all()?;
        self.wal.truncate()?;
        info!("checkpoint complete");
        Ok(())
    }

    /// Drops every unpinned cached page without writing anything back,
    /// keeping the WAL. Simulates the volatile-state loss of a crash; the
    /// next `open` replays the log.
    pub fn drop_page_cache(&self) {
        self.cache.discard_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_DATA_OFFSET;
    use tempfile::tempdir;

    #[test]
    fn open_create_write_commit_reopen() {
        let dir = tempdir().unwrap();

        {
            let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
            let atomic = engine.atomic().start("test").unwrap();
            let file_id = engine.add_file("data.pbt", &atomic).unwrap();

            let (mut page, index) = engine.add_page(file_id).unwrap();
            assert_eq!(index, 0);
            page.set_u64(PAGE_DATA_OFFSET, 42);
            engine.release_page(page, &atomic).unwrap();
            engine.atomic().end(false).unwrap();
        }

        // Nothing was flushed to the data file; recovery must rebuild it.
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        let file_id = engine.open_file("data.pbt").unwrap();
        let view = engine.load_for_read(file_id, 0).unwrap();
        assert_eq!(view.get_u64(PAGE_DATA_OFFSET), 42);
    }

    #[test]
    fn rollback_leaves_no_trace_after_reopen() {
        let dir = tempdir().unwrap();

        {
            let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
            let atomic = engine.atomic().start("seed").unwrap();
            let file_id = engine.add_file("data.pbt", &atomic).unwrap();
            let (mut page, _) = engine.add_page(file_id).unwrap();
            page.set_u64(PAGE_DATA_OFFSET, 1);
            engine.release_page(page, &atomic).unwrap();
            engine.atomic().end(false).unwrap();

            let atomic = engine.atomic().start("doomed").unwrap();
            let mut page = engine.load_for_write(file_id, 0).unwrap();
            page.set_u64(PAGE_DATA_OFFSET, 999);
            engine.release_page(page, &atomic).unwrap();
            engine.atomic().end(true).unwrap();

            let view = engine.load_for_read(file_id, 0).unwrap();
            assert_eq!(view.get_u64(PAGE_DATA_OFFSET), 1);
        }

        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        let file_id = engine.open_file("data.pbt").unwrap();
        let view = engine.load_for_read(file_id, 0).unwrap();
        assert_eq!(view.get_u64(PAGE_DATA_OFFSET), 1);
    }

    #[test]
    fn uncommitted_operation_is_undone_on_reopen() {
        let dir = tempdir().unwrap();

        {
            let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
            let atomic = engine.atomic().start("seed").unwrap();
            let file_id = engine.add_file("data.pbt", &atomic).unwrap();
            let (mut page, _) = engine.add_page(file_id).unwrap();
            page.set_u64(PAGE_DATA_OFFSET, 7);
            engine.release_page(page, &atomic).unwrap();
            engine.atomic().end(false).unwrap();

            // Mutation under an operation that never ends; force its
            // records and the dirtied page to disk, then "crash".
            let atomic = engine.atomic().start("orphan").unwrap();
            let mut page = engine.load_for_write(file_id, 0).unwrap();
            page.set_u64(PAGE_DATA_OFFSET, 500);
            engine.release_page(page, &atomic).unwrap();
            engine.wal().flush().unwrap();
            engine.flush_all().unwrap();
        }

        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        assert!(engine.recovery_stats().undone_records > 0);
        let file_id = engine.open_file("data.pbt").unwrap();
        let view = engine.load_for_read(file_id, 0).unwrap();
        assert_eq!(view.get_u64(PAGE_DATA_OFFSET), 7);
    }

    #[test]
    fn checkpoint_empties_the_log() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();

        let atomic = engine.atomic().start("test").unwrap();
        let file_id = engine.add_file("data.pbt", &atomic).unwrap();
        let (mut page, _) = engine.add_page(file_id).unwrap();
        page.set_u64(PAGE_DATA_OFFSET, 9);
        engine.release_page(page, &atomic).unwrap();
        engine.atomic().end(false).unwrap();

        engine.checkpoint().unwrap();
        assert!(engine.wal().read_forward(0).unwrap().is_empty());

        // Data survives a checkpointed shutdown without any WAL replay.
        drop(engine);
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        assert!(engine.recovery_stats().is_clean());
        let file_id = engine.open_file("data.pbt").unwrap();
        let view = engine.load_for_read(file_id, 0).unwrap();
        assert_eq!(view.get_u64(PAGE_DATA_OFFSET), 9);
    }

    #[test]
    fn drop_page_cache_then_recover_restores_committed_state() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();

        let atomic = engine.atomic().start("test").unwrap();
        let file_id = engine.add_file("data.pbt", &atomic).unwrap();
        let (mut page, _) = engine.add_page(file_id).unwrap();
        page.set_u64(PAGE_DATA_OFFSET, 1234);
        engine.release_page(page, &atomic).unwrap();
        engine.atomic().end(false).unwrap();

        engine.drop_page_cache();
        drop(engine);

        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        let file_id = engine.open_file("data.pbt").unwrap();
        let view = engine.load_for_read(file_id, 0).unwrap();
        assert_eq!(view.get_u64(PAGE_DATA_OFFSET), 1234);
    }
}
