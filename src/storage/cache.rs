//! # Page Cache
//!
//! Bounded pool of fixed-size page buffers keyed by `(file_id, page_index)`.
//! Every page access in the engine goes through this cache; the backing
//! files are only touched here (via the write cache) and never while a page
//! is pinned for writing.
//!
//! ## Pin Protocol
//!
//! - `load_for_read` takes a shared pin: any number of readers, no writer.
//! - `load_for_write` takes an exclusive pin: no other pin of any kind.
//! - Conflicting acquisitions block on a condvar until the holder releases.
//! - Guards release their pin on drop.
//!
//! Pinned pages are never evicted. `pin_page` additionally marks a page
//! sticky (never evicted even when unpinned) for root and directory pages
//! that are touched on every descent.
//!
//! ## Eviction
//!
//! LRU over unpinned, non-sticky entries using a logical tick stamped on
//! each acquisition. A dirty victim is written through to its file only
//! after the WAL is durable through the page's LSN: a page on disk never
//! has an LSN greater than the flushed WAL LSN.
//!
//! ## Safety Model
//!
//! Guards hold a raw pointer to their slot. Slots are boxed, so the pointer
//! is stable across map growth, and a slot is never freed while pinned:
//! eviction and `drop_file_pages` skip or reject pinned entries. State
//! transitions (pin counts, notify) always go through the cache mutex; only
//! the page bytes and the dirty flag are touched through the pointer, and
//! only while the corresponding pin is held.

use std::ptr::NonNull;
use std::sync::Arc;

use eyre::{bail, ensure, Result};
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use tracing::trace;

use super::write_cache::WriteCache;
use crate::config::PAGE_SIZE;
use crate::wal::Wal;

/// Identity of a cached page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub file_id: u32,
    pub page_index: u32,
}

impl PageKey {
    pub fn new(file_id: u32, page_index: u32) -> Self {
        Self {
            file_id,
            page_index,
        }
    }
}

/// Reads the LSN stamped in a page buffer's header.
pub fn page_lsn(page: &[u8]) -> u64 {
    u64::from_le_bytes(page[0..8].try_into().unwrap()) // INVARIANT: pages are always PAGE_SIZE
}

/// Stamps the LSN in a page buffer's header.
pub fn set_page_lsn(page: &mut [u8], lsn: u64) {
    page[0..8].copy_from_slice(&lsn.to_le_bytes());
}

struct CacheSlot {
    buf: Box<[u8]>,
    readers: u32,
    writer: bool,
    sticky: bool,
    dirty: bool,
    tick: u64,
}

impl CacheSlot {
    fn new(buf: Box<[u8]>, tick: u64) -> Self {
        Self {
            buf,
            readers: 0,
            writer: false,
            sticky: false,
            dirty: false,
            tick,
        }
    }

    fn pinned(&self) -> bool {
        self.readers > 0 || self.writer
    }
}

struct CacheInner {
    slots: HashMap<PageKey, Box<CacheSlot>>,
    tick: u64,
}

pub struct PageCache {
    inner: Mutex<CacheInner>,
    released: Condvar,
    capacity: usize,
    write_cache: Arc<WriteCache>,
    wal: Arc<Wal>,
}

impl PageCache {
    pub fn new(capacity: usize, write_cache: Arc<WriteCache>, wal: Arc<Wal>) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                slots: HashMap::with_capacity(capacity),
                tick: 0,
            }),
            released: Condvar::new(),
            capacity: capacity.max(8),
            write_cache,
            wal,
        }
    }

    /// Loads a page under a shared pin. Blocks while a writer holds it.
    pub fn load_for_read(&self, key: PageKey) -> Result<PageReadGuard<'_>> {
        let slot = self.acquire(key, false)?;
        Ok(PageReadGuard {
            cache: self,
            key,
            slot,
        })
    }

    /// Loads a page under an exclusive pin. Blocks while any pin is held.
    pub fn load_for_write(&self, key: PageKey) -> Result<PageWriteGuard<'_>> {
        let slot = self.acquire(key, true)?;
        Ok(PageWriteGuard {
            cache: self,
            key,
            slot,
        })
    }

    /// Extends `file_id` by one zeroed page and returns it write-pinned.
    pub fn allocate_new_page(&self, file_id: u32) -> Result<(PageWriteGuard<'_>, u32)> {
        let page_index = self.write_cache.extend(file_id)?;
        let key = PageKey::new(file_id, page_index);

        let mut inner = self.inner.lock();
        self.make_room(&mut inner)?;
        inner.tick += 1;
        let tick = inner.tick;

        let mut slot = Box::new(CacheSlot::new(
            vec![0u8; PAGE_SIZE].into_boxed_slice(),
            tick,
        ));
        slot.writer = true;
        slot.dirty = true;
        let ptr = NonNull::from(slot.as_mut());
        let prev = inner.slots.insert(key, slot);
        debug_assert!(prev.is_none(), "allocated page already cached");

        trace!(file_id, page_index, "allocated new page");
        Ok((
            PageWriteGuard {
                cache: self,
                key,
                slot: ptr,
            },
            page_index,
        ))
    }

    fn acquire(&self, key: PageKey, exclusive: bool) -> Result<NonNull<CacheSlot>> {
        let mut inner = self.inner.lock();

        loop {
            let CacheInner { slots, tick } = &mut *inner;
            if let Some(slot) = slots.get_mut(&key) {
                let free = if exclusive {
                    !slot.pinned()
                } else {
                    !slot.writer
                };

                if free {
                    if exclusive {
                        slot.writer = true;
                    } else {
                        slot.readers += 1;
                    }
                    *tick += 1;
                    slot.tick = *tick;
                    return Ok(NonNull::from(slot.as_mut()));
                }

                self.released.wait(&mut inner);
                continue;
            }

            // Page fault: bring the page in from the backing file.
            self.make_room(&mut inner)?;

            let mut buf = vec![0u8; PAGE_SIZE].into_boxed_slice();
            self.write_cache
                .read_page(key.file_id, key.page_index, &mut buf)?;

            inner.tick += 1;
            let tick = inner.tick;
            let mut slot = Box::new(CacheSlot::new(buf, tick));
            if exclusive {
                slot.writer = true;
            } else {
                slot.readers = 1;
            }
            let ptr = NonNull::from(slot.as_mut());
            inner.slots.insert(key, slot);
            return Ok(ptr);
        }
    }

    fn make_room(&self, inner: &mut CacheInner) -> Result<()> {
        while inner.slots.len() >= self.capacity {
            let victim = inner
                .slots
                .iter()
                .filter(|(_, slot)| !slot.pinned() && !slot.sticky)
                .min_by_key(|(_, slot)| slot.tick)
                .map(|(key, _)| *key);

            let victim = match victim {
                Some(key) => key,
                None => bail!(
                    "page cache full and every page is pinned (capacity = {})",
                    self.capacity
                ),
            };

            let slot = inner.slots.remove(&victim).unwrap(); // INVARIANT: key chosen from the map above
            if slot.dirty {
                self.write_back(victim, &slot.buf)?;
            }
            trace!(
                file_id = victim.file_id,
                page_index = victim.page_index,
                "evicted page"
            );
        }
        Ok(())
    }

    fn write_back(&self, key: PageKey, buf: &[u8]) -> Result<()> {
        self.wal.flush_through(page_lsn(buf))?;
        self.write_cache.write_page(key.file_id, key.page_index, buf)
    }

    /// Marks a page sticky: retained in memory across evictions.
    pub fn pin_page(&self, key: PageKey) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.slots.get_mut(&key) {
            slot.sticky = true;
        }
    }

    /// Writes every dirty, unpinned page of `file_id` through to its file.
    pub fn flush_file(&self, file_id: u32) -> Result<()> {
        self.flush_where(|key| key.file_id == file_id)?;
        self.write_cache.flush_file(file_id)
    }

    /// Writes every dirty, unpinned page through to its file.
    pub fn flush_all(&self) -> Result<()> {
        self.flush_where(|_| true)?;
        self.write_cache.flush()
    }

    fn flush_where<F: Fn(&PageKey) -> bool>(&self, pred: F) -> Result<()> {
        let mut inner = self.inner.lock();
        let keys: Vec<PageKey> = inner
            .slots
            .iter()
            .filter(|(key, slot)| pred(key) && slot.dirty && !slot.writer)
            .map(|(key, _)| *key)
            .collect();

        for key in keys {
            let slot = inner.slots.get_mut(&key).unwrap(); // INVARIANT: keys collected from the map, nothing removed since
            self.write_back(key, &slot.buf)?;
            slot.dirty = false;
        }
        Ok(())
    }

    /// Drops every cached page of `file_id` without writing anything back.
    /// Fails if any of them is pinned. Used by truncate and delete.
    pub fn drop_file_pages(&self, file_id: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        let pinned = inner
            .slots
            .iter()
            .any(|(key, slot)| key.file_id == file_id && slot.pinned());
        ensure!(
            !pinned,
            "cannot drop pages of file {}: pages are pinned",
            file_id
        );

        inner.slots.retain(|key, _| key.file_id != file_id);
        Ok(())
    }

    /// Drops every unpinned page, discarding dirty state. Crash-simulation
    /// and shutdown helper.
    pub fn discard_all(&self) {
        let mut inner = self.inner.lock();
        inner.slots.retain(|_, slot| slot.pinned());
    }

    pub fn cached_pages(&self) -> usize {
        self.inner.lock().slots.len()
    }

    fn unpin_read(&self, key: PageKey) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.slots.get_mut(&key) {
            debug_assert!(slot.readers > 0, "read unpin without a read pin");
            slot.readers -= 1;
        }
        drop(inner);
        self.released.notify_all();
    }

    fn unpin_write(&self, key: PageKey) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.slots.get_mut(&key) {
            debug_assert!(slot.writer, "write unpin without a write pin");
            slot.writer = false;
        }
        drop(inner);
        self.released.notify_all();
    }
}

/// Shared pin over one page.
pub struct PageReadGuard<'a> {
    cache: &'a PageCache,
    key: PageKey,
    slot: NonNull<CacheSlot>,
}

impl PageReadGuard<'_> {
    pub fn key(&self) -> PageKey {
        self.key
    }

    pub fn data(&self) -> &[u8] {
        // SAFETY: the slot is boxed (stable address) and cannot be evicted
        // while this guard's read pin is counted. Writers are excluded by
        // the pin protocol, so the bytes cannot change underneath us.
        unsafe { &self.slot.as_ref().buf }
    }

    pub fn lsn(&self) -> u64 {
        page_lsn(self.data())
    }
}

impl Drop for PageReadGuard<'_> {
    fn drop(&mut self) {
        self.cache.unpin_read(self.key);
    }
}

/// Exclusive pin over one page.
pub struct PageWriteGuard<'a> {
    cache: &'a PageCache,
    key: PageKey,
    slot: NonNull<CacheSlot>,
}

impl std::fmt::Debug for PageWriteGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageWriteGuard").field("key", &self.key).finish()
    }
}

impl PageWriteGuard<'_> {
    pub fn key(&self) -> PageKey {
        self.key
    }

    pub fn data(&self) -> &[u8] {
        // SAFETY: exclusive pin; see PageReadGuard::data.
        unsafe { &self.slot.as_ref().buf }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        // SAFETY: this guard holds the exclusive pin, so no other reference
        // to the buffer exists; the slot is boxed and pinned against
        // eviction. Mutation implies the page must be written back.
        unsafe {
            let slot = self.slot.as_mut();
            slot.dirty = true;
            &mut slot.buf
        }
    }

    pub fn lsn(&self) -> u64 {
        page_lsn(self.data())
    }

    pub fn set_lsn(&mut self, lsn: u64) {
        set_page_lsn(self.data_mut(), lsn);
    }
}

impl Drop for PageWriteGuard<'_> {
    fn drop(&mut self) {
        self.cache.unpin_write(self.key);
    }
}
