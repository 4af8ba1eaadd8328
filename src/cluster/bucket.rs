//! # Position Map Bucket
//!
//! One page of the cluster position map: a fixed-size array of entries
//! mapping logical record positions to physical `(page, offset)` locations.
//!
//! ## Layout (from `PAGE_DATA_OFFSET`)
//!
//! ```text
//! Offset  Size  Field
//! 16      8     next_page     chain link used when this bucket fills
//! 24      4     size          entries appended so far
//! 28      13*N  entries       flag u8 | page_index i64 | record_position i32
//! ```
//!
//! Entry flags track the slot lifecycle: `ALLOCATED` slots were reserved but
//! never filled, `FILLED` slots hold a live location, `REMOVED` slots are
//! tombstones that `resurrect` can revive. `NOT_EXISTENT` is never stored;
//! it is the status reported for positions past `size`.

use eyre::{bail, ensure, Result};

use crate::config::{PAGE_DATA_OFFSET, PAGE_SIZE};
use crate::storage::{DurablePage, PageView};

pub const NEXT_PAGE_OFFSET: usize = PAGE_DATA_OFFSET;
pub const SIZE_OFFSET: usize = NEXT_PAGE_OFFSET + 8;
pub const POSITIONS_OFFSET: usize = SIZE_OFFSET + 4;

pub const ENTRY_SIZE: usize = 1 + 8 + 4;
pub const MAX_ENTRIES: usize = (PAGE_SIZE - POSITIONS_OFFSET) / ENTRY_SIZE;

/// Entry status flags. `NOT_EXISTENT` is never written to disk.
pub const NOT_EXISTENT: u8 = 0;
pub const REMOVED: u8 = 1;
pub const FILLED: u8 = 2;
pub const ALLOCATED: u8 = 4;

/// Physical location of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionEntry {
    pub page_index: i64,
    pub record_position: i32,
}

impl PositionEntry {
    pub fn new(page_index: i64, record_position: i32) -> Self {
        Self {
            page_index,
            record_position,
        }
    }
}

fn entry_position(index: usize) -> usize {
    POSITIONS_OFFSET + index * ENTRY_SIZE
}

/// Read-only bucket view.
pub struct PositionMapBucket<'a, 'b> {
    page: &'b PageView<'a>,
}

impl<'a, 'b> PositionMapBucket<'a, 'b> {
    pub fn new(page: &'b PageView<'a>) -> Self {
        Self { page }
    }

    pub fn size(&self) -> usize {
        self.page.get_u32(SIZE_OFFSET) as usize
    }

    pub fn next_page(&self) -> i64 {
        self.page.get_u64(NEXT_PAGE_OFFSET) as i64
    }

    pub fn is_full(&self) -> bool {
        self.size() == MAX_ENTRIES
    }

    pub fn status(&self, index: usize) -> u8 {
        if index >= self.size() {
            return NOT_EXISTENT;
        }
        self.page.get_u8(entry_position(index))
    }

    pub fn exists(&self, index: usize) -> bool {
        self.status(index) == FILLED
    }

    /// Returns the entry at `index` if it is filled.
    pub fn get(&self, index: usize) -> Option<PositionEntry> {
        if index >= self.size() {
            return None;
        }

        let position = entry_position(index);
        if self.page.get_u8(position) != FILLED {
            return None;
        }

        Some(PositionEntry {
            page_index: self.page.get_u64(position + 1) as i64,
            record_position: self.page.get_u32(position + 9) as i32,
        })
    }
}

/// Mutable bucket view over a write-pinned durable page.
pub struct PositionMapBucketMut<'a, 'b> {
    page: &'b mut DurablePage<'a>,
}

impl<'a, 'b> PositionMapBucketMut<'a, 'b> {
    pub fn new(page: &'b mut DurablePage<'a>) -> Self {
        Self { page }
    }

    pub fn init(&mut self) {
        self.page.set_u64(NEXT_PAGE_OFFSET, -1i64 as u64);
        self.page.set_u32(SIZE_OFFSET, 0);
    }

    pub fn size(&self) -> usize {
        self.page.get_u32(SIZE_OFFSET) as usize
    }

    pub fn is_full(&self) -> bool {
        self.size() == MAX_ENTRIES
    }

    pub fn next_page(&self) -> i64 {
        self.page.get_u64(NEXT_PAGE_OFFSET) as i64
    }

    pub fn set_next_page(&mut self, page_index: i64) {
        self.page.set_u64(NEXT_PAGE_OFFSET, page_index as u64);
    }

    pub fn status(&self, index: usize) -> u8 {
        if index >= self.size() {
            return NOT_EXISTENT;
        }
        self.page.get_u8(entry_position(index))
    }

    pub fn get(&self, index: usize) -> Option<PositionEntry> {
        if index >= self.size() {
            return None;
        }
        let position = entry_position(index);
        if self.page.get_u8(position) != FILLED {
            return None;
        }
        Some(PositionEntry {
            page_index: self.page.get_u64(position + 1) as i64,
            record_position: self.page.get_u32(position + 9) as i32,
        })
    }

    /// Appends a filled entry, returning its local index.
    pub fn add(&mut self, page_index: i64, record_position: i32) -> Result<usize> {
        let size = self.size();
        ensure!(size < MAX_ENTRIES, "position map bucket is full");

        let position = entry_position(size);
        self.page.set_u8(position, FILLED);
        self.page.set_u64(position + 1, page_index as u64);
        self.page.set_u32(position + 9, record_position as u32);
        self.page.set_u32(SIZE_OFFSET, (size + 1) as u32);

        Ok(size)
    }

    /// Appends an allocated-but-unfilled entry, returning its local index.
    pub fn allocate(&mut self) -> Result<usize> {
        let size = self.size();
        ensure!(size < MAX_ENTRIES, "position map bucket is full");

        let position = entry_position(size);
        self.page.set_u8(position, ALLOCATED);
        self.page.set_u64(position + 1, -1i64 as u64);
        self.page.set_u32(position + 9, -1i32 as u32);
        self.page.set_u32(SIZE_OFFSET, (size + 1) as u32);

        Ok(size)
    }

    /// Fills an allocated entry or updates a filled one.
    pub fn set(&mut self, index: usize, entry: PositionEntry) -> Result<()> {
        let size = self.size();
        ensure!(index < size, "provided index {} is out of range", index);

        let position = entry_position(index);
        let flag = self.page.get_u8(position);

        if flag == ALLOCATED {
            self.page.set_u8(position, FILLED);
        } else if flag != FILLED {
            bail!("provided index {} points to a removed entry", index);
        }

        self.page.set_u64(position + 1, entry.page_index as u64);
        self.page.set_u32(position + 9, entry.record_position as u32);
        Ok(())
    }

    /// Tombstones a filled entry. Out-of-range or non-filled slots are left
    /// untouched.
    pub fn remove(&mut self, index: usize) {
        if index >= self.size() {
            return;
        }

        let position = entry_position(index);
        if self.page.get_u8(position) != FILLED {
            return;
        }

        self.page.set_u8(position, REMOVED);
    }

    /// Revives a removed entry with a fresh location.
    pub fn resurrect(&mut self, index: usize, entry: PositionEntry) -> Result<()> {
        let size = self.size();
        ensure!(
            index < size,
            "cannot resurrect a record: provided index {} is out of range",
            index
        );

        let position = entry_position(index);
        ensure!(
            self.page.get_u8(position) == REMOVED,
            "cannot resurrect a record: provided index {} points to a non removed entry",
            index
        );

        self.page.set_u8(position, FILLED);
        self.page.set_u64(position + 1, entry.page_index as u64);
        self.page.set_u32(position + 9, entry.record_position as u32);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{PageCache, WriteCache};
    use crate::wal::Wal;
    use std::sync::Arc;
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        cache: PageCache,
        file_id: u32,
    }

    fn setup() -> Fixture {
        let dir = tempdir().unwrap();
        let write_cache = Arc::new(WriteCache::open(dir.path()).unwrap());
        let wal = Arc::new(Wal::open(dir.path().join("wal"), 1024 * 1024).unwrap());
        let cache = PageCache::new(16, Arc::clone(&write_cache), wal);
        let file_id = write_cache.book_file_id("positions.cpm").unwrap();
        write_cache.add_file("positions.cpm", file_id).unwrap();
        Fixture {
            _dir: dir,
            cache,
            file_id,
        }
    }

    #[test]
    fn allocate_then_set_scenario() {
        let fixture = setup();
        let (guard, _) = fixture.cache.allocate_new_page(fixture.file_id).unwrap();
        let mut page = DurablePage::new(guard);
        let mut bucket = PositionMapBucketMut::new(&mut page);
        bucket.init();

        assert_eq!(bucket.allocate().unwrap(), 0);
        assert_eq!(bucket.allocate().unwrap(), 1);
        assert_eq!(bucket.allocate().unwrap(), 2);

        bucket.set(1, PositionEntry::new(100, 7)).unwrap();

        assert_eq!(bucket.get(0), None);
        assert_eq!(bucket.get(1), Some(PositionEntry::new(100, 7)));
        assert_eq!(bucket.get(2), None);
        assert!(!bucket.is_full());
        assert_eq!(bucket.size(), 3);
    }

    #[test]
    fn add_remove_resurrect_restores_entry() {
        let fixture = setup();
        let (guard, _) = fixture.cache.allocate_new_page(fixture.file_id).unwrap();
        let mut page = DurablePage::new(guard);
        let mut bucket = PositionMapBucketMut::new(&mut page);
        bucket.init();

        let index = bucket.add(5, 11).unwrap();
        bucket.remove(index);
        assert_eq!(bucket.status(index), REMOVED);
        assert_eq!(bucket.get(index), None);

        bucket.resurrect(index, PositionEntry::new(5, 11)).unwrap();
        assert_eq!(bucket.status(index), FILLED);
        assert_eq!(bucket.get(index), Some(PositionEntry::new(5, 11)));
    }

    #[test]
    fn set_on_removed_entry_fails() {
        let fixture = setup();
        let (guard, _) = fixture.cache.allocate_new_page(fixture.file_id).unwrap();
        let mut page = DurablePage::new(guard);
        let mut bucket = PositionMapBucketMut::new(&mut page);
        bucket.init();

        let index = bucket.add(1, 2).unwrap();
        bucket.remove(index);

        let result = bucket.set(index, PositionEntry::new(3, 4));
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("removed entry"));
    }

    #[test]
    fn resurrect_non_removed_fails() {
        let fixture = setup();
        let (guard, _) = fixture.cache.allocate_new_page(fixture.file_id).unwrap();
        let mut page = DurablePage::new(guard);
        let mut bucket = PositionMapBucketMut::new(&mut page);
        bucket.init();

        let index = bucket.add(1, 2).unwrap();
        assert!(bucket.resurrect(index, PositionEntry::new(1, 2)).is_err());
    }

    #[test]
    fn remove_out_of_range_is_a_no_op() {
        let fixture = setup();
        let (guard, _) = fixture.cache.allocate_new_page(fixture.file_id).unwrap();
        let mut page = DurablePage::new(guard);
        let mut bucket = PositionMapBucketMut::new(&mut page);
        bucket.init();

        bucket.remove(10);
        assert_eq!(bucket.size(), 0);
    }

    #[test]
    fn status_past_size_is_not_existent() {
        let fixture = setup();
        let (guard, _) = fixture.cache.allocate_new_page(fixture.file_id).unwrap();
        let mut page = DurablePage::new(guard);
        let mut bucket = PositionMapBucketMut::new(&mut page);
        bucket.init();

        bucket.add(1, 1).unwrap();
        assert_eq!(bucket.status(0), FILLED);
        assert_eq!(bucket.status(1), NOT_EXISTENT);
    }

    #[test]
    fn every_mutation_journals_page_ops() {
        let fixture = setup();
        let (guard, _) = fixture.cache.allocate_new_page(fixture.file_id).unwrap();
        let mut page = DurablePage::new(guard);
        {
            let mut bucket = PositionMapBucketMut::new(&mut page);
            bucket.init();
            bucket.add(1, 2).unwrap();
            bucket.remove(0);
        }
        assert!(page.pending_ops() > 0);

        // Undoing the journal in reverse restores the pristine page.
        let (mut guard, ops) = page.into_parts();
        for op in ops.iter().rev() {
            op.undo(guard.data_mut());
        }
        assert!(guard.data()[PAGE_DATA_OFFSET..].iter().all(|&b| b == 0));
    }
}
