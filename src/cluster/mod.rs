//! # Cluster Position Map
//!
//! Page-organized growable array mapping logical record positions to
//! physical `(page, offset)` locations. Positions are dense indexes:
//! bucket pages are chained in file order and every bucket except the last
//! is full, so position `i` lives in bucket `i / MAX_ENTRIES` at local
//! index `i % MAX_ENTRIES`.
//!
//! All mutations run inside an atomic operation and journal their page
//! operations, so a crashed append or an aborted update rolls back to the
//! exact previous `(flag, page, position)` bytes.

mod bucket;

pub use bucket::{
    PositionEntry, PositionMapBucket, PositionMapBucketMut, ALLOCATED, FILLED, MAX_ENTRIES,
    NOT_EXISTENT, REMOVED,
};

use std::sync::Arc;

use eyre::{ensure, Result};
use parking_lot::RwLock;

use crate::atomic::AtomicHandle;
use crate::engine::Engine;

pub const POSITION_MAP_EXTENSION: &str = ".cpm";

pub struct ClusterPositionMap {
    engine: Arc<Engine>,
    name: String,
    file_id: u32,
    lock: RwLock<()>,
}

impl ClusterPositionMap {
    /// Creates the backing file with one empty bucket page.
    pub fn create(engine: Arc<Engine>, name: &str) -> Result<Self> {
        let full_name = format!("{}{}", name, POSITION_MAP_EXTENSION);

        let file_id = engine.atomic().run_atomic(name, |atomic| {
            let file_id = engine.add_file(&full_name, atomic)?;
            let (mut page, index) = engine.add_page(file_id)?;
            debug_assert_eq!(index, 0);
            bucket::PositionMapBucketMut::new(&mut page).init();
            engine.release_page(page, atomic)?;
            Ok(file_id)
        })?;

        Ok(Self {
            engine,
            name: name.to_string(),
            file_id,
            lock: RwLock::new(()),
        })
    }

    /// Opens an existing position map.
    pub fn open(engine: Arc<Engine>, name: &str) -> Result<Self> {
        let full_name = format!("{}{}", name, POSITION_MAP_EXTENSION);
        let file_id = engine.open_file(&full_name)?;
        ensure!(
            engine.filled_up_to(file_id)? > 0,
            "position map '{}' has no bucket pages",
            name
        );

        Ok(Self {
            engine,
            name: name.to_string(),
            file_id,
            lock: RwLock::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deletes the backing file.
    pub fn delete(self) -> Result<()> {
        let _guard = self.lock.write();
        self.engine.atomic().run_atomic(&self.name, |atomic| {
            self.engine.delete_file(self.file_id, atomic)
        })
    }

    fn locate(index: u64) -> (u32, usize) {
        (
            (index / MAX_ENTRIES as u64) as u32,
            (index % MAX_ENTRIES as u64) as usize,
        )
    }

    /// Bucket page to append into, adding a fresh chained page if the last
    /// one is full. Returns the page index.
    fn append_page(&self, atomic: &AtomicHandle) -> Result<u32> {
        let last = self.engine.filled_up_to(self.file_id)? - 1;

        let full = {
            let view = self.engine.load_for_read(self.file_id, last)?;
            PositionMapBucket::new(&view).is_full()
        };
        if !full {
            return Ok(last);
        }

        let (mut page, new_index) = self.engine.add_page(self.file_id)?;
        bucket::PositionMapBucketMut::new(&mut page).init();
        self.engine.release_page(page, atomic)?;

        let mut prev = self.engine.load_for_write(self.file_id, last)?;
        bucket::PositionMapBucketMut::new(&mut prev).set_next_page(new_index as i64);
        self.engine.release_page(prev, atomic)?;

        Ok(new_index)
    }

    /// Appends a filled entry, returning its logical position.
    pub fn add(&self, page_index: i64, record_position: i32) -> Result<u64> {
        let _guard = self.lock.write();
        self.engine.atomic().run_atomic(&self.name, |atomic| {
            let bucket_page = self.append_page(atomic)?;
            let mut page = self.engine.load_for_write(self.file_id, bucket_page)?;
            let local = {
                let mut bucket = bucket::PositionMapBucketMut::new(&mut page);
                bucket.add(page_index, record_position)?
            };
            self.engine.release_page(page, atomic)?;
            Ok(bucket_page as u64 * MAX_ENTRIES as u64 + local as u64)
        })
    }

    /// Reserves a position without filling it, returning its logical index.
    pub fn allocate(&self) -> Result<u64> {
        let _guard = self.lock.write();
        self.engine.atomic().run_atomic(&self.name, |atomic| {
            let bucket_page = self.append_page(atomic)?;
            let mut page = self.engine.load_for_write(self.file_id, bucket_page)?;
            let local = {
                let mut bucket = bucket::PositionMapBucketMut::new(&mut page);
                bucket.allocate()?
            };
            self.engine.release_page(page, atomic)?;
            Ok(bucket_page as u64 * MAX_ENTRIES as u64 + local as u64)
        })
    }

    /// Fills an allocated position or updates a filled one.
    pub fn set(&self, index: u64, entry: PositionEntry) -> Result<()> {
        let _guard = self.lock.write();
        let (bucket_page, local) = Self::locate(index);
        ensure!(
            bucket_page < self.engine.filled_up_to(self.file_id)?,
            "provided index {} is out of range",
            index
        );

        self.engine.atomic().run_atomic(&self.name, |atomic| {
            let mut page = self.engine.load_for_write(self.file_id, bucket_page)?;
            let result = bucket::PositionMapBucketMut::new(&mut page).set(local, entry);
            self.engine.release_page(page, atomic)?;
            result
        })
    }

    /// Tombstones a filled position; anything else is a no-op.
    pub fn remove(&self, index: u64) -> Result<()> {
        let _guard = self.lock.write();
        let (bucket_page, local) = Self::locate(index);
        if bucket_page >= self.engine.filled_up_to(self.file_id)? {
            return Ok(());
        }

        self.engine.atomic().run_atomic(&self.name, |atomic| {
            let mut page = self.engine.load_for_write(self.file_id, bucket_page)?;
            bucket::PositionMapBucketMut::new(&mut page).remove(local);
            self.engine.release_page(page, atomic)?;
            Ok(())
        })
    }

    /// Revives a removed position with a fresh location.
    pub fn resurrect(&self, index: u64, entry: PositionEntry) -> Result<()> {
        let _guard = self.lock.write();
        let (bucket_page, local) = Self::locate(index);
        ensure!(
            bucket_page < self.engine.filled_up_to(self.file_id)?,
            "cannot resurrect a record: provided index {} is out of range",
            index
        );

        self.engine.atomic().run_atomic(&self.name, |atomic| {
            let mut page = self.engine.load_for_write(self.file_id, bucket_page)?;
            let result = bucket::PositionMapBucketMut::new(&mut page).resurrect(local, entry);
            self.engine.release_page(page, atomic)?;
            result
        })
    }

    pub fn get(&self, index: u64) -> Result<Option<PositionEntry>> {
        let _guard = self.lock.read();
        let (bucket_page, local) = Self::locate(index);
        if bucket_page >= self.engine.filled_up_to(self.file_id)? {
            return Ok(None);
        }

        let view = self.engine.load_for_read(self.file_id, bucket_page)?;
        Ok(PositionMapBucket::new(&view).get(local))
    }

    pub fn exists(&self, index: u64) -> Result<bool> {
        let _guard = self.lock.read();
        let (bucket_page, local) = Self::locate(index);
        if bucket_page >= self.engine.filled_up_to(self.file_id)? {
            return Ok(false);
        }

        let view = self.engine.load_for_read(self.file_id, bucket_page)?;
        Ok(PositionMapBucket::new(&view).exists(local))
    }

    pub fn status(&self, index: u64) -> Result<u8> {
        let _guard = self.lock.read();
        let (bucket_page, local) = Self::locate(index);
        if bucket_page >= self.engine.filled_up_to(self.file_id)? {
            return Ok(NOT_EXISTENT);
        }

        let view = self.engine.load_for_read(self.file_id, bucket_page)?;
        Ok(PositionMapBucket::new(&view).status(local))
    }

    /// Logical positions handed out so far. Buckets are append-only, so
    /// every bucket but the last is full.
    pub fn size(&self) -> Result<u64> {
        let _guard = self.lock.read();
        let pages = self.engine.filled_up_to(self.file_id)?;
        let view = self.engine.load_for_read(self.file_id, pages - 1)?;
        let last = PositionMapBucket::new(&view).size();
        Ok((pages as u64 - 1) * MAX_ENTRIES as u64 + last as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, Arc<Engine>) {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        (dir, engine)
    }

    #[test]
    fn add_get_roundtrip() {
        let (_dir, engine) = setup();
        let map = ClusterPositionMap::create(engine, "records").unwrap();

        let a = map.add(10, 1).unwrap();
        let b = map.add(10, 2).unwrap();
        assert_eq!((a, b), (0, 1));

        assert_eq!(map.get(0).unwrap(), Some(PositionEntry::new(10, 1)));
        assert_eq!(map.get(1).unwrap(), Some(PositionEntry::new(10, 2)));
        assert_eq!(map.get(2).unwrap(), None);
        assert_eq!(map.size().unwrap(), 2);
    }

    #[test]
    fn remove_then_resurrect_restores_entry() {
        let (_dir, engine) = setup();
        let map = ClusterPositionMap::create(engine, "records").unwrap();

        let index = map.add(100, 7).unwrap();
        map.remove(index).unwrap();
        assert!(!map.exists(index).unwrap());
        assert_eq!(map.status(index).unwrap(), REMOVED);

        map.resurrect(index, PositionEntry::new(100, 7)).unwrap();
        assert!(map.exists(index).unwrap());
        assert_eq!(map.status(index).unwrap(), FILLED);
        assert_eq!(map.get(index).unwrap(), Some(PositionEntry::new(100, 7)));
    }

    #[test]
    fn set_transitions_allocated_to_filled() {
        let (_dir, engine) = setup();
        let map = ClusterPositionMap::create(engine, "records").unwrap();

        let index = map.allocate().unwrap();
        assert_eq!(map.status(index).unwrap(), ALLOCATED);
        assert_eq!(map.get(index).unwrap(), None);

        map.set(index, PositionEntry::new(3, 9)).unwrap();
        assert_eq!(map.status(index).unwrap(), FILLED);
        assert_eq!(map.get(index).unwrap(), Some(PositionEntry::new(3, 9)));
    }

    #[test]
    fn set_out_of_range_fails() {
        let (_dir, engine) = setup();
        let map = ClusterPositionMap::create(engine, "records").unwrap();

        let result = map.set(50, PositionEntry::new(1, 1));
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("out of range"));
    }

    #[test]
    fn grows_past_one_bucket_page() {
        let (_dir, engine) = setup();
        let map = ClusterPositionMap::create(Arc::clone(&engine), "records").unwrap();

        let total = MAX_ENTRIES as u64 + 10;
        for i in 0..total {
            let index = map.add(i as i64, i as i32).unwrap();
            assert_eq!(index, i);
        }

        assert_eq!(map.size().unwrap(), total);
        let probe = MAX_ENTRIES as u64 + 3;
        assert_eq!(
            map.get(probe).unwrap(),
            Some(PositionEntry::new(probe as i64, probe as i32))
        );
    }

    #[test]
    fn survives_reopen_through_recovery() {
        let dir = tempdir().unwrap();

        {
            let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
            let map = ClusterPositionMap::create(engine, "records").unwrap();
            map.add(5, 6).unwrap();
            map.add(7, 8).unwrap();
        }

        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        let map = ClusterPositionMap::open(engine, "records").unwrap();
        assert_eq!(map.size().unwrap(), 2);
        assert_eq!(map.get(1).unwrap(), Some(PositionEntry::new(7, 8)));
    }
}
