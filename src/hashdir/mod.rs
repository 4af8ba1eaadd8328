//! # Extendible Hash Directory
//!
//! The pointer table of an extendible hash index: a growable array of nodes,
//! each holding per-node depth metadata and [`crate::config::HASH_LEVEL_SIZE`]
//! hash-bucket pointers. The first file page stores the directory header and
//! an inline node array; overflow pages are allocated on demand as the node
//! count grows.
//!
//! Deleted nodes form a LIFO tombstone stack threaded through the slots
//! themselves: the directory header holds the head index, and each
//! tombstoned node keeps the next index in its `pointers[0]`. `add_new_node`
//! pops the stack before it ever appends.
//!
//! Directory pages are sticky-pinned on create and open; descents touch
//! them constantly and they must never fall out of the cache.

mod page;

pub use page::{FIRST_PAGE_NODES, NODES_PER_PAGE, NODE_SIZE};

use std::sync::Arc;

use eyre::{ensure, Result};
use parking_lot::RwLock;

use crate::atomic::AtomicHandle;
use crate::config::HASH_LEVEL_SIZE;
use crate::engine::Engine;
use page::{node_location, DirectoryPageMut, DirectoryPageView};

pub const HASH_DIRECTORY_EXTENSION: &str = ".hid";

pub struct HashDirectory {
    engine: Arc<Engine>,
    name: String,
    file_id: u32,
    lock: RwLock<()>,
}

impl HashDirectory {
    /// Creates the directory file with an empty first page.
    pub fn create(engine: Arc<Engine>, name: &str) -> Result<Self> {
        let full_name = format!("{}{}", name, HASH_DIRECTORY_EXTENSION);

        let file_id = engine.atomic().run_atomic(name, |atomic| {
            let file_id = engine.add_file(&full_name, atomic)?;
            let (mut first, index) = engine.add_page(file_id)?;
            debug_assert_eq!(index, 0);
            DirectoryPageMut::new(&mut first).init_first_page();
            engine.release_page(first, atomic)?;
            Ok(file_id)
        })?;

        engine.pin_page(file_id, 0);

        Ok(Self {
            engine,
            name: name.to_string(),
            file_id,
            lock: RwLock::new(()),
        })
    }

    /// Opens an existing directory, pinning every directory page.
    pub fn open(engine: Arc<Engine>, name: &str) -> Result<Self> {
        let full_name = format!("{}{}", name, HASH_DIRECTORY_EXTENSION);
        let file_id = engine.open_file(&full_name)?;

        let pages = engine.filled_up_to(file_id)?;
        ensure!(pages > 0, "hash directory '{}' has no first page", name);
        for page_index in 0..pages {
            let _view = engine.load_for_read(file_id, page_index)?;
            engine.pin_page(file_id, page_index);
        }

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

    /// Drops all nodes: truncates the file and re-initializes the header.
    pub fn clear(&self) -> Result<()> {
        let _guard = self.lock.write();
        self.engine.atomic().run_atomic(&self.name, |atomic| {
            self.engine.truncate_file(self.file_id)?;
            let (mut first, index) = self.engine.add_page(self.file_id)?;
            debug_assert_eq!(index, 0);
            DirectoryPageMut::new(&mut first).init_first_page();
            self.engine.release_page(first, atomic)?;
            Ok(())
        })?;
        self.engine.pin_page(self.file_id, 0);
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.engine.flush_file(self.file_id)
    }

    /// Ensures the page holding `node_index` exists, allocating overflow
    /// pages in order as needed.
    fn ensure_node_page(&self, node_index: usize, atomic: &AtomicHandle) -> Result<()> {
        let (page_index, _) = node_location(node_index);
        while self.engine.filled_up_to(self.file_id)? <= page_index {
            let (page, new_index) = self.engine.add_page(self.file_id)?;
            self.engine.release_page(page, atomic)?;
            self.engine.pin_page(self.file_id, new_index);
        }
        Ok(())
    }

    /// Adds a node, preferring a tombstoned slot (LIFO) over appending.
    /// Returns the node index.
    pub fn add_new_node(
        &self,
        max_left_child_depth: u8,
        max_right_child_depth: u8,
        node_local_depth: u8,
        pointers: &[u64],
    ) -> Result<usize> {
        ensure!(
            pointers.len() == HASH_LEVEL_SIZE,
            "hash directory node requires {} pointers, got {}",
            HASH_LEVEL_SIZE,
            pointers.len()
        );

        let _guard = self.lock.write();
        self.engine.atomic().run_atomic(&self.name, |atomic| {
            let mut first = self.engine.load_for_write(self.file_id, 0)?;

            let (node_index, reused_tombstone) = {
                let mut header = DirectoryPageMut::new(&mut first);
                let tombstone = header.tombstone();
                if tombstone >= 0 {
                    (tombstone as usize, true)
                } else {
                    let index = header.tree_size() as usize;
                    header.set_tree_size(index as u32 + 1);
                    (index, false)
                }
            };

            let (page_index, node_offset) = node_location(node_index);

            if page_index == 0 {
                let mut header = DirectoryPageMut::new(&mut first);
                if reused_tombstone {
                    header.set_tombstone(header.pointer(node_offset, 0) as i32);
                }
                header.set_max_left_child_depth(node_offset, max_left_child_depth);
                header.set_max_right_child_depth(node_offset, max_right_child_depth);
                header.set_node_local_depth(node_offset, node_local_depth);
                for (i, &pointer) in pointers.iter().enumerate() {
                    header.set_pointer(node_offset, i, pointer);
                }
            } else {
                self.ensure_node_page(node_index, atomic)?;
                let mut node_page = self.engine.load_for_write(self.file_id, page_index)?;
                {
                    let mut node = DirectoryPageMut::new(&mut node_page);
                    if reused_tombstone {
                        let next = node.pointer(node_offset, 0) as i32;
                        DirectoryPageMut::new(&mut first).set_tombstone(next);
                    }
                    node.set_max_left_child_depth(node_offset, max_left_child_depth);
                    node.set_max_right_child_depth(node_offset, max_right_child_depth);
                    node.set_node_local_depth(node_offset, node_local_depth);
                    for (i, &pointer) in pointers.iter().enumerate() {
                        node.set_pointer(node_offset, i, pointer);
                    }
                }
                self.engine.release_page(node_page, atomic)?;
            }

            self.engine.release_page(first, atomic)?;
            Ok(node_index)
        })
    }

    /// Pushes `node_index` onto the tombstone stack for reuse.
    pub fn delete_node(&self, node_index: usize) -> Result<()> {
        let _guard = self.lock.write();
        self.engine.atomic().run_atomic(&self.name, |atomic| {
            let mut first = self.engine.load_for_write(self.file_id, 0)?;
            let (page_index, node_offset) = node_location(node_index);

            if page_index == 0 {
                let mut header = DirectoryPageMut::new(&mut first);
                let old_tombstone = header.tombstone();
                header.set_pointer(node_offset, 0, old_tombstone as i64 as u64);
                header.set_tombstone(node_index as i32);
            } else {
                let old_tombstone = DirectoryPageMut::new(&mut first).tombstone();
                let mut node_page = self.engine.load_for_write(self.file_id, page_index)?;
                DirectoryPageMut::new(&mut node_page).set_pointer(
                    node_offset,
                    0,
                    old_tombstone as i64 as u64,
                );
                self.engine.release_page(node_page, atomic)?;
                DirectoryPageMut::new(&mut first).set_tombstone(node_index as i32);
            }

            self.engine.release_page(first, atomic)?;
            Ok(())
        })
    }

    // ---- node field access ----------------------------------------------

    fn read_node_field<T>(
        &self,
        node_index: usize,
        f: impl FnOnce(&DirectoryPageView<'_, '_>, usize) -> T,
    ) -> Result<T> {
        let _guard = self.lock.read();
        let (page_index, node_offset) = node_location(node_index);
        let view = self.engine.load_for_read(self.file_id, page_index)?;
        Ok(f(&DirectoryPageView::new(&view), node_offset))
    }

    fn write_node_field(
        &self,
        node_index: usize,
        f: impl FnOnce(&mut DirectoryPageMut<'_, '_>, usize),
    ) -> Result<()> {
        let _guard = self.lock.write();
        self.engine.atomic().run_atomic(&self.name, |atomic| {
            let (page_index, node_offset) = node_location(node_index);
            let mut page = self.engine.load_for_write(self.file_id, page_index)?;
            f(&mut DirectoryPageMut::new(&mut page), node_offset);
            self.engine.release_page(page, atomic)?;
            Ok(())
        })
    }

    pub fn max_left_child_depth(&self, node_index: usize) -> Result<u8> {
        self.read_node_field(node_index, |view, off| view.max_left_child_depth(off))
    }

    pub fn set_max_left_child_depth(&self, node_index: usize, depth: u8) -> Result<()> {
        self.write_node_field(node_index, |node, off| {
            node.set_max_left_child_depth(off, depth)
        })
    }

    pub fn max_right_child_depth(&self, node_index: usize) -> Result<u8> {
        self.read_node_field(node_index, |view, off| view.max_right_child_depth(off))
    }

    pub fn set_max_right_child_depth(&self, node_index: usize, depth: u8) -> Result<()> {
        self.write_node_field(node_index, |node, off| {
            node.set_max_right_child_depth(off, depth)
        })
    }

    pub fn node_local_depth(&self, node_index: usize) -> Result<u8> {
        self.read_node_field(node_index, |view, off| view.node_local_depth(off))
    }

    pub fn set_node_local_depth(&self, node_index: usize, depth: u8) -> Result<()> {
        self.write_node_field(node_index, |node, off| node.set_node_local_depth(off, depth))
    }

    pub fn node_pointer(&self, node_index: usize, index: usize) -> Result<u64> {
        self.read_node_field(node_index, |view, off| view.pointer(off, index))
    }

    pub fn set_node_pointer(&self, node_index: usize, index: usize, pointer: u64) -> Result<()> {
        self.write_node_field(node_index, |node, off| node.set_pointer(off, index, pointer))
    }

    pub fn node(&self, node_index: usize) -> Result<Vec<u64>> {
        self.read_node_field(node_index, |view, off| view.node(off))
    }

    pub fn set_node(&self, node_index: usize, pointers: &[u64]) -> Result<()> {
        ensure!(
            pointers.len() == HASH_LEVEL_SIZE,
            "hash directory node requires {} pointers, got {}",
            HASH_LEVEL_SIZE,
            pointers.len()
        );
        self.write_node_field(node_index, |node, off| {
            for (i, &pointer) in pointers.iter().enumerate() {
                node.set_pointer(off, i, pointer);
            }
        })
    }

    pub fn tree_size(&self) -> Result<u32> {
        let _guard = self.lock.read();
        let view = self.engine.load_for_read(self.file_id, 0)?;
        Ok(DirectoryPageView::new(&view).tree_size())
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

    fn pointers(seed: u64) -> Vec<u64> {
        (0..HASH_LEVEL_SIZE as u64).map(|i| seed * 1000 + i).collect()
    }

    #[test]
    fn add_and_read_back_node() {
        let (_dir, engine) = setup();
        let directory = HashDirectory::create(engine, "router").unwrap();

        let index = directory.add_new_node(1, 2, 3, &pointers(7)).unwrap();
        assert_eq!(index, 0);

        assert_eq!(directory.max_left_child_depth(index).unwrap(), 1);
        assert_eq!(directory.max_right_child_depth(index).unwrap(), 2);
        assert_eq!(directory.node_local_depth(index).unwrap(), 3);
        assert_eq!(directory.node_pointer(index, 5).unwrap(), 7005);
        assert_eq!(directory.node(index).unwrap(), pointers(7));
        assert_eq!(directory.tree_size().unwrap(), 1);
    }

    #[test]
    fn field_setters_update_in_place() {
        let (_dir, engine) = setup();
        let directory = HashDirectory::create(engine, "router").unwrap();
        let index = directory.add_new_node(0, 0, 8, &pointers(1)).unwrap();

        directory.set_max_left_child_depth(index, 4).unwrap();
        directory.set_max_right_child_depth(index, 5).unwrap();
        directory.set_node_local_depth(index, 6).unwrap();
        directory.set_node_pointer(index, 0, 0xDEAD).unwrap();

        assert_eq!(directory.max_left_child_depth(index).unwrap(), 4);
        assert_eq!(directory.max_right_child_depth(index).unwrap(), 5);
        assert_eq!(directory.node_local_depth(index).unwrap(), 6);
        assert_eq!(directory.node_pointer(index, 0).unwrap(), 0xDEAD);
    }

    #[test]
    fn grows_into_overflow_pages_and_reuses_tombstones_lifo() {
        let (_dir, engine) = setup();
        let directory = HashDirectory::create(Arc::clone(&engine), "router").unwrap();

        // Allocate until nodes land on an overflow page.
        let total = FIRST_PAGE_NODES + NODES_PER_PAGE + 3;
        for i in 0..total {
            let index = directory.add_new_node(0, 0, 8, &pointers(i as u64)).unwrap();
            assert_eq!(index, i);
        }
        assert!(
            engine.filled_up_to(engine.open_file("router.hid").unwrap()).unwrap() > 2,
            "expected overflow directory pages"
        );

        // Overflow nodes read back intact.
        let probe = FIRST_PAGE_NODES + 2;
        assert_eq!(directory.node(probe).unwrap(), pointers(probe as u64));

        // Tombstone two nodes; re-adding receives them in LIFO order.
        let a = 3;
        let b = FIRST_PAGE_NODES + 1;
        directory.delete_node(a).unwrap();
        directory.delete_node(b).unwrap();

        let first = directory
            .add_new_node(0, 0, 8, &pointers(900))
            .unwrap();
        let second = directory
            .add_new_node(0, 0, 8, &pointers(901))
            .unwrap();
        assert_eq!(first, b);
        assert_eq!(second, a);

        // Reused slots carry the new content.
        assert_eq!(directory.node(b).unwrap(), pointers(900));
        assert_eq!(directory.node(a).unwrap(), pointers(901));

        // Appending after the stack drains continues past the high mark.
        let next = directory.add_new_node(0, 0, 8, &pointers(902)).unwrap();
        assert_eq!(next, total);
    }

    #[test]
    fn clear_resets_to_empty_directory() {
        let (_dir, engine) = setup();
        let directory = HashDirectory::create(engine, "router").unwrap();

        directory.add_new_node(0, 0, 8, &pointers(1)).unwrap();
        directory.add_new_node(0, 0, 8, &pointers(2)).unwrap();
        directory.clear().unwrap();

        assert_eq!(directory.tree_size().unwrap(), 0);
        let index = directory.add_new_node(0, 0, 8, &pointers(3)).unwrap();
        assert_eq!(index, 0);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempdir().unwrap();

        {
            let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
            let directory = HashDirectory::create(engine, "router").unwrap();
            directory.add_new_node(1, 1, 8, &pointers(42)).unwrap();
        }

        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        let directory = HashDirectory::open(engine, "router").unwrap();
        assert_eq!(directory.tree_size().unwrap(), 1);
        assert_eq!(directory.node(0).unwrap(), pointers(42));
    }
}
