//! # Bonsai B-Tree
//!
//! A B-tree over sub-page buckets: many small trees share one file, each
//! identified by the pointer of its root bucket. Buckets come from the
//! file's sys bucket, which tracks the never-used frontier (free-space
//! pointer) and a stack of recycled buckets (free list). Deleting or
//! clearing a tree pushes its buckets onto that stack for reuse by any tree
//! in the file.
//!
//! Leaves are chained through sibling pointers in both directions, so range
//! listeners walk the chain instead of re-descending. Mutating entry points
//! take the exclusive side of the per-file lock; readers take the shared
//! side.
//!
//! ## Pin Discipline
//!
//! Buckets of one tree can share a page, so tree code never holds two page
//! pins at once: every step extracts what it needs, releases the page, and
//! re-loads later if it must write. The per-file exclusive lock makes the
//! gap between those single-pin steps private to the running operation.

mod bucket;
mod sys_bucket;

pub use bucket::{BonsaiBucket, BonsaiBucketMut, BonsaiPointer, SearchResult};
pub use sys_bucket::{SysBucket, SysBucketView, SYS_BUCKET_POINTER};

use std::collections::VecDeque;
use std::sync::Arc;

use eyre::{ensure, Result};
use hashbrown::HashSet;
use tracing::trace;

use crate::atomic::AtomicHandle;
use crate::config::{BONSAI_BUCKET_SIZE, PAGE_DATA_OFFSET, PAGE_SIZE};
use crate::engine::Engine;
use crate::serializer::{serializer_name, BinarySerializer};
use bucket::{leaf_entry_bytes, non_leaf_entry_bytes, POSITIONS_OFFSET};

pub const BONSAI_EXTENSION: &str = ".bonsai";

/// Largest entry a bucket accepts. Two maximal entries always fit in one
/// bucket, so splitting always makes progress.
pub const MAX_ENTRY_SIZE: usize = (BONSAI_BUCKET_SIZE - POSITIONS_OFFSET) / 2 - 2;

pub struct BonsaiTree<K, V> {
    engine: Arc<Engine>,
    name: String,
    file_id: u32,
    root: BonsaiPointer,
    key_ser: Arc<dyn BinarySerializer<K>>,
    value_ser: Arc<dyn BinarySerializer<V>>,
}

impl<K, V> std::fmt::Debug for BonsaiTree<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BonsaiTree")
            .field("name", &self.name)
            .field("file_id", &self.file_id)
            .field("root", &self.root)
            .finish()
    }
}

impl<K: Ord + Clone, V: Clone> BonsaiTree<K, V> {
    /// Creates a new tree in `name`'s bonsai file, creating the file (and
    /// its sys bucket) on first use. The tree is identified by its root
    /// pointer from then on.
    pub fn create(
        engine: Arc<Engine>,
        name: &str,
        key_ser: Arc<dyn BinarySerializer<K>>,
        value_ser: Arc<dyn BinarySerializer<V>>,
    ) -> Result<Self> {
        let full_name = format!("{}{}", name, BONSAI_EXTENSION);

        let (file_id, root) = engine.atomic().run_atomic(name, |atomic| {
            let file_id = if engine.file_exists(&full_name) {
                engine.open_file(&full_name)?
            } else {
                engine.add_file(&full_name, atomic)?
            };
            let _lock = engine.file_locks().exclusive(file_id);

            let root = allocate_bucket(&engine, file_id, atomic)?;
            let mut page = engine.load_for_write(file_id, root.page)?;
            {
                let mut root_bucket = BonsaiBucketMut::new(&mut page, root.offset);
                root_bucket.init(true, key_ser.id(), value_ser.id());
            }
            engine.release_page(page, atomic)?;
            Ok((file_id, root))
        })?;

        trace!(name, ?root, "created bonsai tree");
        Ok(Self {
            engine,
            name: name.to_string(),
            file_id,
            root,
            key_ser,
            value_ser,
        })
    }

    /// Opens the tree rooted at `root`, verifying the serializer ids
    /// recorded in the root bucket.
    pub fn open(
        engine: Arc<Engine>,
        name: &str,
        root: BonsaiPointer,
        key_ser: Arc<dyn BinarySerializer<K>>,
        value_ser: Arc<dyn BinarySerializer<V>>,
    ) -> Result<Self> {
        let full_name = format!("{}{}", name, BONSAI_EXTENSION);
        let file_id = engine.open_file(&full_name)?;
        let _lock = engine.file_locks().shared(file_id);

        let view = engine.load_for_read(file_id, root.page)?;
        let root_bucket = BonsaiBucket::new(&view, root.offset);
        ensure!(
            !root_bucket.is_deleted(),
            "bonsai tree at {:?} in '{}' was deleted",
            root,
            name
        );

        for (stored, expected) in [
            (root_bucket.key_serializer_id(), key_ser.id()),
            (root_bucket.value_serializer_id(), value_ser.id()),
        ] {
            ensure!(
                serializer_name(stored).is_some(),
                "unknown serializer id {} in bonsai root at {:?}",
                stored,
                root
            );
            ensure!(
                stored == expected,
                "serializer mismatch in bonsai root at {:?}: stored {} ({}), requested {}",
                root,
                stored,
                serializer_name(stored).unwrap_or("?"),
                expected
            );
        }
        drop(view);
        drop(_lock);

        Ok(Self {
            engine,
            name: name.to_string(),
            file_id,
            root,
            key_ser,
            value_ser,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root_pointer(&self) -> BonsaiPointer {
        self.root
    }

    // ---- reads ----------------------------------------------------------

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let _lock = self.engine.file_locks().shared(self.file_id);
        let (leaf, result) = self.find_leaf(key)?;
        if !result.found() {
            return Ok(None);
        }

        let view = self.engine.load_for_read(self.file_id, leaf.page)?;
        let bucket = BonsaiBucket::new(&view, leaf.offset);
        Ok(Some(bucket.value_at(
            result.index(),
            self.key_ser.as_ref(),
            self.value_ser.as_ref(),
        )?))
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        let _lock = self.engine.file_locks().shared(self.file_id);
        let (_, result) = self.find_leaf(key)?;
        Ok(result.found())
    }

    pub fn size(&self) -> Result<u64> {
        let _lock = self.engine.file_locks().shared(self.file_id);
        let view = self.engine.load_for_read(self.file_id, self.root.page)?;
        Ok(BonsaiBucket::new(&view, self.root.offset).tree_size())
    }

    pub fn first_key(&self) -> Result<Option<K>> {
        let _lock = self.engine.file_locks().shared(self.file_id);
        self.edge_key(true)
    }

    pub fn last_key(&self) -> Result<Option<K>> {
        let _lock = self.engine.file_locks().shared(self.file_id);
        self.edge_key(false)
    }

    fn edge_key(&self, first: bool) -> Result<Option<K>> {
        let mut ptr = self.root;

        // Descend along the edge, then walk the sibling chain past any
        // leaves emptied by removals.
        loop {
            let view = self.engine.load_for_read(self.file_id, ptr.page)?;
            let bucket = BonsaiBucket::new(&view, ptr.offset);

            if !bucket.is_leaf() {
                let size = bucket.size();
                ptr = if first {
                    bucket.children_at(0).0
                } else {
                    bucket.children_at(size - 1).1
                };
                continue;
            }

            if bucket.size() > 0 {
                let index = if first { 0 } else { bucket.size() - 1 };
                return Ok(Some(bucket.key_at(index, self.key_ser.as_ref())?));
            }

            let sibling = if first {
                bucket.right_sibling()
            } else {
                bucket.left_sibling()
            };
            if sibling.is_null() {
                return Ok(None);
            }
            drop(view);
            ptr = sibling;
        }
    }

    // ---- writes ---------------------------------------------------------

    /// Inserts or replaces. Returns true when the key was new.
    pub fn put(&self, key: &K, value: &V) -> Result<bool> {
        let entry_probe =
            self.key_ser.object_size(key) + self.value_ser.object_size(value);
        ensure!(
            entry_probe <= MAX_ENTRY_SIZE,
            "entry of {} bytes exceeds bonsai bucket budget of {}",
            entry_probe,
            MAX_ENTRY_SIZE
        );

        let _lock = self.engine.file_locks().exclusive(self.file_id);
        self.engine.atomic().run_atomic(&self.name, |atomic| {
            // Set when a same-key replacement had to be re-inserted because
            // the grown entry no longer fit its bucket.
            let mut replacing = false;

            loop {
                let (leaf, result) = self.find_leaf(key)?;

                if let SearchResult::Found(index) = result {
                    let mut page = self.engine.load_for_write(self.file_id, leaf.page)?;
                    let updated = {
                        let mut bucket = BonsaiBucketMut::new(&mut page, leaf.offset);
                        let updated = bucket.update_value(
                            index,
                            value,
                            self.key_ser.as_ref(),
                            self.value_ser.as_ref(),
                        )?;
                        if !updated {
                            bucket.remove_at(index)?;
                        }
                        updated
                    };
                    self.engine.release_page(page, atomic)?;
                    if updated {
                        return Ok(false);
                    }
                    replacing = true;
                    continue;
                }

                let entry = leaf_entry_bytes(
                    key,
                    value,
                    self.key_ser.as_ref(),
                    self.value_ser.as_ref(),
                );
                {
                    let mut page = self.engine.load_for_write(self.file_id, leaf.page)?;
                    let inserted = BonsaiBucketMut::new(&mut page, leaf.offset)
                        .insert_raw(result.index(), &entry);
                    self.engine.release_page(page, atomic)?;
                    if inserted {
                        if !replacing {
                            self.update_size(1, atomic)?;
                        }
                        return Ok(!replacing);
                    }
                }

                self.split_bucket(leaf, atomic)?;
            }
        })
    }

    /// Removes the key, returning its previous value.
    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        let _lock = self.engine.file_locks().exclusive(self.file_id);
        self.engine.atomic().run_atomic(&self.name, |atomic| {
            let (leaf, result) = self.find_leaf(key)?;
            let index = match result {
                SearchResult::Found(index) => index,
                SearchResult::NotFound(_) => return Ok(None),
            };

            let mut page = self.engine.load_for_write(self.file_id, leaf.page)?;
            let value = {
                let mut bucket = BonsaiBucketMut::new(&mut page, leaf.offset);
                let value = bucket.value_at(
                    index,
                    self.key_ser.as_ref(),
                    self.value_ser.as_ref(),
                )?;
                bucket.remove_at(index)?;
                value
            };
            self.engine.release_page(page, atomic)?;

            self.update_size(-1, atomic)?;
            Ok(Some(value))
        })
    }

    /// Removes every entry, recycling all buckets but the root.
    pub fn clear(&self) -> Result<()> {
        let _lock = self.engine.file_locks().exclusive(self.file_id);
        self.engine.atomic().run_atomic(&self.name, |atomic| {
            let mut queue = VecDeque::new();
            {
                let view = self.engine.load_for_read(self.file_id, self.root.page)?;
                let root = BonsaiBucket::new(&view, self.root.offset);
                if !root.is_leaf() {
                    collect_children(&root, &mut queue);
                }
            }

            self.recycle_subtrees(queue, atomic)?;

            let mut page = self.engine.load_for_write(self.file_id, self.root.page)?;
            {
                let mut root = BonsaiBucketMut::new(&mut page, self.root.offset);
                let key_id = root.key_serializer_id();
                let value_id = root.value_serializer_id();
                root.init(true, key_id, value_id);
            }
            self.engine.release_page(page, atomic)?;
            Ok(())
        })
    }

    /// Deletes the whole tree, recycling every bucket including the root.
    pub fn delete(self) -> Result<()> {
        let _lock = self.engine.file_locks().exclusive(self.file_id);
        self.engine.atomic().run_atomic(&self.name, |atomic| {
            let mut queue = VecDeque::new();
            queue.push_back(self.root);
            self.recycle_subtrees(queue, atomic)
        })
    }

    // ---- range listeners -------------------------------------------------

    /// Visits entries with key >= (or >) `from` in ascending order until the
    /// listener returns false.
    pub fn values_major(
        &self,
        from: &K,
        inclusive: bool,
        listener: &mut dyn FnMut(&K, &V) -> bool,
    ) -> Result<()> {
        let _lock = self.engine.file_locks().shared(self.file_id);
        let (leaf, result) = self.find_leaf(from)?;

        let start = match result {
            SearchResult::Found(index) => {
                if inclusive {
                    index
                } else {
                    index + 1
                }
            }
            SearchResult::NotFound(index) => index,
        };

        self.walk_forward(leaf, start, |key, value| {
            Ok(listener(key, value))
        })
    }

    /// Visits entries with key <= (or <) `to` in descending order until the
    /// listener returns false.
    pub fn values_minor(
        &self,
        to: &K,
        inclusive: bool,
        listener: &mut dyn FnMut(&K, &V) -> bool,
    ) -> Result<()> {
        let _lock = self.engine.file_locks().shared(self.file_id);
        let (leaf, result) = self.find_leaf(to)?;

        let start = match result {
            SearchResult::Found(index) => {
                if inclusive {
                    index as isize
                } else {
                    index as isize - 1
                }
            }
            SearchResult::NotFound(index) => index as isize - 1,
        };

        self.walk_backward(leaf, start, listener)
    }

    /// Visits entries inside the range in ascending order until the
    /// listener returns false.
    pub fn values_between(
        &self,
        from: &K,
        from_inclusive: bool,
        to: &K,
        to_inclusive: bool,
        listener: &mut dyn FnMut(&K, &V) -> bool,
    ) -> Result<()> {
        let _lock = self.engine.file_locks().shared(self.file_id);
        let (leaf, result) = self.find_leaf(from)?;

        let start = match result {
            SearchResult::Found(index) => {
                if from_inclusive {
                    index
                } else {
                    index + 1
                }
            }
            SearchResult::NotFound(index) => index,
        };

        self.walk_forward(leaf, start, |key, value| {
            let in_range = match key.cmp(to) {
                std::cmp::Ordering::Less => true,
                std::cmp::Ordering::Equal => to_inclusive,
                std::cmp::Ordering::Greater => false,
            };
            if !in_range {
                return Ok(false);
            }
            Ok(listener(key, value))
        })
    }

    fn walk_forward(
        &self,
        mut leaf: BonsaiPointer,
        mut start: usize,
        mut visit: impl FnMut(&K, &V) -> Result<bool>,
    ) -> Result<()> {
        loop {
            let batch = self.read_leaf_entries(leaf)?;
            for (key, value) in batch.entries.iter().skip(start) {
                if !visit(key, value)? {
                    return Ok(());
                }
            }

            if batch.right.is_null() {
                return Ok(());
            }
            leaf = batch.right;
            start = 0;
        }
    }

    fn walk_backward(
        &self,
        mut leaf: BonsaiPointer,
        mut start: isize,
        listener: &mut dyn FnMut(&K, &V) -> bool,
    ) -> Result<()> {
        loop {
            let batch = self.read_leaf_entries(leaf)?;
            let mut index = if start < 0 {
                -1
            } else {
                start.min(batch.entries.len() as isize - 1)
            };

            while index >= 0 {
                let (key, value) = &batch.entries[index as usize];
                if !listener(key, value) {
                    return Ok(());
                }
                index -= 1;
            }

            if batch.left.is_null() {
                return Ok(());
            }
            leaf = batch.left;
            start = isize::MAX;
        }
    }

    // ---- internals ------------------------------------------------------

    /// Descends from the root to the leaf responsible for `key`.
    fn find_leaf(&self, key: &K) -> Result<(BonsaiPointer, SearchResult)> {
        let mut ptr = self.root;

        loop {
            let view = self.engine.load_for_read(self.file_id, ptr.page)?;
            let bucket = BonsaiBucket::new(&view, ptr.offset);
            let result = bucket.find(key, self.key_ser.as_ref())?;

            if bucket.is_leaf() {
                return Ok((ptr, result));
            }

            ptr = match result {
                SearchResult::Found(index) => bucket.children_at(index).1,
                SearchResult::NotFound(0) => bucket.children_at(0).0,
                SearchResult::NotFound(index) => bucket.children_at(index - 1).1,
            };
        }
    }

    /// Bucket whose routed child for `key` is `child`; the true parent of
    /// that bucket at the time of the call. Splits deepen the tree, so
    /// parents are re-located by identity, never by remembered depth.
    fn find_parent_of(&self, key: &K, child: BonsaiPointer) -> Result<BonsaiPointer> {
        let mut ptr = self.root;

        loop {
            let view = self.engine.load_for_read(self.file_id, ptr.page)?;
            let bucket = BonsaiBucket::new(&view, ptr.offset);
            ensure!(
                !bucket.is_leaf(),
                "no parent bucket routes to {:?} in bonsai tree '{}'",
                child,
                self.name
            );

            let result = bucket.find(key, self.key_ser.as_ref())?;
            let routed = match result {
                SearchResult::Found(index) => bucket.children_at(index).1,
                SearchResult::NotFound(0) => bucket.children_at(0).0,
                SearchResult::NotFound(index) => bucket.children_at(index - 1).1,
            };
            if routed == child {
                return Ok(ptr);
            }
            ptr = routed;
        }
    }

    /// Splits the bucket at `ptr`, recursing into parents as separator
    /// insertions overflow them.
    fn split_bucket(&self, ptr: BonsaiPointer, atomic: &AtomicHandle) -> Result<()> {
        // Extract the bucket wholesale before touching anything else; two
        // buckets can share a page and only one pin may be held.
        let (is_leaf, entries, right_sibling, tree_size) = {
            let view = self.engine.load_for_read(self.file_id, ptr.page)?;
            let bucket = BonsaiBucket::new(&view, ptr.offset);
            let size = bucket.size();
            ensure!(size >= 2, "cannot split bonsai bucket with {} entries", size);

            let entries: Vec<Vec<u8>> = (0..size).map(|i| bucket.raw_entry_at(i)).collect();
            (
                bucket.is_leaf(),
                entries,
                bucket.right_sibling(),
                bucket.tree_size(),
            )
        };

        let size = entries.len();
        let split_index = size / 2;

        let separator_key: K = {
            let offset = if is_leaf { 0 } else { 16 };
            self.key_ser
                .deserialize(&entries[split_index], offset)?
        };

        let start_right = if is_leaf { split_index } else { split_index + 1 };
        let right_entries: Vec<Vec<u8>> = entries[start_right..].to_vec();

        if ptr == self.root {
            self.split_root(is_leaf, &entries, split_index, &separator_key, tree_size, atomic)
        } else {
            self.split_non_root(
                ptr,
                is_leaf,
                &entries,
                split_index,
                &separator_key,
                right_entries,
                right_sibling,
                atomic,
            )
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn split_non_root(
        &self,
        ptr: BonsaiPointer,
        is_leaf: bool,
        entries: &[Vec<u8>],
        split_index: usize,
        separator_key: &K,
        right_entries: Vec<Vec<u8>>,
        right_sibling: BonsaiPointer,
        atomic: &AtomicHandle,
    ) -> Result<()> {
        let (key_id, value_id) = (self.key_ser.id(), self.value_ser.id());

        // New right bucket.
        let right_ptr = allocate_bucket(&self.engine, self.file_id, atomic)?;
        {
            let mut page = self.engine.load_for_write(self.file_id, right_ptr.page)?;
            {
                let mut right = BonsaiBucketMut::new(&mut page, right_ptr.offset);
                right.init(is_leaf, key_id, value_id);
                right.set_entries(&right_entries)?;
                if is_leaf {
                    right.set_left_sibling(ptr);
                    right.set_right_sibling(right_sibling);
                }
            }
            self.engine.release_page(page, atomic)?;
        }

        // Back-pointer of the previous right sibling.
        if is_leaf && !right_sibling.is_null() {
            let mut page = self.engine.load_for_write(self.file_id, right_sibling.page)?;
            BonsaiBucketMut::new(&mut page, right_sibling.offset).set_left_sibling(right_ptr);
            self.engine.release_page(page, atomic)?;
        }

        // Shrink the original to the left half.
        {
            let mut page = self.engine.load_for_write(self.file_id, ptr.page)?;
            {
                let mut left = BonsaiBucketMut::new(&mut page, ptr.offset);
                left.set_entries(&entries[..split_index])?;
                if is_leaf {
                    left.set_right_sibling(right_ptr);
                }
            }
            self.engine.release_page(page, atomic)?;
        }

        // Insert the separator into the parent, splitting it first when
        // necessary. The parent is re-located by identity after every split
        // because a recursive root split shifts every bucket one level down.
        loop {
            let parent_ptr = self.find_parent_of(separator_key, ptr)?;
            let separator =
                non_leaf_entry_bytes(ptr, right_ptr, separator_key, self.key_ser.as_ref());

            let mut page = self.engine.load_for_write(self.file_id, parent_ptr.page)?;
            let inserted = {
                let mut parent = BonsaiBucketMut::new(&mut page, parent_ptr.offset);
                let result = parent.find(separator_key, self.key_ser.as_ref())?;
                ensure!(
                    !result.found(),
                    "separator key already present in bonsai parent"
                );
                let index = result.index();
                if parent.insert_raw(index, &separator) {
                    // Keep the neighbor-child invariant: adjacent entries
                    // share the child between their keys.
                    let size = parent.size();
                    if index + 1 < size {
                        parent.set_child_at(index + 1, true, right_ptr);
                    }
                    if index > 0 {
                        parent.set_child_at(index - 1, false, ptr);
                    }
                    true
                } else {
                    false
                }
            };
            self.engine.release_page(page, atomic)?;

            if inserted {
                return Ok(());
            }
            self.split_bucket(parent_ptr, atomic)?;
        }
    }

    fn split_root(
        &self,
        is_leaf: bool,
        entries: &[Vec<u8>],
        split_index: usize,
        separator_key: &K,
        tree_size: u64,
        atomic: &AtomicHandle,
    ) -> Result<()> {
        let (key_id, value_id) = (self.key_ser.id(), self.value_ser.id());
        let start_right = if is_leaf { split_index } else { split_index + 1 };

        let left_ptr = allocate_bucket(&self.engine, self.file_id, atomic)?;
        let right_ptr = allocate_bucket(&self.engine, self.file_id, atomic)?;

        {
            let mut page = self.engine.load_for_write(self.file_id, left_ptr.page)?;
            {
                let mut left = BonsaiBucketMut::new(&mut page, left_ptr.offset);
                left.init(is_leaf, key_id, value_id);
                left.set_entries(&entries[..split_index])?;
                if is_leaf {
                    left.set_right_sibling(right_ptr);
                }
            }
            self.engine.release_page(page, atomic)?;
        }

        {
            let mut page = self.engine.load_for_write(self.file_id, right_ptr.page)?;
            {
                let mut right = BonsaiBucketMut::new(&mut page, right_ptr.offset);
                right.init(is_leaf, key_id, value_id);
                right.set_entries(&entries[start_right..])?;
                if is_leaf {
                    right.set_left_sibling(left_ptr);
                }
            }
            self.engine.release_page(page, atomic)?;
        }

        let separator =
            non_leaf_entry_bytes(left_ptr, right_ptr, separator_key, self.key_ser.as_ref());
        let mut page = self.engine.load_for_write(self.file_id, self.root.page)?;
        {
            let mut root = BonsaiBucketMut::new(&mut page, self.root.offset);
            root.init(false, key_id, value_id);
            root.set_tree_size(tree_size);
            ensure!(
                root.insert_raw(0, &separator),
                "root separator does not fit an empty bonsai bucket"
            );
        }
        self.engine.release_page(page, atomic)?;
        Ok(())
    }

    fn update_size(&self, delta: i64, atomic: &AtomicHandle) -> Result<()> {
        let mut page = self.engine.load_for_write(self.file_id, self.root.page)?;
        {
            let mut root = BonsaiBucketMut::new(&mut page, self.root.offset);
            let size = root.tree_size();
            root.set_tree_size(size.wrapping_add(delta as u64));
        }
        self.engine.release_page(page, atomic)
    }

    /// Walks the subtrees breadth-first, marking each bucket deleted and
    /// threading them into a chain that is spliced onto the sys free list.
    fn recycle_subtrees(
        &self,
        mut queue: VecDeque<BonsaiPointer>,
        atomic: &AtomicHandle,
    ) -> Result<()> {
        let tail = match queue.front() {
            Some(&tail) => tail,
            None => return Ok(()),
        };

        let mut seen: HashSet<BonsaiPointer> = queue.iter().copied().collect();
        let mut head = BonsaiPointer::NULL;
        let mut count = 0u64;

        while let Some(ptr) = queue.pop_front() {
            {
                let view = self.engine.load_for_read(self.file_id, ptr.page)?;
                let bucket = BonsaiBucket::new(&view, ptr.offset);
                if !bucket.is_leaf() {
                    let mut children = VecDeque::new();
                    collect_children(&bucket, &mut children);
                    for child in children {
                        if seen.insert(child) {
                            queue.push_back(child);
                        }
                    }
                }
            }

            let mut page = self.engine.load_for_write(self.file_id, ptr.page)?;
            {
                let mut bucket = BonsaiBucketMut::new(&mut page, ptr.offset);
                bucket.set_free_list_next(head);
                if bucket.size() > 0 {
                    bucket.shrink(0)?;
                }
                bucket.set_deleted();
            }
            self.engine.release_page(page, atomic)?;

            head = ptr;
            count += 1;
        }

        // Splice: the first recycled bucket (chain tail) hooks onto the old
        // free-list head, then the sys bucket points at the new head.
        let old_head = {
            let view = self.engine.load_for_read(self.file_id, SYS_BUCKET_POINTER.page)?;
            SysBucketView::new(&view).free_list_head()
        };

        {
            let mut page = self.engine.load_for_write(self.file_id, tail.page)?;
            BonsaiBucketMut::new(&mut page, tail.offset).set_free_list_next(old_head);
            self.engine.release_page(page, atomic)?;
        }

        let mut page = self
            .engine
            .load_for_write(self.file_id, SYS_BUCKET_POINTER.page)?;
        {
            let mut sys = SysBucket::new(&mut page);
            sys.set_free_list_head(head);
            let length = sys.free_list_length();
            sys.set_free_list_length(length + count);
        }
        self.engine.release_page(page, atomic)?;

        trace!(name = %self.name, count, "recycled bonsai buckets");
        Ok(())
    }

    fn read_leaf_entries(&self, leaf: BonsaiPointer) -> Result<LeafBatch<K, V>> {
        let view = self.engine.load_for_read(self.file_id, leaf.page)?;
        let bucket = BonsaiBucket::new(&view, leaf.offset);
        ensure!(bucket.is_leaf(), "bonsai sibling chain reached a non-leaf");

        let mut entries = Vec::with_capacity(bucket.size());
        for i in 0..bucket.size() {
            let key = bucket.key_at(i, self.key_ser.as_ref())?;
            let value = bucket.value_at(i, self.key_ser.as_ref(), self.value_ser.as_ref())?;
            entries.push((key, value));
        }

        Ok(LeafBatch {
            entries,
            left: bucket.left_sibling(),
            right: bucket.right_sibling(),
        })
    }
}

struct LeafBatch<K, V> {
    entries: Vec<(K, V)>,
    left: BonsaiPointer,
    right: BonsaiPointer,
}

/// Collects each entry's left child once plus the rightmost child:
/// adjacent entries share the child between their keys.
fn collect_children(bucket: &BonsaiBucket<'_, '_>, queue: &mut VecDeque<BonsaiPointer>) {
    let size = bucket.size();
    for i in 0..size {
        queue.push_back(bucket.children_at(i).0);
    }
    if size > 0 {
        queue.push_back(bucket.children_at(size - 1).1);
    }
}

/// Hands out a bucket slot: free-list head first, then the free-space
/// frontier, then a fresh page. Creates the sys bucket on first call.
fn allocate_bucket(engine: &Engine, file_id: u32, atomic: &AtomicHandle) -> Result<BonsaiPointer> {
    if engine.filled_up_to(file_id)? == 0 {
        let (mut page, index) = engine.add_page(file_id)?;
        debug_assert_eq!(index, 0);
        SysBucket::new(&mut page).init();
        engine.release_page(page, atomic)?;
    }

    // Reuse from the free list.
    let (head, length) = {
        let view = engine.load_for_read(file_id, SYS_BUCKET_POINTER.page)?;
        let sys = SysBucketView::new(&view);
        (sys.free_list_head(), sys.free_list_length())
    };

    if length > 0 {
        ensure!(
            !head.is_null(),
            "bonsai free list length {} with null head",
            length
        );

        let next = {
            let mut page = engine.load_for_write(file_id, head.page)?;
            let next = BonsaiBucketMut::new(&mut page, head.offset).free_list_next();
            engine.release_page(page, atomic)?;
            next
        };

        let mut page = engine.load_for_write(file_id, SYS_BUCKET_POINTER.page)?;
        {
            let mut sys = SysBucket::new(&mut page);
            sys.set_free_list_head(next);
            sys.set_free_list_length(length - 1);
        }
        engine.release_page(page, atomic)?;
        return Ok(head);
    }

    // Carve from the frontier.
    let frontier = {
        let view = engine.load_for_read(file_id, SYS_BUCKET_POINTER.page)?;
        SysBucketView::new(&view).free_space_pointer()
    };

    if frontier.offset as usize + BONSAI_BUCKET_SIZE <= PAGE_SIZE {
        let mut page = engine.load_for_write(file_id, SYS_BUCKET_POINTER.page)?;
        SysBucket::new(&mut page).set_free_space_pointer(BonsaiPointer::new(
            frontier.page,
            frontier.offset + BONSAI_BUCKET_SIZE as u32,
        ));
        engine.release_page(page, atomic)?;
        return Ok(frontier);
    }

    // Frontier page exhausted: start a fresh page.
    let (page, page_index) = engine.add_page(file_id)?;
    engine.release_page(page, atomic)?;

    let mut sys_page = engine.load_for_write(file_id, SYS_BUCKET_POINTER.page)?;
    SysBucket::new(&mut sys_page).set_free_space_pointer(BonsaiPointer::new(
        page_index,
        (PAGE_DATA_OFFSET + BONSAI_BUCKET_SIZE) as u32,
    ));
    engine.release_page(sys_page, atomic)?;

    Ok(BonsaiPointer::new(page_index, PAGE_DATA_OFFSET as u32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::serializer::U64Serializer;
    use tempfile::tempdir;

    fn make_tree(engine: Arc<Engine>, name: &str) -> BonsaiTree<u64, u64> {
        BonsaiTree::create(
            engine,
            name,
            Arc::new(U64Serializer),
            Arc::new(U64Serializer),
        )
        .unwrap()
    }

    fn setup() -> (tempfile::TempDir, Arc<Engine>) {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        (dir, engine)
    }

    #[test]
    fn put_get_remove_roundtrip() {
        let (_dir, engine) = setup();
        let tree = make_tree(engine, "links");

        assert!(tree.put(&10, &100).unwrap());
        assert!(tree.put(&20, &200).unwrap());
        assert!(!tree.put(&10, &111).unwrap(), "replace reports not-new");

        assert_eq!(tree.get(&10).unwrap(), Some(111));
        assert_eq!(tree.get(&20).unwrap(), Some(200));
        assert_eq!(tree.get(&30).unwrap(), None);
        assert_eq!(tree.size().unwrap(), 2);

        assert_eq!(tree.remove(&10).unwrap(), Some(111));
        assert_eq!(tree.remove(&10).unwrap(), None);
        assert_eq!(tree.get(&10).unwrap(), None);
        assert_eq!(tree.size().unwrap(), 1);
    }

    #[test]
    fn fill_leaf_until_split_keeps_every_key_findable() {
        let (_dir, engine) = setup();
        let tree = make_tree(Arc::clone(&engine), "links");

        // Twice a bucket's worth of u64 keys forces several splits.
        let total = 2 * BONSAI_BUCKET_SIZE as u64 / 8;
        for key in 0..total {
            assert!(tree.put(&key, &(key * 2)).unwrap());
            // Every key inserted so far stays findable after each insert.
            assert_eq!(tree.get(&key).unwrap(), Some(key * 2));
            assert_eq!(tree.get(&0).unwrap(), Some(0));
        }

        assert_eq!(tree.size().unwrap(), total);
        for key in 0..total {
            assert_eq!(tree.get(&key).unwrap(), Some(key * 2), "key {}", key);
        }
    }

    #[test]
    fn first_split_leaves_root_with_one_separator() {
        let (_dir, engine) = setup();
        let tree = make_tree(Arc::clone(&engine), "links");

        // Insert ascending until the root stops being a leaf.
        let mut inserted = Vec::new();
        for key in 0.. {
            tree.put(&key, &key).unwrap();
            inserted.push(key);

            let view = engine
                .load_for_read(tree.file_id, tree.root.page)
                .unwrap();
            let root = BonsaiBucket::new(&view, tree.root.offset);
            if !root.is_leaf() {
                assert_eq!(root.size(), 1, "fresh non-leaf root has one separator");
                break;
            }
        }

        // Both children together hold every inserted key.
        let mut seen = Vec::new();
        tree.values_major(&0, true, &mut |key, _value| {
            seen.push(*key);
            true
        })
        .unwrap();
        assert_eq!(seen, inserted);
        assert_eq!(tree.size().unwrap(), inserted.len() as u64);
    }

    #[test]
    fn range_listeners_respect_bounds_and_direction() {
        let (_dir, engine) = setup();
        let tree = make_tree(engine, "links");

        for key in [1u64, 3, 5, 7, 9] {
            tree.put(&key, &(key * 10)).unwrap();
        }

        let mut major = Vec::new();
        tree.values_major(&3, true, &mut |k, v| {
            major.push((*k, *v));
            true
        })
        .unwrap();
        assert_eq!(major, vec![(3, 30), (5, 50), (7, 70), (9, 90)]);

        let mut major_exclusive = Vec::new();
        tree.values_major(&3, false, &mut |k, _| {
            major_exclusive.push(*k);
            true
        })
        .unwrap();
        assert_eq!(major_exclusive, vec![5, 7, 9]);

        let mut minor = Vec::new();
        tree.values_minor(&5, true, &mut |k, _| {
            minor.push(*k);
            true
        })
        .unwrap();
        assert_eq!(minor, vec![5, 3, 1]);

        let mut between = Vec::new();
        tree.values_between(&3, false, &7, true, &mut |k, _| {
            between.push(*k);
            true
        })
        .unwrap();
        assert_eq!(between, vec![5, 7]);

        // Early termination.
        let mut stopped = Vec::new();
        tree.values_major(&0, true, &mut |k, _| {
            stopped.push(*k);
            stopped.len() < 2
        })
        .unwrap();
        assert_eq!(stopped, vec![1, 3]);
    }

    #[test]
    fn first_and_last_key_track_edges() {
        let (_dir, engine) = setup();
        let tree = make_tree(engine, "links");

        assert_eq!(tree.first_key().unwrap(), None);
        assert_eq!(tree.last_key().unwrap(), None);

        for key in [42u64, 7, 99, 13] {
            tree.put(&key, &key).unwrap();
        }
        assert_eq!(tree.first_key().unwrap(), Some(7));
        assert_eq!(tree.last_key().unwrap(), Some(99));

        tree.remove(&7).unwrap();
        assert_eq!(tree.first_key().unwrap(), Some(13));
    }

    #[test]
    fn delete_pushes_buckets_onto_free_list() {
        let (_dir, engine) = setup();
        let tree = make_tree(Arc::clone(&engine), "links");

        let total = 2 * BONSAI_BUCKET_SIZE as u64 / 8;
        for key in 0..total {
            tree.put(&key, &key).unwrap();
        }

        let file_id = tree.file_id;
        let root = tree.root;
        tree.delete().unwrap();

        let view = engine.load_for_read(file_id, SYS_BUCKET_POINTER.page).unwrap();
        let sys = SysBucketView::new(&view);
        assert!(sys.free_list_length() >= 3, "tree had at least root + two leaves");
        assert!(!sys.free_list_head().is_null());
        drop(view);

        // Every freed bucket is flagged deleted; walk the free list.
        let mut ptr = {
            let view = engine.load_for_read(file_id, SYS_BUCKET_POINTER.page).unwrap();
            SysBucketView::new(&view).free_list_head()
        };
        let mut walked = 0;
        let mut saw_root = false;
        while !ptr.is_null() {
            let view = engine.load_for_read(file_id, ptr.page).unwrap();
            let bucket = BonsaiBucket::new(&view, ptr.offset);
            assert!(bucket.is_deleted());
            saw_root |= ptr == root;
            walked += 1;
            let next = {
                drop(view);
                let mut page = engine.load_for_write(file_id, ptr.page).unwrap();
                let next = BonsaiBucketMut::new(&mut page, ptr.offset).free_list_next();
                drop(page);
                next
            };
            ptr = next;
        }
        assert!(walked >= 3);
        assert!(saw_root, "deleted tree's root is on the free list");
    }

    #[test]
    fn clear_empties_but_keeps_the_tree_usable() {
        let (_dir, engine) = setup();
        let tree = make_tree(Arc::clone(&engine), "links");

        let total = 2 * BONSAI_BUCKET_SIZE as u64 / 8;
        for key in 0..total {
            tree.put(&key, &key).unwrap();
        }

        tree.clear().unwrap();
        assert_eq!(tree.size().unwrap(), 0);
        assert_eq!(tree.get(&5).unwrap(), None);
        assert_eq!(tree.first_key().unwrap(), None);

        // Freed buckets are reused by later inserts.
        let freed = {
            let view = engine
                .load_for_read(tree.file_id, SYS_BUCKET_POINTER.page)
                .unwrap();
            SysBucketView::new(&view).free_list_length()
        };
        assert!(freed > 0);

        tree.put(&1, &1).unwrap();
        assert_eq!(tree.get(&1).unwrap(), Some(1));
    }

    #[test]
    fn allocation_reuses_free_list_before_frontier() {
        let (_dir, engine) = setup();
        let tree = make_tree(Arc::clone(&engine), "links");

        let total = 2 * BONSAI_BUCKET_SIZE as u64 / 8;
        for key in 0..total {
            tree.put(&key, &key).unwrap();
        }
        tree.clear().unwrap();

        let before = {
            let view = engine
                .load_for_read(tree.file_id, SYS_BUCKET_POINTER.page)
                .unwrap();
            let sys = SysBucketView::new(&view);
            (sys.free_list_length(), sys.free_space_pointer())
        };

        // A second tree in the same file allocates from the free list.
        let other = make_tree(Arc::clone(&engine), "links");
        let after = {
            let view = engine
                .load_for_read(other.file_id, SYS_BUCKET_POINTER.page)
                .unwrap();
            let sys = SysBucketView::new(&view);
            (sys.free_list_length(), sys.free_space_pointer())
        };

        assert_eq!(other.file_id, tree.file_id, "same bonsai file");
        assert_eq!(after.0, before.0 - 1, "allocation popped the free list");
        assert_eq!(after.1, before.1, "frontier untouched while free list serves");
    }

    #[test]
    fn multiple_trees_share_one_file() {
        let (_dir, engine) = setup();
        let a = make_tree(Arc::clone(&engine), "links");
        let b = make_tree(Arc::clone(&engine), "links");

        assert_eq!(a.file_id, b.file_id);
        assert_ne!(a.root_pointer(), b.root_pointer());

        a.put(&1, &10).unwrap();
        b.put(&1, &20).unwrap();
        assert_eq!(a.get(&1).unwrap(), Some(10));
        assert_eq!(b.get(&1).unwrap(), Some(20));
    }

    #[test]
    fn open_validates_serializer_ids() {
        let (_dir, engine) = setup();
        let tree = make_tree(Arc::clone(&engine), "links");
        tree.put(&1, &2).unwrap();
        let root = tree.root_pointer();

        // Matching serializers open fine.
        let reopened: BonsaiTree<u64, u64> = BonsaiTree::open(
            Arc::clone(&engine),
            "links",
            root,
            Arc::new(U64Serializer),
            Arc::new(U64Serializer),
        )
        .unwrap();
        assert_eq!(reopened.get(&1).unwrap(), Some(2));

        // Mismatched key serializer is refused.
        let mismatch: Result<BonsaiTree<String, u64>> = BonsaiTree::open(
            Arc::clone(&engine),
            "links",
            root,
            Arc::new(crate::serializer::StringSerializer),
            Arc::new(U64Serializer),
        );
        assert!(mismatch.is_err());
        assert!(mismatch
            .unwrap_err()
            .to_string()
            .contains("serializer mismatch"));
    }

    #[test]
    fn rollback_of_failed_put_leaves_tree_unchanged() {
        let (_dir, engine) = setup();
        let tree = make_tree(Arc::clone(&engine), "links");
        tree.put(&1, &1).unwrap();

        // An oversized entry is rejected before any mutation.
        let huge = vec![0u8; MAX_ENTRY_SIZE + 1];
        let byte_tree: BonsaiTree<u64, Vec<u8>> = BonsaiTree::create(
            Arc::clone(&engine),
            "payloads",
            Arc::new(U64Serializer),
            Arc::new(crate::serializer::BytesSerializer),
        )
        .unwrap();
        assert!(byte_tree.put(&1, &huge).is_err());
        assert_eq!(byte_tree.size().unwrap(), 0);
        assert_eq!(byte_tree.get(&1).unwrap(), None);
    }

    #[test]
    fn survives_reopen_through_recovery() {
        let dir = tempdir().unwrap();
        let root;
        {
            let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
            let tree = make_tree(engine, "links");
            for key in 0..100u64 {
                tree.put(&key, &(key + 1)).unwrap();
            }
            root = tree.root_pointer();
        }

        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        let tree: BonsaiTree<u64, u64> = BonsaiTree::open(
            engine,
            "links",
            root,
            Arc::new(U64Serializer),
            Arc::new(U64Serializer),
        )
        .unwrap();
        assert_eq!(tree.size().unwrap(), 100);
        for key in 0..100u64 {
            assert_eq!(tree.get(&key).unwrap(), Some(key + 1));
        }
    }
}
