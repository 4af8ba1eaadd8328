//! # Prefix B+-Tree
//!
//! Ordered index over variable-length string keys with per-bucket prefix
//! compression. One tree per file, root at page 0. An optional companion
//! file holds the single value of the null key.
//!
//! ## Shape
//!
//! - Lookup descends from the root with a binary search per bucket over the
//!   prefix-restored keys; equal keys route into the right child.
//! - Insertion descends collecting the path and, per level, the left and
//!   right boundary keys the parent's neighbor entries imply. When a leaf
//!   overflows, it splits: the separator is the shortest key that
//!   distinguishes the halves, and both halves re-encode their entries
//!   against prefixes recomputed from the separator and the boundaries.
//! - Deletion removes the leaf entry only; buckets are never merged and an
//!   emptied bucket is reused as keys return.
//! - Values above the embedding limit live in value-page chains
//!   ([`value_page`]); leaves then store the chain head.
//! - Cursors buffer one leaf batch at a time and re-descend from the root
//!   using the last key they returned, so they never hold pins or locks
//!   between batches.
//!
//! Splitting never moves the root page: a root split writes both halves to
//! fresh pages and re-initializes page 0 with a single separator, so the
//! root page index is a stable part of the tree's identity.

mod bucket;
mod cursor;
mod null_bucket;
mod value_page;

pub use bucket::{
    common_prefix, min_separation_key, LeafValue, PrefixBucket, PrefixBucketMut, SearchResult,
};
pub use cursor::{KeyCursor, TreeCursor};

use std::sync::Arc;

use eyre::{bail, ensure, Result};
use parking_lot::RwLock;
use smallvec::SmallVec;
use tracing::trace;

use crate::atomic::AtomicHandle;
use crate::crypto::EntryCipher;
use crate::engine::Engine;
use bucket::{encode_leaf_entry, encode_node_entry, LeafEntry, NodeEntry};

pub const PREFIX_TREE_EXTENSION: &str = ".pbt";
pub const NULL_BUCKET_EXTENSION: &str = ".npt";

/// The root bucket always lives at page 0 of the data file.
pub const ROOT_PAGE: u32 = 0;

/// Hard limit on key length; keeps two entries per page possible so splits
/// always make progress.
pub const MAX_KEY_SIZE: usize = 10 * 1024;

/// Buckets at or above this entry count search a window around the median
/// for the split point with the shortest separator.
const SPLIT_WINDOW_THRESHOLD: usize = 100;

/// What an [`PrefixTree::update`] callback wants done with the key.
pub enum UpdateAction {
    Change(Vec<u8>),
    Remove,
    Nothing,
}

/// A validator may veto a change; the tree then stays untouched and the
/// operation reports false.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidatorResult {
    Accept,
    Ignore,
}

/// Validation hook: `(key, old_value, new_value)`.
pub type Validator<'v> = &'v dyn Fn(&str, Option<&[u8]>, &[u8]) -> ValidatorResult;

struct UpdatePath {
    pages: SmallVec<[u32; 8]>,
    lefts: SmallVec<[Option<String>; 8]>,
    rights: SmallVec<[Option<String>; 8]>,
    leaf_search: SearchResult,
}

enum SplitExtract {
    Leaf(Vec<LeafEntry>),
    Node(Vec<NodeEntry>),
}

impl SplitExtract {
    fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf(_))
    }

    fn keys(&self) -> Vec<&String> {
        match self {
            Self::Leaf(entries) => entries.iter().map(|e| &e.key).collect(),
            Self::Node(entries) => entries.iter().map(|e| &e.key).collect(),
        }
    }

    fn encode_range(
        &self,
        range: std::ops::Range<usize>,
        prefix: &str,
    ) -> Result<Vec<Vec<u8>>> {
        match self {
            Self::Leaf(entries) => entries[range]
                .iter()
                .map(|entry| encode_leaf_entry(entry, prefix))
                .collect(),
            Self::Node(entries) => entries[range]
                .iter()
                .map(|entry| encode_node_entry(entry, prefix))
                .collect(),
        }
    }
}

/// Split-point selection: median for small buckets, otherwise the index in
/// a +-5% window whose separator is shortest.
fn choose_split_point(is_leaf: bool, keys: &[&String]) -> (usize, String) {
    let size = keys.len();
    let median = size >> 1;

    if size < SPLIT_WINDOW_THRESHOLD {
        let separator = if is_leaf {
            if median > 0 {
                min_separation_key(keys[median - 1], keys[median])
            } else {
                keys[median].clone()
            }
        } else {
            keys[median].clone()
        };
        return (median, separator);
    }

    let diff = (size / 10) / 2;
    let start = median - diff;
    let end = median + diff + 1;

    if is_leaf {
        let mut best_index = start;
        let mut best_key = min_separation_key(keys[start - 1], keys[start]);

        for i in start + 1..end {
            let candidate = min_separation_key(keys[i - 1], keys[i]);
            if candidate.chars().count() < best_key.chars().count() {
                best_key = candidate;
                best_index = i;
            }
        }
        (best_index, best_key)
    } else {
        let mut best_index = start;
        for i in start + 1..end {
            if keys[i].chars().count() < keys[best_index].chars().count() {
                best_index = i;
            }
        }
        (best_index, keys[best_index].clone())
    }
}

pub struct PrefixTree {
    engine: Arc<Engine>,
    name: String,
    file_id: u32,
    null_file_id: Option<u32>,
    cipher: Option<Arc<dyn EntryCipher>>,
    lock: RwLock<()>,
}

impl PrefixTree {
    /// Creates the tree's files: the data file with an empty leaf root and,
    /// with `null_support`, the single-page null-bucket file.
    pub fn create(
        engine: Arc<Engine>,
        name: &str,
        null_support: bool,
        cipher: Option<Arc<dyn EntryCipher>>,
    ) -> Result<Self> {
        let data_name = format!("{}{}", name, PREFIX_TREE_EXTENSION);
        let null_name = format!("{}{}", name, NULL_BUCKET_EXTENSION);

        let (file_id, null_file_id) = engine.atomic().run_atomic(name, |atomic| {
            let file_id = engine.add_file(&data_name, atomic)?;
            let (mut root, index) = engine.add_page(file_id)?;
            debug_assert_eq!(index, ROOT_PAGE);
            PrefixBucketMut::new(&mut root).init(true, "");
            engine.release_page(root, atomic)?;

            let null_file_id = if null_support {
                let null_file_id = engine.add_file(&null_name, atomic)?;
                let (page, _) = engine.add_page(null_file_id)?;
                engine.release_page(page, atomic)?;
                Some(null_file_id)
            } else {
                None
            };
            Ok((file_id, null_file_id))
        })?;

        trace!(name, "created prefix tree");
        Ok(Self {
            engine,
            name: name.to_string(),
            file_id,
            null_file_id,
            cipher,
            lock: RwLock::new(()),
        })
    }

    /// Opens an existing tree; null support is detected from the presence
    /// of the null-bucket file.
    pub fn open(
        engine: Arc<Engine>,
        name: &str,
        cipher: Option<Arc<dyn EntryCipher>>,
    ) -> Result<Self> {
        let data_name = format!("{}{}", name, PREFIX_TREE_EXTENSION);
        let null_name = format!("{}{}", name, NULL_BUCKET_EXTENSION);

        let file_id = engine.open_file(&data_name)?;
        ensure!(
            engine.filled_up_to(file_id)? > 0,
            "prefix tree '{}' has no root page",
            name
        );

        let null_file_id = if engine.file_exists(&null_name) {
            Some(engine.open_file(&null_name)?)
        } else {
            None
        };

        Ok(Self {
            engine,
            name: name.to_string(),
            file_id,
            null_file_id,
            cipher,
            lock: RwLock::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn null_support(&self) -> bool {
        self.null_file_id.is_some()
    }

    // ---- reads ----------------------------------------------------------

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let _guard = self.lock.read();
        let _file = self.engine.file_locks().shared(self.file_id);

        let (leaf_page, result) = self.find_leaf(key)?;
        let index = match result {
            SearchResult::Found(index) => index,
            SearchResult::NotFound(_) => return Ok(None),
        };

        let value = {
            let view = self.engine.load_for_read(self.file_id, leaf_page)?;
            PrefixBucket::new(&view).value_at(index)?
        };
        Ok(Some(self.decode_value(&value)?))
    }

    pub fn contains_key(&self, key: &str) -> Result<bool> {
        let _guard = self.lock.read();
        let _file = self.engine.file_locks().shared(self.file_id);
        let (_, result) = self.find_leaf(key)?;
        Ok(result.found())
    }

    pub fn size(&self) -> Result<u64> {
        let _guard = self.lock.read();
        let view = self.engine.load_for_read(self.file_id, ROOT_PAGE)?;
        Ok(PrefixBucket::new(&view).tree_size())
    }

    pub fn first_key(&self) -> Result<Option<String>> {
        let mut cursor = KeyCursor::new(TreeCursor::full(self, true));
        cursor.next()
    }

    pub fn last_key(&self) -> Result<Option<String>> {
        let mut cursor = KeyCursor::new(TreeCursor::full(self, false));
        cursor.next()
    }

    // ---- cursors --------------------------------------------------------

    /// Entries between the bounds, per the inclusive flags.
    pub fn iterate_entries_between(
        &self,
        key_from: &str,
        from_inclusive: bool,
        key_to: &str,
        to_inclusive: bool,
        ascending: bool,
    ) -> TreeCursor<'_> {
        TreeCursor::new(
            self,
            ascending,
            Some((key_from.to_string(), from_inclusive)),
            Some((key_to.to_string(), to_inclusive)),
        )
    }

    /// Entries with key >= (or >) `key_from`.
    pub fn iterate_entries_major(
        &self,
        key_from: &str,
        inclusive: bool,
        ascending: bool,
    ) -> TreeCursor<'_> {
        TreeCursor::new(
            self,
            ascending,
            Some((key_from.to_string(), inclusive)),
            None,
        )
    }

    /// Entries with key <= (or <) `key_to`.
    pub fn iterate_entries_minor(
        &self,
        key_to: &str,
        inclusive: bool,
        ascending: bool,
    ) -> TreeCursor<'_> {
        TreeCursor::new(self, ascending, None, Some((key_to.to_string(), inclusive)))
    }

    /// All keys in ascending order.
    pub fn key_cursor(&self) -> KeyCursor<'_> {
        KeyCursor::new(TreeCursor::full(self, true))
    }

    // ---- writes ---------------------------------------------------------

    pub fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.validated_put(key, value, None).map(|_| ())
    }

    /// Inserts or replaces, unless the validator vetoes. Returns false on a
    /// veto, leaving the tree untouched.
    pub fn validated_put(
        &self,
        key: &str,
        value: &[u8],
        validator: Option<Validator<'_>>,
    ) -> Result<bool> {
        ensure!(
            key.len() <= MAX_KEY_SIZE,
            "key of {} bytes exceeds the {} byte limit",
            key.len(),
            MAX_KEY_SIZE
        );

        let _guard = self.lock.write();
        let _file = self.engine.file_locks().exclusive(self.file_id);

        self.engine.atomic().run_atomic(&self.name, |atomic| {
            // Validation happens before any mutation so a veto is free.
            if let Some(validator) = validator {
                let old = self.read_current_value(key)?;
                if validator(key, old.as_deref(), value) == ValidatorResult::Ignore {
                    return Ok(false);
                }
            }

            let leaf_value = self.encode_value(value, atomic)?;
            self.upsert(key, &leaf_value, atomic)?;
            Ok(true)
        })
    }

    /// Reads the current value, hands it to `updater` and applies the
    /// returned action. Returns false when nothing changed.
    pub fn update(
        &self,
        key: &str,
        updater: &dyn Fn(Option<&[u8]>) -> UpdateAction,
        validator: Option<Validator<'_>>,
    ) -> Result<bool> {
        ensure!(
            key.len() <= MAX_KEY_SIZE,
            "key of {} bytes exceeds the {} byte limit",
            key.len(),
            MAX_KEY_SIZE
        );

        let _guard = self.lock.write();
        let _file = self.engine.file_locks().exclusive(self.file_id);

        self.engine.atomic().run_atomic(&self.name, |atomic| {
            let old = self.read_current_value(key)?;

            match updater(old.as_deref()) {
                UpdateAction::Nothing => Ok(false),
                UpdateAction::Remove => Ok(self.remove_entry(key, atomic)?.is_some()),
                UpdateAction::Change(new_value) => {
                    if let Some(validator) = validator {
                        if validator(key, old.as_deref(), &new_value) == ValidatorResult::Ignore {
                            return Ok(false);
                        }
                    }
                    let leaf_value = self.encode_value(&new_value, atomic)?;
                    self.upsert(key, &leaf_value, atomic)?;
                    Ok(true)
                }
            }
        })
    }

    /// Removes the key, returning its previous value.
    pub fn remove(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let _guard = self.lock.write();
        let _file = self.engine.file_locks().exclusive(self.file_id);

        self.engine
            .atomic()
            .run_atomic(&self.name, |atomic| self.remove_entry(key, atomic))
    }

    /// Drops every entry, resetting the tree to an empty leaf root.
    pub fn clear(&self) -> Result<()> {
        let _guard = self.lock.write();
        let _file = self.engine.file_locks().exclusive(self.file_id);

        self.engine.atomic().run_atomic(&self.name, |atomic| {
            self.engine.truncate_file(self.file_id)?;
            let (mut root, index) = self.engine.add_page(self.file_id)?;
            debug_assert_eq!(index, ROOT_PAGE);
            PrefixBucketMut::new(&mut root).init(true, "");
            self.engine.release_page(root, atomic)?;

            if let Some(null_file_id) = self.null_file_id {
                self.engine.truncate_file(null_file_id)?;
                let (page, _) = self.engine.add_page(null_file_id)?;
                self.engine.release_page(page, atomic)?;
            }
            Ok(())
        })
    }

    /// Deletes the tree's files.
    pub fn delete(self) -> Result<()> {
        let _guard = self.lock.write();
        let _file = self.engine.file_locks().exclusive(self.file_id);

        self.engine.atomic().run_atomic(&self.name, |atomic| {
            self.engine.delete_file(self.file_id, atomic)?;
            if let Some(null_file_id) = self.null_file_id {
                self.engine.delete_file(null_file_id, atomic)?;
            }
            Ok(())
        })
    }

    // ---- null key -------------------------------------------------------

    fn null_file(&self) -> Result<u32> {
        match self.null_file_id {
            Some(file_id) => Ok(file_id),
            None => bail!("null keys are not supported by index '{}'", self.name),
        }
    }

    pub fn get_null(&self) -> Result<Option<Vec<u8>>> {
        let null_file_id = self.null_file()?;
        let _guard = self.lock.read();

        let stored = {
            let view = self.engine.load_for_read(null_file_id, 0)?;
            null_bucket::NullBucket::new(&view).get()
        };
        match stored {
            Some(bytes) => Ok(Some(self.decrypt(bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_null(&self, value: &[u8]) -> Result<()> {
        let null_file_id = self.null_file()?;
        let _guard = self.lock.write();

        let stored = self.encrypt(value);
        ensure!(
            null_bucket::VALUE_OFFSET + stored.len() <= crate::config::PAGE_SIZE,
            "null-key value of {} bytes does not fit its bucket",
            stored.len()
        );

        self.engine.atomic().run_atomic(&self.name, |atomic| {
            let mut page = self.engine.load_for_write(null_file_id, 0)?;
            let was_present = {
                let mut bucket = null_bucket::NullBucketMut::new(&mut page);
                let was_present = bucket.get().is_some();
                bucket.set(&stored);
                was_present
            };
            self.engine.release_page(page, atomic)?;

            if !was_present {
                self.update_size(1, atomic)?;
            }
            Ok(())
        })
    }

    pub fn remove_null(&self) -> Result<Option<Vec<u8>>> {
        let null_file_id = self.null_file()?;
        let _guard = self.lock.write();

        self.engine.atomic().run_atomic(&self.name, |atomic| {
            let mut page = self.engine.load_for_write(null_file_id, 0)?;
            let previous = null_bucket::NullBucketMut::new(&mut page).remove();
            self.engine.release_page(page, atomic)?;

            match previous {
                Some(bytes) => {
                    self.update_size(-1, atomic)?;
                    Ok(Some(self.decrypt(bytes)?))
                }
                None => Ok(None),
            }
        })
    }

    // ---- value encoding -------------------------------------------------

    fn encrypt(&self, value: &[u8]) -> Vec<u8> {
        match &self.cipher {
            Some(cipher) => cipher.encrypt(value),
            None => value.to_vec(),
        }
    }

    fn decrypt(&self, stored: Vec<u8>) -> Result<Vec<u8>> {
        match &self.cipher {
            Some(cipher) => cipher.decrypt(&stored),
            None => Ok(stored),
        }
    }

    fn encode_value(&self, value: &[u8], atomic: &AtomicHandle) -> Result<LeafValue> {
        let stored = self.encrypt(value);
        if stored.len() <= self.engine.config().max_embedded_value_size {
            Ok(LeafValue::Embedded(stored))
        } else {
            let head = value_page::write_chain(&self.engine, self.file_id, &stored, atomic)?;
            Ok(LeafValue::Linked(head))
        }
    }

    pub(crate) fn decode_value(&self, value: &LeafValue) -> Result<Vec<u8>> {
        let stored = match value {
            LeafValue::Embedded(bytes) => bytes.clone(),
            LeafValue::Linked(head) => value_page::read_chain(&self.engine, self.file_id, *head)?,
        };
        self.decrypt(stored)
    }

    fn read_current_value(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let (leaf_page, result) = self.find_leaf(key)?;
        let index = match result {
            SearchResult::Found(index) => index,
            SearchResult::NotFound(_) => return Ok(None),
        };
        let value = {
            let view = self.engine.load_for_read(self.file_id, leaf_page)?;
            PrefixBucket::new(&view).value_at(index)?
        };
        Ok(Some(self.decode_value(&value)?))
    }

    // ---- descent --------------------------------------------------------

    fn corruption_guard(&self, depth: usize) -> Result<()> {
        ensure!(
            depth <= self.engine.config().max_path_length,
            "reached max depth without finding a leaf; index '{}' is corrupted and must be rebuilt",
            self.name
        );
        Ok(())
    }

    fn find_leaf(&self, key: &str) -> Result<(u32, SearchResult)> {
        let mut page_index = ROOT_PAGE;
        let mut depth = 0;

        loop {
            self.corruption_guard(depth)?;
            depth += 1;

            let view = self.engine.load_for_read(self.file_id, page_index)?;
            let bucket = PrefixBucket::new(&view);
            let result = bucket.find(key);

            if bucket.is_leaf() {
                return Ok((page_index, result));
            }

            page_index = match result {
                SearchResult::Found(index) => bucket.children_at(index).1,
                SearchResult::NotFound(0) => bucket.children_at(0).0,
                SearchResult::NotFound(index) => bucket.children_at(index - 1).1,
            };
        }
    }

    /// Descent collecting the path and the per-level boundary keys implied
    /// by the parent's neighbor entries. `stop_page` ends the descent at a
    /// specific bucket (used to locate the bucket to split); `None` descends
    /// to the leaf.
    fn find_bucket_for_update(&self, key: &str, stop_page: Option<u32>) -> Result<UpdatePath> {
        let mut pages: SmallVec<[u32; 8]> = SmallVec::new();
        let mut lefts: SmallVec<[Option<String>; 8]> = SmallVec::new();
        let mut rights: SmallVec<[Option<String>; 8]> = SmallVec::new();

        let mut page_index = ROOT_PAGE;
        lefts.push(None);
        rights.push(None);

        loop {
            self.corruption_guard(pages.len())?;
            pages.push(page_index);

            if stop_page == Some(page_index) {
                return Ok(UpdatePath {
                    pages,
                    lefts,
                    rights,
                    leaf_search: SearchResult::NotFound(0),
                });
            }

            let view = self.engine.load_for_read(self.file_id, page_index)?;
            let bucket = PrefixBucket::new(&view);
            let result = bucket.find(key);

            if bucket.is_leaf() {
                return Ok(UpdatePath {
                    pages,
                    lefts,
                    rights,
                    leaf_search: result,
                });
            }

            let size = bucket.size();
            let (child, left, right) = match result {
                SearchResult::Found(index) => {
                    let entry = bucket.node_entry(index);
                    let right = if index + 1 < size {
                        Some(bucket.key_at(index + 1))
                    } else {
                        rights.last().cloned().flatten()
                    };
                    (entry.right, Some(entry.key), right)
                }
                SearchResult::NotFound(0) => {
                    let entry = bucket.node_entry(0);
                    (entry.left, lefts.last().cloned().flatten(), Some(entry.key))
                }
                SearchResult::NotFound(index) => {
                    let entry = bucket.node_entry(index - 1);
                    let right = if index < size {
                        Some(bucket.key_at(index))
                    } else {
                        rights.last().cloned().flatten()
                    };
                    (entry.right, Some(entry.key), right)
                }
            };

            lefts.push(left);
            rights.push(right);
            page_index = child;
        }
    }

    // ---- insert / remove ------------------------------------------------

    /// Inserts or replaces `key` with an already-encoded leaf value,
    /// splitting as needed.
    fn upsert(&self, key: &str, leaf_value: &LeafValue, atomic: &AtomicHandle) -> Result<()> {
        loop {
            let path = self.find_bucket_for_update(key, None)?;
            let leaf_page = *path.pages.last().unwrap(); // INVARIANT: descent always yields at least the root

            match path.leaf_search {
                SearchResult::Found(index) => {
                    let mut page = self.engine.load_for_write(self.file_id, leaf_page)?;
                    let updated =
                        PrefixBucketMut::new(&mut page).update_value(index, leaf_value)?;
                    self.engine.release_page(page, atomic)?;
                    if updated {
                        return Ok(());
                    }
                }
                SearchResult::NotFound(index) => {
                    let mut page = self.engine.load_for_write(self.file_id, leaf_page)?;
                    let inserted = {
                        let mut leaf = PrefixBucketMut::new(&mut page);
                        let entry = LeafEntry {
                            key: key.to_string(),
                            value: leaf_value.clone(),
                        };
                        let raw = encode_leaf_entry(&entry, &leaf.prefix())?;
                        leaf.insert_raw(index, &raw)
                    };
                    self.engine.release_page(page, atomic)?;
                    if inserted {
                        self.update_size(1, atomic)?;
                        return Ok(());
                    }
                }
            }

            self.split_bucket(leaf_page, key, atomic)?;
        }
    }

    fn remove_entry(&self, key: &str, atomic: &AtomicHandle) -> Result<Option<Vec<u8>>> {
        let (leaf_page, result) = self.find_leaf(key)?;
        let index = match result {
            SearchResult::Found(index) => index,
            SearchResult::NotFound(_) => return Ok(None),
        };

        let mut page = self.engine.load_for_write(self.file_id, leaf_page)?;
        let value = {
            let mut leaf = PrefixBucketMut::new(&mut page);
            let value = leaf.value_at(index)?;
            leaf.remove_at(index)?;
            value
        };
        self.engine.release_page(page, atomic)?;

        self.update_size(-1, atomic)?;
        Ok(Some(self.decode_value(&value)?))
    }

    fn update_size(&self, delta: i64, atomic: &AtomicHandle) -> Result<()> {
        let mut page = self.engine.load_for_write(self.file_id, ROOT_PAGE)?;
        {
            let mut root = PrefixBucketMut::new(&mut page);
            let size = root.tree_size();
            root.set_tree_size(size.wrapping_add(delta as u64));
        }
        self.engine.release_page(page, atomic)
    }

    // ---- split ----------------------------------------------------------

    /// Page whose routed child for `key` is `child_page`; the true parent
    /// of that bucket at the time of the call. Splits deepen the tree, so
    /// parents are re-located by identity, never by remembered depth.
    fn find_parent_of(&self, key: &str, child_page: u32) -> Result<u32> {
        let mut page_index = ROOT_PAGE;
        let mut depth = 0;

        loop {
            self.corruption_guard(depth)?;
            depth += 1;

            let view = self.engine.load_for_read(self.file_id, page_index)?;
            let bucket = PrefixBucket::new(&view);
            ensure!(
                !bucket.is_leaf(),
                "no parent bucket routes to page {} in index '{}'",
                child_page,
                self.name
            );

            let child = match bucket.find(key) {
                SearchResult::Found(index) => bucket.children_at(index).1,
                SearchResult::NotFound(0) => bucket.children_at(0).0,
                SearchResult::NotFound(index) => bucket.children_at(index - 1).1,
            };
            if child == child_page {
                return Ok(page_index);
            }
            page_index = child;
        }
    }

    /// Splits the bucket at `page_index` (reached by routing `route_key`),
    /// recursing into parents as separator insertions overflow them.
    fn split_bucket(&self, page_index: u32, route_key: &str, atomic: &AtomicHandle) -> Result<()> {
        let path = self.find_bucket_for_update(route_key, Some(page_index))?;
        ensure!(
            *path.pages.last().unwrap() == page_index, // INVARIANT: descent pushes at least the root
            "bucket {} left the path of its routing key in index '{}'",
            page_index,
            self.name
        );

        let (extract, tree_size) = {
            let view = self.engine.load_for_read(self.file_id, page_index)?;
            let bucket = PrefixBucket::new(&view);
            let size = bucket.size();
            ensure!(size >= 2, "cannot split bucket with {} entries", size);

            let extract = if bucket.is_leaf() {
                SplitExtract::Leaf(
                    (0..size)
                        .map(|i| bucket.leaf_entry(i))
                        .collect::<Result<Vec<_>>>()?,
                )
            } else {
                SplitExtract::Node((0..size).map(|i| bucket.node_entry(i)).collect())
            };
            (extract, bucket.tree_size())
        };

        let keys = extract.keys();
        let (split_index, separator) = choose_split_point(extract.is_leaf(), &keys);
        drop(keys);

        trace!(page_index, split_index, separator = %separator, "splitting prefix bucket");

        if page_index == ROOT_PAGE {
            self.split_root(&extract, split_index, &separator, tree_size, atomic)
        } else {
            let level = path.pages.len() - 1;
            self.split_non_root(
                page_index,
                &extract,
                split_index,
                &separator,
                path.lefts[level].as_deref(),
                path.rights[level].as_deref(),
                atomic,
            )
        }
    }

    fn split_root(
        &self,
        extract: &SplitExtract,
        split_index: usize,
        separator: &str,
        tree_size: u64,
        atomic: &AtomicHandle,
    ) -> Result<()> {
        let is_leaf = extract.is_leaf();
        let size = extract.keys().len();
        let start_right = if is_leaf { split_index } else { split_index + 1 };

        let left_raw = extract.encode_range(0..split_index, "")?;
        let right_raw = extract.encode_range(start_right..size, "")?;

        let (mut left_page, left_index) = self.engine.add_page(self.file_id)?;
        {
            let mut left = PrefixBucketMut::new(&mut left_page);
            left.init(is_leaf, "");
            left.set_raw_entries("", &left_raw)?;
        }
        self.engine.release_page(left_page, atomic)?;

        let (mut right_page, right_index) = self.engine.add_page(self.file_id)?;
        {
            let mut right = PrefixBucketMut::new(&mut right_page);
            right.init(is_leaf, "");
            right.set_raw_entries("", &right_raw)?;
        }
        self.engine.release_page(right_page, atomic)?;

        let mut root_page = self.engine.load_for_write(self.file_id, ROOT_PAGE)?;
        {
            let mut root = PrefixBucketMut::new(&mut root_page);
            root.init(false, "");
            root.set_tree_size(tree_size);
            let entry = NodeEntry {
                left: left_index,
                right: right_index,
                key: separator.to_string(),
            };
            let raw = encode_node_entry(&entry, "")?;
            ensure!(
                root.insert_raw(0, &raw),
                "root separator does not fit an empty bucket"
            );
        }
        self.engine.release_page(root_page, atomic)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn split_non_root(
        &self,
        page_index: u32,
        extract: &SplitExtract,
        split_index: usize,
        separator: &str,
        left_boundary: Option<&str>,
        right_boundary: Option<&str>,
        atomic: &AtomicHandle,
    ) -> Result<()> {
        let is_leaf = extract.is_leaf();
        let size = extract.keys().len();
        let start_right = if is_leaf { split_index } else { split_index + 1 };

        let left_prefix = match left_boundary {
            Some(boundary) => common_prefix(boundary, separator),
            None => String::new(),
        };
        let right_prefix = match right_boundary {
            Some(boundary) => common_prefix(separator, boundary),
            None => String::new(),
        };

        let left_raw = extract.encode_range(0..split_index, &left_prefix)?;
        let right_raw = extract.encode_range(start_right..size, &right_prefix)?;

        let (mut right_page, right_index) = self.engine.add_page(self.file_id)?;
        {
            let mut right = PrefixBucketMut::new(&mut right_page);
            right.init(is_leaf, &right_prefix);
            right.set_raw_entries(&right_prefix, &right_raw)?;
        }
        self.engine.release_page(right_page, atomic)?;

        {
            let mut page = self.engine.load_for_write(self.file_id, page_index)?;
            {
                let mut left = PrefixBucketMut::new(&mut page);
                left.init(is_leaf, &left_prefix);
                left.set_raw_entries(&left_prefix, &left_raw)?;
            }
            self.engine.release_page(page, atomic)?;
        }

        // Insert the separator into the parent, splitting it first when it
        // does not fit; the parent is re-located after every split because
        // a recursive root split shifts every bucket one level down.
        loop {
            let parent_index = self.find_parent_of(separator, page_index)?;

            let mut page = self.engine.load_for_write(self.file_id, parent_index)?;
            let inserted = {
                let mut parent = PrefixBucketMut::new(&mut page);
                let result = parent.find(separator);
                ensure!(
                    !result.found(),
                    "separator key '{}' already present in parent bucket",
                    separator
                );
                let index = result.index();
                let entry = NodeEntry {
                    left: page_index,
                    right: right_index,
                    key: separator.to_string(),
                };
                let raw = encode_node_entry(&entry, &parent.prefix())?;
                if parent.insert_raw(index, &raw) {
                    // Adjacent entries share the child between their keys.
                    let parent_size = parent.size();
                    if index + 1 < parent_size {
                        parent.set_child_at(index + 1, true, right_index);
                    }
                    if index > 0 {
                        parent.set_child_at(index - 1, false, page_index);
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
            self.split_bucket(parent_index, separator, atomic)?;
        }
    }

    // ---- cursor support -------------------------------------------------

    pub(crate) fn engine(&self) -> &Engine {
        &self.engine
    }

    pub(crate) fn file_id(&self) -> u32 {
        self.file_id
    }

    pub(crate) fn read_lock(&self) -> parking_lot::RwLockReadGuard<'_, ()> {
        self.lock.read()
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

    fn make_tree(engine: Arc<Engine>, name: &str) -> PrefixTree {
        PrefixTree::create(engine, name, false, None).unwrap()
    }

    #[test]
    fn put_get_remove_roundtrip() {
        let (_dir, engine) = setup();
        let tree = make_tree(engine, "accounts");

        tree.put("alice", b"1").unwrap();
        tree.put("bob", b"2").unwrap();
        assert_eq!(tree.get("alice").unwrap(), Some(b"1".to_vec()));
        assert_eq!(tree.get("bob").unwrap(), Some(b"2".to_vec()));
        assert_eq!(tree.get("carol").unwrap(), None);
        assert_eq!(tree.size().unwrap(), 2);

        tree.put("alice", b"updated").unwrap();
        assert_eq!(tree.get("alice").unwrap(), Some(b"updated".to_vec()));
        assert_eq!(tree.size().unwrap(), 2);

        assert_eq!(tree.remove("alice").unwrap(), Some(b"updated".to_vec()));
        assert_eq!(tree.remove("alice").unwrap(), None);
        assert_eq!(tree.get("alice").unwrap(), None);
        assert_eq!(tree.size().unwrap(), 1);
    }

    #[test]
    fn shared_prefix_keys_and_range_cursor() {
        let (_dir, engine) = setup();
        let tree = make_tree(engine, "accounts");

        let keys = ["a", "ab", "abc", "abd", "abe", "abf"];
        for (i, key) in keys.iter().enumerate() {
            tree.put(key, &[(i + 1) as u8]).unwrap();
        }

        assert_eq!(tree.get("abd").unwrap(), Some(vec![4]));

        let mut cursor = tree.iterate_entries_between("ab", true, "abe", true, true);
        let mut collected = Vec::new();
        while let Some((key, value)) = cursor.next().unwrap() {
            collected.push((key, value[0]));
        }
        assert_eq!(
            collected,
            vec![
                ("ab".to_string(), 2),
                ("abc".to_string(), 3),
                ("abd".to_string(), 4),
                ("abe".to_string(), 5),
            ]
        );
    }

    #[test]
    fn thousands_of_keys_survive_splits() {
        let (_dir, engine) = setup();
        let tree = make_tree(Arc::clone(&engine), "accounts");

        // Long shared prefixes force prefix compression to matter; enough
        // keys force multi-level splits.
        for i in 0..2000u32 {
            let key = format!("tenant/alpha/record/{:08}", i);
            tree.put(&key, &i.to_le_bytes()).unwrap();
        }

        assert_eq!(tree.size().unwrap(), 2000);
        assert!(engine.filled_up_to(tree.file_id()).unwrap() > 1);

        for i in (0..2000u32).step_by(97) {
            let key = format!("tenant/alpha/record/{:08}", i);
            assert_eq!(tree.get(&key).unwrap(), Some(i.to_le_bytes().to_vec()));
        }
        assert_eq!(tree.get("tenant/alpha/record/99999999").unwrap(), None);
    }

    #[test]
    fn bucket_prefix_invariant_holds_after_splits() {
        let (_dir, engine) = setup();
        let tree = make_tree(Arc::clone(&engine), "accounts");

        for i in 0..5000u32 {
            let key = format!("k{:06}", i);
            tree.put(&key, b"v").unwrap();
        }
        assert!(
            engine.filled_up_to(tree.file_id()).unwrap() > 2,
            "expected the tree to have split"
        );

        // Every bucket's keys start with the bucket's stored prefix, and
        // internal entries order their children correctly.
        let pages = engine.filled_up_to(tree.file_id()).unwrap();
        for page_index in 0..pages {
            let view = engine.load_for_read(tree.file_id(), page_index).unwrap();
            let bucket = PrefixBucket::new(&view);
            let prefix = bucket.prefix();
            for i in 0..bucket.size() {
                let key = bucket.key_at(i);
                assert!(
                    key.starts_with(&prefix),
                    "page {} key '{}' outside prefix '{}'",
                    page_index,
                    key,
                    prefix
                );
                if i > 0 {
                    assert!(bucket.key_at(i - 1) < key, "unsorted keys in page {}", page_index);
                }
            }
        }
    }

    #[test]
    fn full_cursor_visits_keys_in_order() {
        let (_dir, engine) = setup();
        let tree = make_tree(engine, "accounts");

        let mut expected = Vec::new();
        for i in (0..500u32).rev() {
            let key = format!("key{:05}", i);
            tree.put(&key, b"x").unwrap();
            expected.push(key);
        }
        expected.sort();

        let mut cursor = tree.key_cursor();
        let mut seen = Vec::new();
        while let Some(key) = cursor.next().unwrap() {
            seen.push(key);
        }
        assert_eq!(seen, expected);
        assert_eq!(seen.len() as u64, tree.size().unwrap());
    }

    #[test]
    fn descending_cursor_mirrors_ascending() {
        let (_dir, engine) = setup();
        let tree = make_tree(engine, "accounts");

        for key in ["a", "b", "c", "d", "e"] {
            tree.put(key, key.as_bytes()).unwrap();
        }

        let mut cursor = tree.iterate_entries_between("b", true, "d", true, false);
        let mut seen = Vec::new();
        while let Some((key, _)) = cursor.next().unwrap() {
            seen.push(key);
        }
        assert_eq!(seen, vec!["d", "c", "b"]);

        let mut cursor = tree.iterate_entries_minor("c", false, false);
        let mut seen = Vec::new();
        while let Some((key, _)) = cursor.next().unwrap() {
            seen.push(key);
        }
        assert_eq!(seen, vec!["b", "a"]);

        let mut cursor = tree.iterate_entries_major("c", false, true);
        let mut seen = Vec::new();
        while let Some((key, _)) = cursor.next().unwrap() {
            seen.push(key);
        }
        assert_eq!(seen, vec!["d", "e"]);
    }

    #[test]
    fn first_and_last_key() {
        let (_dir, engine) = setup();
        let tree = make_tree(engine, "accounts");

        assert_eq!(tree.first_key().unwrap(), None);
        assert_eq!(tree.last_key().unwrap(), None);

        for key in ["mango", "apple", "zucchini", "kiwi"] {
            tree.put(key, b"x").unwrap();
        }
        assert_eq!(tree.first_key().unwrap(), Some("apple".to_string()));
        assert_eq!(tree.last_key().unwrap(), Some("zucchini".to_string()));
    }

    #[test]
    fn large_values_roundtrip_through_chains() {
        let (_dir, engine) = setup();
        let tree = make_tree(Arc::clone(&engine), "accounts");

        let large: Vec<u8> = (0..200_000).map(|i| (i % 253) as u8).collect();
        tree.put("big", &large).unwrap();
        tree.put("small", b"s").unwrap();

        assert_eq!(tree.get("big").unwrap(), Some(large.clone()));
        assert_eq!(tree.get("small").unwrap(), Some(b"s".to_vec()));

        // The value chain spans several pages.
        assert!(engine.filled_up_to(tree.file_id()).unwrap() >= 4);

        // Cursors decode linked values too.
        let mut cursor = tree.key_cursor();
        assert_eq!(cursor.next().unwrap(), Some("big".to_string()));
    }

    #[test]
    fn validator_veto_leaves_tree_unchanged() {
        let (_dir, engine) = setup();
        let tree = make_tree(engine, "accounts");
        tree.put("k", b"old").unwrap();

        let veto: Validator<'_> = &|_key, _old, _new| ValidatorResult::Ignore;
        let applied = tree.validated_put("k", b"new", Some(veto)).unwrap();
        assert!(!applied);
        assert_eq!(tree.get("k").unwrap(), Some(b"old".to_vec()));

        let accept: Validator<'_> = &|_key, old, _new| {
            assert_eq!(old, Some(b"old".as_slice()));
            ValidatorResult::Accept
        };
        let applied = tree.validated_put("k", b"new", Some(accept)).unwrap();
        assert!(applied);
        assert_eq!(tree.get("k").unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn update_applies_the_requested_action() {
        let (_dir, engine) = setup();
        let tree = make_tree(engine, "accounts");
        tree.put("counter", &0u64.to_le_bytes()).unwrap();

        let incremented = tree
            .update(
                "counter",
                &|old| {
                    let current = u64::from_le_bytes(old.unwrap().try_into().unwrap());
                    UpdateAction::Change((current + 1).to_le_bytes().to_vec())
                },
                None,
            )
            .unwrap();
        assert!(incremented);
        assert_eq!(
            tree.get("counter").unwrap(),
            Some(1u64.to_le_bytes().to_vec())
        );

        assert!(!tree.update("counter", &|_| UpdateAction::Nothing, None).unwrap());

        assert!(tree.update("counter", &|_| UpdateAction::Remove, None).unwrap());
        assert_eq!(tree.get("counter").unwrap(), None);
        assert!(!tree.update("counter", &|_| UpdateAction::Remove, None).unwrap());
    }

    #[test]
    fn null_key_needs_null_support() {
        let (_dir, engine) = setup();

        let plain = make_tree(Arc::clone(&engine), "plain");
        let result = plain.put_null(b"x");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("null keys"));

        let nullable = PrefixTree::create(engine, "nullable", true, None).unwrap();
        assert_eq!(nullable.get_null().unwrap(), None);
        nullable.put_null(b"null value").unwrap();
        assert_eq!(nullable.get_null().unwrap(), Some(b"null value".to_vec()));
        assert_eq!(nullable.size().unwrap(), 1);

        assert_eq!(nullable.remove_null().unwrap(), Some(b"null value".to_vec()));
        assert_eq!(nullable.get_null().unwrap(), None);
        assert_eq!(nullable.size().unwrap(), 0);
    }

    #[test]
    fn cipher_applies_to_stored_values() {
        use crate::crypto::{EntryCipher, PassthroughCipher};

        struct XorCipher;
        impl EntryCipher for XorCipher {
            fn encrypt(&self, plain: &[u8]) -> Vec<u8> {
                plain.iter().map(|b| b ^ 0x5A).collect()
            }
            fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>> {
                Ok(cipher.iter().map(|b| b ^ 0x5A).collect())
            }
        }

        let (_dir, engine) = setup();
        let tree =
            PrefixTree::create(Arc::clone(&engine), "secret", false, Some(Arc::new(XorCipher)))
                .unwrap();
        tree.put("k", b"plain").unwrap();
        assert_eq!(tree.get("k").unwrap(), Some(b"plain".to_vec()));

        let passthrough = PrefixTree::create(
            engine,
            "open",
            false,
            Some(Arc::new(PassthroughCipher)),
        )
        .unwrap();
        passthrough.put("k", b"plain").unwrap();
        assert_eq!(passthrough.get("k").unwrap(), Some(b"plain".to_vec()));
    }

    #[test]
    fn clear_resets_everything() {
        let (_dir, engine) = setup();
        let tree = make_tree(engine, "accounts");

        for i in 0..800u32 {
            tree.put(&format!("key{:05}", i), b"v").unwrap();
        }
        tree.clear().unwrap();

        assert_eq!(tree.size().unwrap(), 0);
        assert_eq!(tree.get("key00001").unwrap(), None);
        assert_eq!(tree.first_key().unwrap(), None);

        tree.put("fresh", b"x").unwrap();
        assert_eq!(tree.get("fresh").unwrap(), Some(b"x".to_vec()));
    }

    #[test]
    fn oversized_key_is_rejected() {
        let (_dir, engine) = setup();
        let tree = make_tree(engine, "accounts");

        let huge_key = "k".repeat(MAX_KEY_SIZE + 1);
        let result = tree.put(&huge_key, b"v");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("exceeds"));
        assert_eq!(tree.size().unwrap(), 0);
    }

    #[test]
    fn survives_reopen_through_recovery() {
        let dir = tempdir().unwrap();

        {
            let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
            let tree = make_tree(engine, "accounts");
            for i in 0..300u32 {
                tree.put(&format!("key{:05}", i), &i.to_le_bytes()).unwrap();
            }
        }

        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        let tree = PrefixTree::open(engine, "accounts", None).unwrap();
        assert_eq!(tree.size().unwrap(), 300);
        for i in (0..300u32).step_by(37) {
            assert_eq!(
                tree.get(&format!("key{:05}", i)).unwrap(),
                Some(i.to_le_bytes().to_vec())
            );
        }
    }
}
