//! # Prefix Bucket
//!
//! One page of the prefix B+-tree. Every key in a bucket shares the
//! bucket's prefix, which is stored once; entries store only the suffix.
//! Splits recompute the prefixes of both halves from the separator and the
//! bucket's parent boundaries, so prefixes lengthen as descent narrows.
//!
//! ## Layout (from `PAGE_DATA_OFFSET`)
//!
//! ```text
//! Offset  Size  Field
//! 16      1     flags          bit0 = leaf
//! 17      8     tree_size      root bucket only
//! 25      4     free_pointer   start of the entry-data tail
//! 29      4     size           entry count
//! 33      2     prefix_len
//! 35      *     prefix bytes
//! ...           offsets        u16 per entry, after the prefix
//! ...           free space
//! tail          entries        grow from the page end toward the offsets
//! ```
//!
//! Leaf entries: `suffix_len u16 | suffix | value_kind u8 | value`, where an
//! embedded value is `len u32 | bytes` and a linked one is the `u32` head
//! page of a value chain. Non-leaf entries: `left u32 | right u32 |
//! suffix_len u16 | suffix`.

use eyre::{bail, ensure, Result};

use crate::config::{PAGE_DATA_OFFSET, PAGE_SIZE};
use crate::storage::{DurablePage, PageView};

pub const FLAGS_OFFSET: usize = PAGE_DATA_OFFSET;
pub const TREE_SIZE_OFFSET: usize = FLAGS_OFFSET + 1;
pub const FREE_POINTER_OFFSET: usize = TREE_SIZE_OFFSET + 8;
pub const SIZE_OFFSET: usize = FREE_POINTER_OFFSET + 4;
pub const PREFIX_LEN_OFFSET: usize = SIZE_OFFSET + 4;
pub const PREFIX_OFFSET: usize = PREFIX_LEN_OFFSET + 2;

pub const LEAF_FLAG: u8 = 1;

const VALUE_EMBEDDED: u8 = 0;
const VALUE_LINKED: u8 = 1;

/// Sentinel child/page index meaning "none".
pub const NIL_PAGE: u32 = u32::MAX;

/// A leaf value, either embedded in the bucket or the head of a value-page
/// chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeafValue {
    Embedded(Vec<u8>),
    Linked(u32),
}

/// Decoded leaf entry with its full (prefix-restored) key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafEntry {
    pub key: String,
    pub value: LeafValue,
}

/// Decoded internal entry with its full key and child pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEntry {
    pub left: u32,
    pub right: u32,
    pub key: String,
}

/// Outcome of a key search within one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    Found(usize),
    NotFound(usize),
}

impl SearchResult {
    pub fn found(&self) -> bool {
        matches!(self, Self::Found(_))
    }

    pub fn index(&self) -> usize {
        match self {
            Self::Found(index) | Self::NotFound(index) => *index,
        }
    }
}

/// Longest prefix shared by every key in the half-open key range
/// `[key_one, key_two)`. Extends the plain common prefix by one character
/// when the right boundary is exactly the left boundary's character plus
/// one at its final position.
pub fn common_prefix(key_one: &str, key_two: &str) -> String {
    let one: Vec<char> = key_one.chars().collect();
    let two: Vec<char> = key_two.chars().collect();
    let common_len = one.len().min(two.len());

    let mut common_index: Option<usize> = None;
    let mut suffix = String::new();

    for i in 0..common_len {
        if one[i] == two[i] {
            common_index = Some(i);
        } else {
            if two[i] as u32 == one[i] as u32 + 1 && i == common_len - 1 && common_len == two.len()
            {
                suffix.push(one[i]);
            }
            break;
        }
    }

    match common_index {
        None => String::new(),
        Some(index) => {
            let mut prefix: String = one[..=index].iter().collect();
            prefix.push_str(&suffix);
            prefix
        }
    }
}

/// Shortest prefix of `key_right` that is strictly greater than `key_left`,
/// or `key_right` itself when `key_left` is a prefix of it.
pub fn min_separation_key(key_left: &str, key_right: &str) -> String {
    let left: Vec<char> = key_left.chars().collect();
    let right: Vec<char> = key_right.chars().collect();
    let min_len = left.len().min(right.len());

    for i in 0..min_len {
        if left[i] != right[i] {
            return right[..=i].iter().collect();
        }
    }

    if right.len() == min_len {
        key_right.to_string()
    } else {
        right[..=min_len].iter().collect()
    }
}

fn encode_value(value: &LeafValue, buf: &mut Vec<u8>) {
    match value {
        LeafValue::Embedded(bytes) => {
            buf.push(VALUE_EMBEDDED);
            buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            buf.extend_from_slice(bytes);
        }
        LeafValue::Linked(head_page) => {
            buf.push(VALUE_LINKED);
            buf.extend_from_slice(&head_page.to_le_bytes());
        }
    }
}

/// Serializes a leaf entry against `prefix`. The key must carry the prefix.
pub fn encode_leaf_entry(entry: &LeafEntry, prefix: &str) -> Result<Vec<u8>> {
    let suffix = entry
        .key
        .strip_prefix(prefix)
        .ok_or_else(|| eyre::eyre!("key does not start with bucket prefix '{}'", prefix))?;

    let mut buf = Vec::with_capacity(2 + suffix.len() + 16);
    buf.extend_from_slice(&(suffix.len() as u16).to_le_bytes());
    buf.extend_from_slice(suffix.as_bytes());
    encode_value(&entry.value, &mut buf);
    Ok(buf)
}

/// Serializes an internal entry against `prefix`.
pub fn encode_node_entry(entry: &NodeEntry, prefix: &str) -> Result<Vec<u8>> {
    let suffix = entry
        .key
        .strip_prefix(prefix)
        .ok_or_else(|| eyre::eyre!("key does not start with bucket prefix '{}'", prefix))?;

    let mut buf = Vec::with_capacity(10 + suffix.len());
    buf.extend_from_slice(&entry.left.to_le_bytes());
    buf.extend_from_slice(&entry.right.to_le_bytes());
    buf.extend_from_slice(&(suffix.len() as u16).to_le_bytes());
    buf.extend_from_slice(suffix.as_bytes());
    Ok(buf)
}

macro_rules! bucket_read_impl {
    () => {
        pub fn is_leaf(&self) -> bool {
            self.page.get_u8(FLAGS_OFFSET) & LEAF_FLAG != 0
        }

        pub fn size(&self) -> usize {
            self.page.get_u32(SIZE_OFFSET) as usize
        }

        pub fn tree_size(&self) -> u64 {
            self.page.get_u64(TREE_SIZE_OFFSET)
        }

        pub fn prefix(&self) -> String {
            let len = self.page.get_u16(PREFIX_LEN_OFFSET) as usize;
            String::from_utf8_lossy(self.page.get_bytes(PREFIX_OFFSET, len)).into_owned()
        }

        fn offsets_base(&self) -> usize {
            PREFIX_OFFSET + self.page.get_u16(PREFIX_LEN_OFFSET) as usize
        }

        fn free_pointer(&self) -> usize {
            self.page.get_u32(FREE_POINTER_OFFSET) as usize
        }

        fn entry_position(&self, index: usize) -> usize {
            self.page.get_u16(self.offsets_base() + index * 2) as usize
        }

        /// Key suffix stored at `index`.
        pub fn key_suffix(&self, index: usize) -> String {
            let mut position = self.entry_position(index);
            if !self.is_leaf() {
                position += 8;
            }
            let len = self.page.get_u16(position) as usize;
            String::from_utf8_lossy(self.page.get_bytes(position + 2, len)).into_owned()
        }

        /// Full key (prefix + suffix) at `index`.
        pub fn key_at(&self, index: usize) -> String {
            let mut key = self.prefix();
            key.push_str(&self.key_suffix(index));
            key
        }

        /// Leaf value at `index`.
        pub fn value_at(&self, index: usize) -> Result<LeafValue> {
            debug_assert!(self.is_leaf());
            let position = self.entry_position(index);
            let suffix_len = self.page.get_u16(position) as usize;
            let value_position = position + 2 + suffix_len;

            match self.page.get_u8(value_position) {
                VALUE_EMBEDDED => {
                    let len = self.page.get_u32(value_position + 1) as usize;
                    Ok(LeafValue::Embedded(
                        self.page.get_bytes(value_position + 5, len).to_vec(),
                    ))
                }
                VALUE_LINKED => Ok(LeafValue::Linked(self.page.get_u32(value_position + 1))),
                kind => bail!("unknown leaf value kind {}", kind),
            }
        }

        /// Child pages of the internal entry at `index`.
        pub fn children_at(&self, index: usize) -> (u32, u32) {
            debug_assert!(!self.is_leaf());
            let position = self.entry_position(index);
            (
                self.page.get_u32(position),
                self.page.get_u32(position + 4),
            )
        }

        /// Binary search for `key` over the full (prefix-restored) keys.
        pub fn find(&self, key: &str) -> SearchResult {
            let mut low = 0usize;
            let mut high = self.size();

            while low < high {
                let mid = (low + high) / 2;
                let mid_key = self.key_at(mid);
                match mid_key.as_str().cmp(key) {
                    std::cmp::Ordering::Less => low = mid + 1,
                    std::cmp::Ordering::Greater => high = mid,
                    std::cmp::Ordering::Equal => return SearchResult::Found(mid),
                }
            }
            SearchResult::NotFound(low)
        }

        /// Decodes the leaf entry at `index` with its full key.
        pub fn leaf_entry(&self, index: usize) -> Result<LeafEntry> {
            Ok(LeafEntry {
                key: self.key_at(index),
                value: self.value_at(index)?,
            })
        }

        /// Decodes the internal entry at `index` with its full key.
        pub fn node_entry(&self, index: usize) -> NodeEntry {
            let (left, right) = self.children_at(index);
            NodeEntry {
                left,
                right,
                key: self.key_at(index),
            }
        }
    };
}

/// Read-only bucket view.
pub struct PrefixBucket<'a, 'b> {
    page: &'b PageView<'a>,
}

impl<'a, 'b> PrefixBucket<'a, 'b> {
    pub fn new(page: &'b PageView<'a>) -> Self {
        Self { page }
    }

    bucket_read_impl!();
}

/// Mutable bucket view over a write-pinned durable page.
pub struct PrefixBucketMut<'a, 'b> {
    page: &'b mut DurablePage<'a>,
}

impl<'a, 'b> PrefixBucketMut<'a, 'b> {
    pub fn new(page: &'b mut DurablePage<'a>) -> Self {
        Self { page }
    }

    bucket_read_impl!();

    /// Initializes the bucket with a prefix, dropping all entries.
    pub fn init(&mut self, leaf: bool, prefix: &str) {
        self.page
            .set_u8(FLAGS_OFFSET, if leaf { LEAF_FLAG } else { 0 });
        self.page.set_u64(TREE_SIZE_OFFSET, 0);
        self.page.set_u32(FREE_POINTER_OFFSET, PAGE_SIZE as u32);
        self.page.set_u32(SIZE_OFFSET, 0);
        self.page
            .set_u16(PREFIX_LEN_OFFSET, prefix.len() as u16);
        if !prefix.is_empty() {
            self.page.set_bytes(PREFIX_OFFSET, prefix.as_bytes());
        }
    }

    pub fn set_tree_size(&mut self, size: u64) {
        self.page.set_u64(TREE_SIZE_OFFSET, size);
    }

    pub fn set_child_at(&mut self, index: usize, left: bool, child: u32) {
        debug_assert!(!self.is_leaf());
        let position = self.entry_position(index);
        let offset = if left { position } else { position + 4 };
        self.page.set_u32(offset, child);
    }

    /// Free bytes between the offset array and the entry tail.
    pub fn free_space(&self) -> usize {
        let offsets_end = self.offsets_base() + self.size() * 2;
        self.free_pointer().saturating_sub(offsets_end)
    }

    /// Inserts a serialized entry at `index`, returning false when the
    /// bucket cannot hold it.
    pub fn insert_raw(&mut self, index: usize, entry: &[u8]) -> bool {
        let size = self.size();
        debug_assert!(index <= size);

        let offsets_base = self.offsets_base();
        let offsets_end = offsets_base + size * 2;
        let free_pointer = self.free_pointer();
        if free_pointer < offsets_end + 2 + entry.len() {
            return false;
        }

        let data_offset = free_pointer - entry.len();
        self.page.set_bytes(data_offset, entry);
        self.page
            .set_u32(FREE_POINTER_OFFSET, data_offset as u32);

        if index < size {
            let tail_start = offsets_base + index * 2;
            let tail = self.page.get_bytes(tail_start, (size - index) * 2).to_vec();
            self.page.set_bytes(tail_start + 2, &tail);
        }
        self.page
            .set_u16(offsets_base + index * 2, data_offset as u16);
        self.page.set_u32(SIZE_OFFSET, (size + 1) as u32);
        true
    }

    /// Replaces the bucket's content: new prefix, entries re-encoded and
    /// tail-packed. Preserves the leaf flag and tree size.
    pub fn set_raw_entries(&mut self, prefix: &str, entries: &[Vec<u8>]) -> Result<()> {
        let total: usize = entries.iter().map(|e| e.len()).sum();
        let offsets_base = PREFIX_OFFSET + prefix.len();
        let offsets_end = offsets_base + entries.len() * 2;
        ensure!(
            offsets_end + total <= PAGE_SIZE,
            "entries exceed bucket capacity: {} bytes with {} entries",
            total,
            entries.len()
        );

        self.page
            .set_u16(PREFIX_LEN_OFFSET, prefix.len() as u16);
        if !prefix.is_empty() {
            self.page.set_bytes(PREFIX_OFFSET, prefix.as_bytes());
        }

        let mut data_offset = PAGE_SIZE;
        let mut offsets = Vec::with_capacity(entries.len() * 2);
        let mut tail = vec![0u8; total];
        let tail_base = PAGE_SIZE - total;

        for entry in entries {
            data_offset -= entry.len();
            offsets.extend_from_slice(&(data_offset as u16).to_le_bytes());
            tail[data_offset - tail_base..data_offset - tail_base + entry.len()]
                .copy_from_slice(entry);
        }

        if !entries.is_empty() {
            self.page.set_bytes(offsets_base, &offsets);
            self.page.set_bytes(tail_base, &tail);
        }
        self.page.set_u32(SIZE_OFFSET, entries.len() as u32);
        self.page
            .set_u32(FREE_POINTER_OFFSET, data_offset as u32);
        Ok(())
    }

    /// Removes the entry at `index` by repacking the remainder.
    pub fn remove_at(&mut self, index: usize) -> Result<()> {
        let size = self.size();
        ensure!(index < size, "bucket entry index {} out of range", index);

        let prefix = self.prefix();
        let mut entries = Vec::with_capacity(size - 1);
        for i in 0..size {
            if i != index {
                entries.push(self.raw_entry_at(i));
            }
        }
        self.set_raw_entries(&prefix, &entries)
    }

    fn entry_size_at(&self, position: usize) -> usize {
        let mut end = PAGE_SIZE;
        for i in 0..self.size() {
            let other = self.entry_position(i);
            if other > position && other < end {
                end = other;
            }
        }
        end - position
    }

    pub fn raw_entry_at(&self, index: usize) -> Vec<u8> {
        let position = self.entry_position(index);
        let size = self.entry_size_at(position);
        self.page.get_bytes(position, size).to_vec()
    }

    /// Replaces the value of the leaf entry at `index`, repacking the
    /// bucket. Returns false when the new value does not fit.
    pub fn update_value(&mut self, index: usize, value: &LeafValue) -> Result<bool> {
        debug_assert!(self.is_leaf());
        let size = self.size();
        ensure!(index < size, "bucket entry index {} out of range", index);

        let prefix = self.prefix();
        let mut entries: Vec<Vec<u8>> = (0..size).map(|i| self.raw_entry_at(i)).collect();

        let suffix = self.key_suffix(index);
        let mut replacement = Vec::with_capacity(2 + suffix.len() + 16);
        replacement.extend_from_slice(&(suffix.len() as u16).to_le_bytes());
        replacement.extend_from_slice(suffix.as_bytes());
        encode_value(value, &mut replacement);

        let old_len = entries[index].len();
        let total: usize = entries.iter().map(|e| e.len()).sum();
        let new_total = total - old_len + replacement.len();
        let offsets_end = PREFIX_OFFSET + prefix.len() + entries.len() * 2;
        if offsets_end + new_total > PAGE_SIZE {
            return Ok(false);
        }

        entries[index] = replacement;
        self.set_raw_entries(&prefix, &entries)?;
        Ok(true)
    }
}
