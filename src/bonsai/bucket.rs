//! # Bonsai Bucket
//!
//! Sub-page node of a bonsai B-tree. Buckets are fixed
//! [`BONSAI_BUCKET_SIZE`]-byte regions; a page holds several, addressed by a
//! [`BonsaiPointer`] `(page_index, offset_within_page)`. Leaf siblings are
//! chained through plain pointers in both directions.
//!
//! ## Layout (relative to the bucket region)
//!
//! ```text
//! Offset  Size  Field
//! 0       1     flags            bit0 = leaf, bit1 = deleted
//! 1       2     size             entry count
//! 3       2     free_pointer     start of the entry-data tail
//! 5       1     key_serializer   id re-checked on open
//! 6       1     value_serializer id re-checked on open
//! 7       8     left_sibling     leaf chain (page u32 | offset u32)
//! 15      8     right_sibling
//! 23      8     free_list_next   valid while the bucket sits on the free list
//! 31      8     tree_size        root bucket only
//! 39      2*N   positions        per-entry u16 offsets into the tail
//! ...           free space
//! tail          entries          grow downward from the region end
//! ```
//!
//! Leaf entries are `key || value` (serializer-framed); non-leaf entries are
//! `left_child || right_child || key`.

use eyre::{ensure, Result};

use crate::config::BONSAI_BUCKET_SIZE;
use crate::serializer::BinarySerializer;
use crate::storage::{DurablePage, PageView};

pub const FLAGS_OFFSET: usize = 0;
pub const SIZE_OFFSET: usize = 1;
pub const FREE_POINTER_OFFSET: usize = 3;
pub const KEY_SERIALIZER_OFFSET: usize = 5;
pub const VALUE_SERIALIZER_OFFSET: usize = 6;
pub const LEFT_SIBLING_OFFSET: usize = 7;
pub const RIGHT_SIBLING_OFFSET: usize = 15;
pub const FREE_LIST_NEXT_OFFSET: usize = 23;
pub const TREE_SIZE_OFFSET: usize = 31;
pub const POSITIONS_OFFSET: usize = 39;

pub const LEAF_FLAG: u8 = 1;
pub const DELETED_FLAG: u8 = 2;

/// Address of a bonsai bucket: page index plus byte offset within the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BonsaiPointer {
    pub page: u32,
    pub offset: u32,
}

impl BonsaiPointer {
    pub const NULL: Self = Self {
        page: u32::MAX,
        offset: u32::MAX,
    };

    pub fn new(page: u32, offset: u32) -> Self {
        Self { page, offset }
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    pub fn encode(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0..4].copy_from_slice(&self.page.to_le_bytes());
        buf[4..8].copy_from_slice(&self.offset.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Self {
        Self {
            page: u32::from_le_bytes(buf[0..4].try_into().unwrap()), // INVARIANT: callers pass 8 bytes
            offset: u32::from_le_bytes(buf[4..8].try_into().unwrap()), // INVARIANT: callers pass 8 bytes
        }
    }
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

/// Serializes a leaf entry.
pub fn leaf_entry_bytes<K, V>(
    key: &K,
    value: &V,
    key_ser: &dyn BinarySerializer<K>,
    value_ser: &dyn BinarySerializer<V>,
) -> Vec<u8> {
    let key_size = key_ser.object_size(key);
    let mut buf = vec![0u8; key_size + value_ser.object_size(value)];
    key_ser.serialize(key, &mut buf, 0);
    value_ser.serialize(value, &mut buf, key_size);
    buf
}

/// Serializes a non-leaf entry.
pub fn non_leaf_entry_bytes<K>(
    left: BonsaiPointer,
    right: BonsaiPointer,
    key: &K,
    key_ser: &dyn BinarySerializer<K>,
) -> Vec<u8> {
    let mut buf = vec![0u8; 16 + key_ser.object_size(key)];
    buf[0..8].copy_from_slice(&left.encode());
    buf[8..16].copy_from_slice(&right.encode());
    key_ser.serialize(key, &mut buf, 16);
    buf
}

/// Read-only bucket view.
pub struct BonsaiBucket<'a, 'b> {
    page: &'b PageView<'a>,
    base: usize,
}

impl<'a, 'b> BonsaiBucket<'a, 'b> {
    pub fn new(page: &'b PageView<'a>, offset: u32) -> Self {
        Self {
            page,
            base: offset as usize,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.page.get_u8(self.base + FLAGS_OFFSET) & LEAF_FLAG != 0
    }

    pub fn is_deleted(&self) -> bool {
        self.page.get_u8(self.base + FLAGS_OFFSET) & DELETED_FLAG != 0
    }

    pub fn size(&self) -> usize {
        self.page.get_u16(self.base + SIZE_OFFSET) as usize
    }

    pub fn key_serializer_id(&self) -> u8 {
        self.page.get_u8(self.base + KEY_SERIALIZER_OFFSET)
    }

    pub fn value_serializer_id(&self) -> u8 {
        self.page.get_u8(self.base + VALUE_SERIALIZER_OFFSET)
    }

    pub fn left_sibling(&self) -> BonsaiPointer {
        BonsaiPointer::decode(self.page.get_bytes(self.base + LEFT_SIBLING_OFFSET, 8))
    }

    pub fn right_sibling(&self) -> BonsaiPointer {
        BonsaiPointer::decode(self.page.get_bytes(self.base + RIGHT_SIBLING_OFFSET, 8))
    }

    pub fn tree_size(&self) -> u64 {
        self.page.get_u64(self.base + TREE_SIZE_OFFSET)
    }

    fn entry_position(&self, index: usize) -> usize {
        self.page.get_u16(self.base + POSITIONS_OFFSET + index * 2) as usize
    }

    pub fn key_at<K>(&self, index: usize, key_ser: &dyn BinarySerializer<K>) -> Result<K> {
        let mut position = self.entry_position(index);
        if !self.is_leaf() {
            position += 16;
        }
        let region = self.page.get_bytes(self.base, BONSAI_BUCKET_SIZE);
        key_ser.deserialize(region, position)
    }

    pub fn value_at<K, V>(
        &self,
        index: usize,
        key_ser: &dyn BinarySerializer<K>,
        value_ser: &dyn BinarySerializer<V>,
    ) -> Result<V> {
        debug_assert!(self.is_leaf());
        let position = self.entry_position(index);
        let region = self.page.get_bytes(self.base, BONSAI_BUCKET_SIZE);
        let key_size = key_ser.stored_size(region, position)?;
        value_ser.deserialize(region, position + key_size)
    }

    pub fn children_at(&self, index: usize) -> (BonsaiPointer, BonsaiPointer) {
        debug_assert!(!self.is_leaf());
        let position = self.entry_position(index);
        let left = BonsaiPointer::decode(self.page.get_bytes(self.base + position, 8));
        let right = BonsaiPointer::decode(self.page.get_bytes(self.base + position + 8, 8));
        (left, right)
    }

    pub fn find<K: Ord>(&self, key: &K, key_ser: &dyn BinarySerializer<K>) -> Result<SearchResult> {
        let mut low = 0usize;
        let mut high = self.size();

        while low < high {
            let mid = (low + high) / 2;
            let mid_key = self.key_at(mid, key_ser)?;
            match mid_key.cmp(key) {
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid,
                std::cmp::Ordering::Equal => return Ok(SearchResult::Found(mid)),
            }
        }
        Ok(SearchResult::NotFound(low))
    }

    fn entry_size_at(&self, position: usize) -> usize {
        let mut end = BONSAI_BUCKET_SIZE;
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
        self.page.get_bytes(self.base + position, size).to_vec()
    }
}

/// Mutable bucket view over a write-pinned durable page.
pub struct BonsaiBucketMut<'a, 'b> {
    page: &'b mut DurablePage<'a>,
    base: usize,
}

impl<'a, 'b> BonsaiBucketMut<'a, 'b> {
    pub fn new(page: &'b mut DurablePage<'a>, offset: u32) -> Self {
        Self {
            page,
            base: offset as usize,
        }
    }

    pub fn init(&mut self, leaf: bool, key_serializer_id: u8, value_serializer_id: u8) {
        self.page.set_u8(
            self.base + FLAGS_OFFSET,
            if leaf { LEAF_FLAG } else { 0 },
        );
        self.page.set_u16(self.base + SIZE_OFFSET, 0);
        self.page
            .set_u16(self.base + FREE_POINTER_OFFSET, BONSAI_BUCKET_SIZE as u16);
        self.page
            .set_u8(self.base + KEY_SERIALIZER_OFFSET, key_serializer_id);
        self.page
            .set_u8(self.base + VALUE_SERIALIZER_OFFSET, value_serializer_id);
        self.page
            .set_bytes(self.base + LEFT_SIBLING_OFFSET, &BonsaiPointer::NULL.encode());
        self.page.set_bytes(
            self.base + RIGHT_SIBLING_OFFSET,
            &BonsaiPointer::NULL.encode(),
        );
        self.page.set_bytes(
            self.base + FREE_LIST_NEXT_OFFSET,
            &BonsaiPointer::NULL.encode(),
        );
        self.page.set_u64(self.base + TREE_SIZE_OFFSET, 0);
    }

    pub fn is_leaf(&self) -> bool {
        self.page.get_u8(self.base + FLAGS_OFFSET) & LEAF_FLAG != 0
    }

    pub fn is_deleted(&self) -> bool {
        self.page.get_u8(self.base + FLAGS_OFFSET) & DELETED_FLAG != 0
    }

    pub fn set_deleted(&mut self) {
        let flags = self.page.get_u8(self.base + FLAGS_OFFSET);
        self.page
            .set_u8(self.base + FLAGS_OFFSET, flags | DELETED_FLAG);
    }

    pub fn clear_deleted(&mut self) {
        let flags = self.page.get_u8(self.base + FLAGS_OFFSET);
        self.page
            .set_u8(self.base + FLAGS_OFFSET, flags & !DELETED_FLAG);
    }

    pub fn size(&self) -> usize {
        self.page.get_u16(self.base + SIZE_OFFSET) as usize
    }

    pub fn key_serializer_id(&self) -> u8 {
        self.page.get_u8(self.base + KEY_SERIALIZER_OFFSET)
    }

    pub fn value_serializer_id(&self) -> u8 {
        self.page.get_u8(self.base + VALUE_SERIALIZER_OFFSET)
    }

    fn free_pointer(&self) -> usize {
        self.page.get_u16(self.base + FREE_POINTER_OFFSET) as usize
    }

    pub fn left_sibling(&self) -> BonsaiPointer {
        BonsaiPointer::decode(self.page.get_bytes(self.base + LEFT_SIBLING_OFFSET, 8))
    }

    pub fn set_left_sibling(&mut self, pointer: BonsaiPointer) {
        self.page
            .set_bytes(self.base + LEFT_SIBLING_OFFSET, &pointer.encode());
    }

    pub fn right_sibling(&self) -> BonsaiPointer {
        BonsaiPointer::decode(self.page.get_bytes(self.base + RIGHT_SIBLING_OFFSET, 8))
    }

    pub fn set_right_sibling(&mut self, pointer: BonsaiPointer) {
        self.page
            .set_bytes(self.base + RIGHT_SIBLING_OFFSET, &pointer.encode());
    }

    pub fn free_list_next(&self) -> BonsaiPointer {
        BonsaiPointer::decode(self.page.get_bytes(self.base + FREE_LIST_NEXT_OFFSET, 8))
    }

    pub fn set_free_list_next(&mut self, pointer: BonsaiPointer) {
        self.page
            .set_bytes(self.base + FREE_LIST_NEXT_OFFSET, &pointer.encode());
    }

    pub fn tree_size(&self) -> u64 {
        self.page.get_u64(self.base + TREE_SIZE_OFFSET)
    }

    pub fn set_tree_size(&mut self, size: u64) {
        self.page.set_u64(self.base + TREE_SIZE_OFFSET, size);
    }

    fn entry_position(&self, index: usize) -> usize {
        self.page.get_u16(self.base + POSITIONS_OFFSET + index * 2) as usize
    }

    fn entry_size_at(&self, position: usize) -> usize {
        // Entries are tail-packed in insertion order; the entry ending at a
        // given data start is found through the positions array, so size is
        // recovered by scanning for the closest data start above `position`.
        let mut end = BONSAI_BUCKET_SIZE;
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
        self.page.get_bytes(self.base + position, size).to_vec()
    }

    pub fn key_at<K>(&self, index: usize, key_ser: &dyn BinarySerializer<K>) -> Result<K> {
        let mut position = self.entry_position(index);
        if !self.is_leaf() {
            position += 16;
        }
        let region = self.page.get_bytes(self.base, BONSAI_BUCKET_SIZE);
        key_ser.deserialize(region, position)
    }

    pub fn value_at<K, V>(
        &self,
        index: usize,
        key_ser: &dyn BinarySerializer<K>,
        value_ser: &dyn BinarySerializer<V>,
    ) -> Result<V> {
        debug_assert!(self.is_leaf());
        let position = self.entry_position(index);
        let region = self.page.get_bytes(self.base, BONSAI_BUCKET_SIZE);
        let key_size = key_ser.stored_size(region, position)?;
        value_ser.deserialize(region, position + key_size)
    }

    pub fn children_at(&self, index: usize) -> (BonsaiPointer, BonsaiPointer) {
        debug_assert!(!self.is_leaf());
        let position = self.entry_position(index);
        let left = BonsaiPointer::decode(self.page.get_bytes(self.base + position, 8));
        let right = BonsaiPointer::decode(self.page.get_bytes(self.base + position + 8, 8));
        (left, right)
    }

    pub fn set_child_at(&mut self, index: usize, left: bool, child: BonsaiPointer) {
        debug_assert!(!self.is_leaf());
        let position = self.entry_position(index);
        let offset = if left { position } else { position + 8 };
        self.page.set_bytes(self.base + offset, &child.encode());
    }

    pub fn find<K: Ord>(&self, key: &K, key_ser: &dyn BinarySerializer<K>) -> Result<SearchResult> {
        let mut low = 0usize;
        let mut high = self.size();

        while low < high {
            let mid = (low + high) / 2;
            let mid_key = self.key_at(mid, key_ser)?;
            match mid_key.cmp(key) {
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid,
                std::cmp::Ordering::Equal => return Ok(SearchResult::Found(mid)),
            }
        }
        Ok(SearchResult::NotFound(low))
    }

    /// Free bytes between the positions array and the entry tail.
    pub fn free_space(&self) -> usize {
        let positions_end = POSITIONS_OFFSET + self.size() * 2;
        self.free_pointer().saturating_sub(positions_end)
    }

    /// Inserts a serialized entry at `index`, returning false when the
    /// bucket cannot hold it.
    pub fn insert_raw(&mut self, index: usize, entry: &[u8]) -> bool {
        let size = self.size();
        debug_assert!(index <= size);

        let positions_end = POSITIONS_OFFSET + size * 2;
        let free_pointer = self.free_pointer();
        if free_pointer < positions_end + 2 + entry.len() {
            return false;
        }

        let data_offset = free_pointer - entry.len();
        self.page.set_bytes(self.base + data_offset, entry);
        self.page
            .set_u16(self.base + FREE_POINTER_OFFSET, data_offset as u16);

        // Shift the positions tail right by one slot and write the new one.
        if index < size {
            let tail_start = self.base + POSITIONS_OFFSET + index * 2;
            let tail = self
                .page
                .get_bytes(tail_start, (size - index) * 2)
                .to_vec();
            self.page.set_bytes(tail_start + 2, &tail);
        }
        self.page
            .set_u16(self.base + POSITIONS_OFFSET + index * 2, data_offset as u16);
        self.page.set_u16(self.base + SIZE_OFFSET, (size + 1) as u16);
        true
    }

    /// Replaces the bucket's entries wholesale, repacking the tail.
    pub fn set_entries(&mut self, entries: &[Vec<u8>]) -> Result<()> {
        let total: usize = entries.iter().map(|e| e.len()).sum();
        let positions_end = POSITIONS_OFFSET + entries.len() * 2;
        ensure!(
            positions_end + total <= BONSAI_BUCKET_SIZE,
            "entries exceed bonsai bucket budget: {} bytes",
            total
        );

        let mut data_offset = BONSAI_BUCKET_SIZE;
        let mut positions = Vec::with_capacity(entries.len() * 2);
        let mut tail = vec![0u8; total];
        let tail_base = BONSAI_BUCKET_SIZE - total;

        for entry in entries {
            data_offset -= entry.len();
            positions.extend_from_slice(&(data_offset as u16).to_le_bytes());
            tail[data_offset - tail_base..data_offset - tail_base + entry.len()]
                .copy_from_slice(entry);
        }

        if !entries.is_empty() {
            self.page.set_bytes(self.base + POSITIONS_OFFSET, &positions);
            self.page.set_bytes(self.base + tail_base, &tail);
        }
        self.page
            .set_u16(self.base + SIZE_OFFSET, entries.len() as u16);
        self.page
            .set_u16(self.base + FREE_POINTER_OFFSET, data_offset as u16);
        Ok(())
    }

    /// Removes the entry at `index` by repacking the remainder.
    pub fn remove_at(&mut self, index: usize) -> Result<()> {
        let size = self.size();
        ensure!(index < size, "bonsai entry index {} out of range", index);

        let mut entries = Vec::with_capacity(size - 1);
        for i in 0..size {
            if i != index {
                entries.push(self.raw_entry_at(i));
            }
        }
        self.set_entries(&entries)
    }

    /// Keeps the first `new_size` entries, repacking the tail.
    pub fn shrink(&mut self, new_size: usize) -> Result<()> {
        let size = self.size();
        ensure!(new_size <= size, "cannot shrink {} entries to {}", size, new_size);

        let entries: Vec<Vec<u8>> = (0..new_size).map(|i| self.raw_entry_at(i)).collect();
        self.set_entries(&entries)
    }

    /// Replaces the value of a leaf entry, repacking if the size changed.
    /// Returns false when the grown entry no longer fits the bucket.
    pub fn update_value<K, V>(
        &mut self,
        index: usize,
        value: &V,
        key_ser: &dyn BinarySerializer<K>,
        value_ser: &dyn BinarySerializer<V>,
    ) -> Result<bool> {
        debug_assert!(self.is_leaf());
        let size = self.size();
        ensure!(index < size, "bonsai entry index {} out of range", index);

        let mut entries: Vec<Vec<u8>> = (0..size).map(|i| self.raw_entry_at(i)).collect();

        let region_start = self.entry_position(index);
        let region = self.page.get_bytes(self.base, BONSAI_BUCKET_SIZE);
        let key_size = key_ser.stored_size(region, region_start)?;

        let mut replacement = entries[index][..key_size].to_vec();
        let mut value_buf = vec![0u8; value_ser.object_size(value)];
        value_ser.serialize(value, &mut value_buf, 0);
        replacement.extend_from_slice(&value_buf);

        let total: usize = entries.iter().map(|e| e.len()).sum();
        let new_total = total - entries[index].len() + replacement.len();
        if POSITIONS_OFFSET + size * 2 + new_total > BONSAI_BUCKET_SIZE {
            return Ok(false);
        }

        entries[index] = replacement;
        self.set_entries(&entries)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::{U64Serializer, STRING_SERIALIZER_ID, U64_SERIALIZER_ID};
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
        let file_id = write_cache.book_file_id("links.bonsai").unwrap();
        write_cache.add_file("links.bonsai", file_id).unwrap();
        Fixture {
            _dir: dir,
            cache,
            file_id,
        }
    }

    #[test]
    fn pointer_roundtrip() {
        let pointer = BonsaiPointer::new(7, 4096);
        assert_eq!(BonsaiPointer::decode(&pointer.encode()), pointer);
        assert!(BonsaiPointer::NULL.is_null());
        assert!(!pointer.is_null());
    }

    #[test]
    fn insert_keeps_keys_sorted_and_searchable() {
        let fixture = setup();
        let (guard, _) = fixture.cache.allocate_new_page(fixture.file_id).unwrap();
        let mut page = DurablePage::new(guard);
        let mut bucket = BonsaiBucketMut::new(&mut page, 16);
        bucket.init(true, U64_SERIALIZER_ID, U64_SERIALIZER_ID);

        let ser = U64Serializer;
        for key in [50u64, 10, 30, 20, 40] {
            let result = bucket.find(&key, &ser).unwrap();
            assert!(!result.found());
            let entry = leaf_entry_bytes(&key, &(key * 100), &ser, &ser);
            assert!(bucket.insert_raw(result.index(), &entry));
        }

        assert_eq!(bucket.size(), 5);
        for (i, expected) in [10u64, 20, 30, 40, 50].iter().enumerate() {
            assert_eq!(bucket.key_at::<u64>(i, &ser).unwrap(), *expected);
            assert_eq!(
                bucket.value_at::<u64, u64>(i, &ser, &ser).unwrap(),
                expected * 100
            );
        }

        match bucket.find(&30u64, &ser).unwrap() {
            SearchResult::Found(index) => assert_eq!(index, 2),
            other => panic!("expected found, got {:?}", other),
        }
    }

    #[test]
    fn remove_repacks_remaining_entries() {
        let fixture = setup();
        let (guard, _) = fixture.cache.allocate_new_page(fixture.file_id).unwrap();
        let mut page = DurablePage::new(guard);
        let mut bucket = BonsaiBucketMut::new(&mut page, 16);
        bucket.init(true, U64_SERIALIZER_ID, U64_SERIALIZER_ID);

        let ser = U64Serializer;
        for key in [1u64, 2, 3] {
            let entry = leaf_entry_bytes(&key, &key, &ser, &ser);
            let index = bucket.find(&key, &ser).unwrap().index();
            bucket.insert_raw(index, &entry);
        }

        bucket.remove_at(1).unwrap();
        assert_eq!(bucket.size(), 2);
        assert_eq!(bucket.key_at::<u64>(0, &ser).unwrap(), 1);
        assert_eq!(bucket.key_at::<u64>(1, &ser).unwrap(), 3);
        assert!(!bucket.find(&2u64, &ser).unwrap().found());
    }

    #[test]
    fn insert_fails_when_bucket_is_full() {
        let fixture = setup();
        let (guard, _) = fixture.cache.allocate_new_page(fixture.file_id).unwrap();
        let mut page = DurablePage::new(guard);
        let mut bucket = BonsaiBucketMut::new(&mut page, 16);
        bucket.init(true, U64_SERIALIZER_ID, U64_SERIALIZER_ID);

        let ser = U64Serializer;
        let mut inserted = 0u64;
        loop {
            let entry = leaf_entry_bytes(&inserted, &inserted, &ser, &ser);
            if !bucket.insert_raw(inserted as usize, &entry) {
                break;
            }
            inserted += 1;
        }

        // 16 bytes per entry + 2 bytes of position, against the space after
        // the header.
        let expected = (BONSAI_BUCKET_SIZE - POSITIONS_OFFSET) / 18;
        assert_eq!(inserted as usize, expected);
        assert_eq!(bucket.size(), expected);
    }

    #[test]
    fn update_value_with_different_size() {
        use crate::serializer::{BytesSerializer, StringSerializer};

        let fixture = setup();
        let (guard, _) = fixture.cache.allocate_new_page(fixture.file_id).unwrap();
        let mut page = DurablePage::new(guard);
        let mut bucket = BonsaiBucketMut::new(&mut page, 16);
        bucket.init(true, STRING_SERIALIZER_ID, crate::serializer::BYTES_SERIALIZER_ID);

        let key_ser = StringSerializer;
        let value_ser = BytesSerializer;

        let key = "alpha".to_string();
        let entry = leaf_entry_bytes(&key, &vec![1u8, 2], &key_ser, &value_ser);
        bucket.insert_raw(0, &entry);

        bucket
            .update_value(0, &vec![9u8; 10], &key_ser, &value_ser)
            .unwrap();
        assert_eq!(bucket.key_at::<String>(0, &key_ser).unwrap(), "alpha");
        assert_eq!(
            bucket
                .value_at::<String, Vec<u8>>(0, &key_ser, &value_ser)
                .unwrap(),
            vec![9u8; 10]
        );
    }

    #[test]
    fn sibling_and_free_list_pointers() {
        let fixture = setup();
        let (guard, _) = fixture.cache.allocate_new_page(fixture.file_id).unwrap();
        let mut page = DurablePage::new(guard);
        let mut bucket = BonsaiBucketMut::new(&mut page, 16);
        bucket.init(true, U64_SERIALIZER_ID, U64_SERIALIZER_ID);

        assert!(bucket.left_sibling().is_null());
        assert!(bucket.right_sibling().is_null());

        bucket.set_left_sibling(BonsaiPointer::new(1, 16));
        bucket.set_right_sibling(BonsaiPointer::new(2, 2064));
        bucket.set_free_list_next(BonsaiPointer::new(3, 16));

        assert_eq!(bucket.left_sibling(), BonsaiPointer::new(1, 16));
        assert_eq!(bucket.right_sibling(), BonsaiPointer::new(2, 2064));
        assert_eq!(bucket.free_list_next(), BonsaiPointer::new(3, 16));

        assert!(!bucket.is_deleted());
        bucket.set_deleted();
        assert!(bucket.is_deleted());
        bucket.clear_deleted();
        assert!(!bucket.is_deleted());
    }

    #[test]
    fn non_leaf_entries_carry_children() {
        let fixture = setup();
        let (guard, _) = fixture.cache.allocate_new_page(fixture.file_id).unwrap();
        let mut page = DurablePage::new(guard);
        let mut bucket = BonsaiBucketMut::new(&mut page, 16);
        bucket.init(false, U64_SERIALIZER_ID, U64_SERIALIZER_ID);

        let ser = U64Serializer;
        let left = BonsaiPointer::new(5, 16);
        let right = BonsaiPointer::new(5, 2064);
        let entry = non_leaf_entry_bytes(left, right, &77u64, &ser);
        assert!(bucket.insert_raw(0, &entry));

        assert_eq!(bucket.key_at::<u64>(0, &ser).unwrap(), 77);
        assert_eq!(bucket.children_at(0), (left, right));

        bucket.set_child_at(0, false, BonsaiPointer::new(6, 16));
        assert_eq!(bucket.children_at(0).1, BonsaiPointer::new(6, 16));
    }
}
