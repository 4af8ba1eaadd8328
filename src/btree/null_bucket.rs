//! # Null Bucket
//!
//! Single-page file holding the one value associated with the null key of a
//! prefix B+-tree, when the tree was created with null support.
//!
//! ## Layout (from `PAGE_DATA_OFFSET`)
//!
//! ```text
//! Offset  Size  Field
//! 16      1     present
//! 17      4     value_len
//! 21      *     value bytes
//! ```

use crate::config::PAGE_DATA_OFFSET;
use crate::storage::{DurablePage, PageView};

pub const PRESENT_OFFSET: usize = PAGE_DATA_OFFSET;
pub const VALUE_LEN_OFFSET: usize = PRESENT_OFFSET + 1;
pub const VALUE_OFFSET: usize = VALUE_LEN_OFFSET + 4;

pub struct NullBucket<'a, 'b> {
    page: &'b PageView<'a>,
}

impl<'a, 'b> NullBucket<'a, 'b> {
    pub fn new(page: &'b PageView<'a>) -> Self {
        Self { page }
    }

    pub fn get(&self) -> Option<Vec<u8>> {
        if self.page.get_u8(PRESENT_OFFSET) == 0 {
            return None;
        }
        let len = self.page.get_u32(VALUE_LEN_OFFSET) as usize;
        Some(self.page.get_bytes(VALUE_OFFSET, len).to_vec())
    }
}

pub struct NullBucketMut<'a, 'b> {
    page: &'b mut DurablePage<'a>,
}

impl<'a, 'b> NullBucketMut<'a, 'b> {
    pub fn new(page: &'b mut DurablePage<'a>) -> Self {
        Self { page }
    }

    pub fn get(&self) -> Option<Vec<u8>> {
        if self.page.get_u8(PRESENT_OFFSET) == 0 {
            return None;
        }
        let len = self.page.get_u32(VALUE_LEN_OFFSET) as usize;
        Some(self.page.get_bytes(VALUE_OFFSET, len).to_vec())
    }

    pub fn set(&mut self, value: &[u8]) {
        self.page.set_u8(PRESENT_OFFSET, 1);
        self.page.set_u32(VALUE_LEN_OFFSET, value.len() as u32);
        self.page.set_bytes(VALUE_OFFSET, value);
    }

    pub fn remove(&mut self) -> Option<Vec<u8>> {
        let previous = self.get();
        if previous.is_some() {
            self.page.set_u8(PRESENT_OFFSET, 0);
        }
        previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{PageCache, WriteCache};
    use crate::wal::Wal;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn set_get_remove_cycle() {
        let dir = tempdir().unwrap();
        let write_cache = Arc::new(WriteCache::open(dir.path()).unwrap());
        let wal = Arc::new(Wal::open(dir.path().join("wal"), 1024 * 1024).unwrap());
        let cache = PageCache::new(16, Arc::clone(&write_cache), wal);
        let file_id = write_cache.book_file_id("t.npt").unwrap();
        write_cache.add_file("t.npt", file_id).unwrap();

        let (guard, _) = cache.allocate_new_page(file_id).unwrap();
        let mut page = DurablePage::new(guard);
        let mut bucket = NullBucketMut::new(&mut page);

        assert_eq!(bucket.get(), None);
        bucket.set(b"null value");
        assert_eq!(bucket.get(), Some(b"null value".to_vec()));

        assert_eq!(bucket.remove(), Some(b"null value".to_vec()));
        assert_eq!(bucket.get(), None);
        assert_eq!(bucket.remove(), None);
    }
}
