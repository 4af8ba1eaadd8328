//! # Sys Bucket
//!
//! Per-file metadata region of a bonsai file, stored in the first bucket
//! slot of page 0. Tracks where the next fresh bucket is carved
//! (free-space pointer) and the stack of recycled buckets (free-list head
//! and length).
//!
//! ## Layout (relative to the bucket region)
//!
//! ```text
//! Offset  Size  Field
//! 0       1     magic               initialised marker
//! 1       8     free_space_pointer  next never-used bucket slot
//! 9       8     free_list_head      top of the recycled-bucket stack
//! 17      8     free_list_length
//! ```

use crate::config::{BONSAI_BUCKET_SIZE, PAGE_DATA_OFFSET};
use crate::storage::{DurablePage, PageView};

use super::bucket::BonsaiPointer;

pub const SYS_MAGIC: u8 = 0xE7;

pub const MAGIC_OFFSET: usize = 0;
pub const FREE_SPACE_OFFSET: usize = 1;
pub const FREE_LIST_HEAD_OFFSET: usize = 9;
pub const FREE_LIST_LENGTH_OFFSET: usize = 17;

/// Location of the sys bucket in every bonsai file.
pub const SYS_BUCKET_POINTER: BonsaiPointer = BonsaiPointer {
    page: 0,
    offset: PAGE_DATA_OFFSET as u32,
};

pub struct SysBucket<'a, 'b> {
    page: &'b mut DurablePage<'a>,
    base: usize,
}

impl<'a, 'b> SysBucket<'a, 'b> {
    pub fn new(page: &'b mut DurablePage<'a>) -> Self {
        Self {
            page,
            base: SYS_BUCKET_POINTER.offset as usize,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.page.get_u8(self.base + MAGIC_OFFSET) == SYS_MAGIC
    }

    /// First allocation in a fresh file: the slot after the sys bucket is
    /// the first free one.
    pub fn init(&mut self) {
        self.page.set_u8(self.base + MAGIC_OFFSET, SYS_MAGIC);
        let first_free = BonsaiPointer::new(
            0,
            (PAGE_DATA_OFFSET + BONSAI_BUCKET_SIZE) as u32,
        );
        self.page
            .set_bytes(self.base + FREE_SPACE_OFFSET, &first_free.encode());
        self.page.set_bytes(
            self.base + FREE_LIST_HEAD_OFFSET,
            &BonsaiPointer::NULL.encode(),
        );
        self.page.set_u64(self.base + FREE_LIST_LENGTH_OFFSET, 0);
    }

    pub fn free_space_pointer(&self) -> BonsaiPointer {
        BonsaiPointer::decode(self.page.get_bytes(self.base + FREE_SPACE_OFFSET, 8))
    }

    pub fn set_free_space_pointer(&mut self, pointer: BonsaiPointer) {
        self.page
            .set_bytes(self.base + FREE_SPACE_OFFSET, &pointer.encode());
    }

    pub fn free_list_head(&self) -> BonsaiPointer {
        BonsaiPointer::decode(self.page.get_bytes(self.base + FREE_LIST_HEAD_OFFSET, 8))
    }

    pub fn set_free_list_head(&mut self, pointer: BonsaiPointer) {
        self.page
            .set_bytes(self.base + FREE_LIST_HEAD_OFFSET, &pointer.encode());
    }

    pub fn free_list_length(&self) -> u64 {
        self.page.get_u64(self.base + FREE_LIST_LENGTH_OFFSET)
    }

    pub fn set_free_list_length(&mut self, length: u64) {
        self.page.set_u64(self.base + FREE_LIST_LENGTH_OFFSET, length);
    }
}

/// Read-only counterpart used by statistics paths.
pub struct SysBucketView<'a, 'b> {
    page: &'b PageView<'a>,
    base: usize,
}

impl<'a, 'b> SysBucketView<'a, 'b> {
    pub fn new(page: &'b PageView<'a>) -> Self {
        Self {
            page,
            base: SYS_BUCKET_POINTER.offset as usize,
        }
    }

    pub fn free_list_head(&self) -> BonsaiPointer {
        BonsaiPointer::decode(self.page.get_bytes(self.base + FREE_LIST_HEAD_OFFSET, 8))
    }

    pub fn free_list_length(&self) -> u64 {
        self.page.get_u64(self.base + FREE_LIST_LENGTH_OFFSET)
    }

    pub fn free_space_pointer(&self) -> BonsaiPointer {
        BonsaiPointer::decode(self.page.get_bytes(self.base + FREE_SPACE_OFFSET, 8))
    }
}
