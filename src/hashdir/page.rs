//! # Directory Page Layout
//!
//! Node storage for the extendible hash directory. The first page carries
//! the directory header (tree size, tombstone head) followed by an inline
//! node array; every further page is nodes only.
//!
//! ## Layout (from `PAGE_DATA_OFFSET`)
//!
//! ```text
//! first page:   tree_size u32 | tombstone i32 | node[0] | node[1] | ...
//! other pages:  node[0] | node[1] | ...
//!
//! node:         max_left_child_depth  u8
//!               max_right_child_depth u8
//!               node_local_depth      u8
//!               pointers              u64 * LEVEL_SIZE
//! ```
//!
//! A tombstoned node stores the next tombstone index in `pointers[0]`.

use crate::config::{HASH_LEVEL_SIZE, PAGE_DATA_OFFSET, PAGE_SIZE};
use crate::storage::{DurablePage, PageView};

pub const TREE_SIZE_OFFSET: usize = PAGE_DATA_OFFSET;
pub const TOMBSTONE_OFFSET: usize = TREE_SIZE_OFFSET + 4;
pub const ITEMS_OFFSET: usize = TOMBSTONE_OFFSET + 4;

/// Bytes of one serialized node.
pub const NODE_SIZE: usize = 3 + 8 * HASH_LEVEL_SIZE;

/// Nodes held inline on the first page, after the directory header.
pub const FIRST_PAGE_NODES: usize = (PAGE_SIZE - ITEMS_OFFSET) / NODE_SIZE;

/// Nodes held on each overflow page.
pub const NODES_PER_PAGE: usize = (PAGE_SIZE - PAGE_DATA_OFFSET) / NODE_SIZE;

/// Maps a directory-wide node index to its page and the node's byte offset
/// within that page. Page 0 is special: its node array starts after the
/// directory header.
pub fn node_location(node_index: usize) -> (u32, usize) {
    if node_index < FIRST_PAGE_NODES {
        (0, ITEMS_OFFSET + node_index * NODE_SIZE)
    } else {
        let overflow_index = node_index - FIRST_PAGE_NODES;
        let page = 1 + (overflow_index / NODES_PER_PAGE) as u32;
        let local = overflow_index % NODES_PER_PAGE;
        (page, PAGE_DATA_OFFSET + local * NODE_SIZE)
    }
}

/// Read accessors over one directory page.
pub struct DirectoryPageView<'a, 'b> {
    page: &'b PageView<'a>,
}

impl<'a, 'b> DirectoryPageView<'a, 'b> {
    pub fn new(page: &'b PageView<'a>) -> Self {
        Self { page }
    }

    pub fn tree_size(&self) -> u32 {
        self.page.get_u32(TREE_SIZE_OFFSET)
    }

    pub fn tombstone(&self) -> i32 {
        self.page.get_u32(TOMBSTONE_OFFSET) as i32
    }

    pub fn max_left_child_depth(&self, node_offset: usize) -> u8 {
        self.page.get_u8(node_offset)
    }

    pub fn max_right_child_depth(&self, node_offset: usize) -> u8 {
        self.page.get_u8(node_offset + 1)
    }

    pub fn node_local_depth(&self, node_offset: usize) -> u8 {
        self.page.get_u8(node_offset + 2)
    }

    pub fn pointer(&self, node_offset: usize, index: usize) -> u64 {
        debug_assert!(index < HASH_LEVEL_SIZE);
        self.page.get_u64(node_offset + 3 + index * 8)
    }

    pub fn node(&self, node_offset: usize) -> Vec<u64> {
        (0..HASH_LEVEL_SIZE)
            .map(|i| self.pointer(node_offset, i))
            .collect()
    }
}

/// Write accessors over one directory page.
pub struct DirectoryPageMut<'a, 'b> {
    page: &'b mut DurablePage<'a>,
}

impl<'a, 'b> DirectoryPageMut<'a, 'b> {
    pub fn new(page: &'b mut DurablePage<'a>) -> Self {
        Self { page }
    }

    pub fn init_first_page(&mut self) {
        self.page.set_u32(TREE_SIZE_OFFSET, 0);
        self.page.set_u32(TOMBSTONE_OFFSET, -1i32 as u32);
    }

    pub fn tree_size(&self) -> u32 {
        self.page.get_u32(TREE_SIZE_OFFSET)
    }

    pub fn set_tree_size(&mut self, size: u32) {
        self.page.set_u32(TREE_SIZE_OFFSET, size);
    }

    pub fn tombstone(&self) -> i32 {
        self.page.get_u32(TOMBSTONE_OFFSET) as i32
    }

    pub fn set_tombstone(&mut self, tombstone: i32) {
        self.page.set_u32(TOMBSTONE_OFFSET, tombstone as u32);
    }

    pub fn max_left_child_depth(&self, node_offset: usize) -> u8 {
        self.page.get_u8(node_offset)
    }

    pub fn set_max_left_child_depth(&mut self, node_offset: usize, depth: u8) {
        self.page.set_u8(node_offset, depth);
    }

    pub fn max_right_child_depth(&self, node_offset: usize) -> u8 {
        self.page.get_u8(node_offset + 1)
    }

    pub fn set_max_right_child_depth(&mut self, node_offset: usize, depth: u8) {
        self.page.set_u8(node_offset + 1, depth);
    }

    pub fn node_local_depth(&self, node_offset: usize) -> u8 {
        self.page.get_u8(node_offset + 2)
    }

    pub fn set_node_local_depth(&mut self, node_offset: usize, depth: u8) {
        self.page.set_u8(node_offset + 2, depth);
    }

    pub fn pointer(&self, node_offset: usize, index: usize) -> u64 {
        debug_assert!(index < HASH_LEVEL_SIZE);
        self.page.get_u64(node_offset + 3 + index * 8)
    }

    pub fn set_pointer(&mut self, node_offset: usize, index: usize, pointer: u64) {
        debug_assert!(index < HASH_LEVEL_SIZE);
        self.page.set_u64(node_offset + 3 + index * 8, pointer);
    }
}
