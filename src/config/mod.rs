//! # Engine Configuration
//!
//! Centralizes the layout constants the durable format depends on and the
//! runtime knobs an embedder may tune. Constants that depend on each other
//! are co-located and guarded by compile-time assertions so a change to one
//! cannot silently invalidate another.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE (65536 bytes)
//!       │
//!       ├─> PAGE_DATA_OFFSET (16 bytes: LSN + reserved)
//!       │
//!       ├─> PAGE_USABLE_SIZE (derived: PAGE_SIZE - PAGE_DATA_OFFSET)
//!       │
//!       └─> BONSAI_BUCKET_SIZE (must divide PAGE_SIZE evenly)
//!
//! FILE_LOCK_PARTITIONS (64)
//!       └─> partition count of the per-file lock manager
//! ```
//!
//! Runtime knobs (cache size, WAL segment size, tree depth limits) live in
//! [`EngineConfig`]; layout constants are fixed at compile time because they
//! are part of the durable on-disk contract.

/// Size of each page in bytes. The fundamental unit of IO, caching and WAL
/// page operations. Part of the durable format: files written with one page
/// size cannot be opened with another.
pub const PAGE_SIZE: usize = 65536;

/// Bytes reserved at the start of every page: the page LSN (u64) plus
/// reserved space. Typed page layouts begin at this offset.
pub const PAGE_DATA_OFFSET: usize = 16;

/// Usable payload space per page after the page header.
pub const PAGE_USABLE_SIZE: usize = PAGE_SIZE - PAGE_DATA_OFFSET;

/// Byte budget of a single bonsai sub-page bucket.
pub const BONSAI_BUCKET_SIZE: usize = 2048;

/// Partition count of the per-file shared/exclusive lock manager.
pub const FILE_LOCK_PARTITIONS: usize = 64;

/// Number of hash-bucket pointers per directory node (local depth 8).
pub const HASH_LEVEL_SIZE: usize = 256;

/// Entries a range cursor buffers per descent from the root.
pub const CURSOR_BATCH: usize = 64;

const _: () = assert!(
    PAGE_SIZE % BONSAI_BUCKET_SIZE == 0,
    "bonsai buckets must tile a page exactly"
);

const _: () = assert!(
    PAGE_USABLE_SIZE == PAGE_SIZE - PAGE_DATA_OFFSET,
    "PAGE_USABLE_SIZE derivation mismatch"
);

const _: () = assert!(
    FILE_LOCK_PARTITIONS.is_power_of_two(),
    "lock partition count must be a power of two"
);

/// Runtime configuration for an [`crate::engine::Engine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Capacity of the page cache, in pages.
    pub cache_pages: usize,
    /// Maximum size of a single WAL segment file before rotation.
    pub wal_segment_size: u64,
    /// Maximum tree descent depth before a corruption error is raised.
    pub max_path_length: usize,
    /// Values larger than this are written to a value-page chain instead of
    /// being embedded in a leaf entry.
    pub max_embedded_value_size: usize,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache_pages(mut self, pages: usize) -> Self {
        self.cache_pages = pages;
        self
    }

    pub fn wal_segment_size(mut self, bytes: u64) -> Self {
        self.wal_segment_size = bytes;
        self
    }

    pub fn max_path_length(mut self, depth: usize) -> Self {
        self.max_path_length = depth;
        self
    }

    pub fn max_embedded_value_size(mut self, bytes: usize) -> Self {
        self.max_embedded_value_size = bytes;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_pages: 256,
            wal_segment_size: 64 * 1024 * 1024,
            max_path_length: 64,
            max_embedded_value_size: 40,
        }
    }
}
