//! # Partitioned File Lock Manager
//!
//! Shared/exclusive locks keyed by file id, partitioned to keep unrelated
//! files from contending on one lock word. Structural operations on the
//! bonsai and prefix trees take the exclusive side for their file; read
//! entry points take the shared side.
//!
//! Ids map to partitions by masking, so two files may share a partition;
//! that only widens a lock's scope, never narrows it.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::FILE_LOCK_PARTITIONS;

pub struct FileLockManager {
    partitions: Vec<RwLock<()>>,
}

impl FileLockManager {
    pub fn new() -> Self {
        Self {
            partitions: (0..FILE_LOCK_PARTITIONS).map(|_| RwLock::new(())).collect(),
        }
    }

    fn partition(&self, file_id: u32) -> &RwLock<()> {
        &self.partitions[file_id as usize & (FILE_LOCK_PARTITIONS - 1)]
    }

    pub fn shared(&self, file_id: u32) -> RwLockReadGuard<'_, ()> {
        self.partition(file_id).read()
    }

    pub fn exclusive(&self, file_id: u32) -> RwLockWriteGuard<'_, ()> {
        self.partition(file_id).write()
    }
}

impl Default for FileLockManager {
    fn default() -> Self {
        Self::new()
    }
}
