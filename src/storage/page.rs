//! # Durable Page Views
//!
//! Typed access to a cached page buffer. [`DurablePage`] wraps an exclusive
//! pin and records every mutation primitive as one page-operation carrying
//! the previous bytes, so the operation list drained at release time can be
//! both redone and undone exactly. [`PageView`] is the read-only counterpart
//! over a shared pin.
//!
//! The release path (draining the operation list into the WAL and stamping
//! the page LSN) belongs to the engine context, which owns the atomic
//! operation; see `Engine::release_page`.

use eyre::{ensure, Result};

use super::cache::{PageKey, PageReadGuard, PageWriteGuard};
use crate::config::PAGE_SIZE;
use crate::wal::PageOp;

fn get_u8_at(buf: &[u8], offset: usize) -> u8 {
    buf[offset]
}

fn get_u16_at(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(buf[offset..offset + 2].try_into().unwrap()) // INVARIANT: callers stay inside PAGE_SIZE
}

fn get_u32_at(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap()) // INVARIANT: callers stay inside PAGE_SIZE
}

fn get_u64_at(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap()) // INVARIANT: callers stay inside PAGE_SIZE
}

/// Read-only typed view over a shared-pinned page.
pub struct PageView<'a> {
    guard: PageReadGuard<'a>,
}

impl<'a> PageView<'a> {
    pub fn new(guard: PageReadGuard<'a>) -> Self {
        Self { guard }
    }

    pub fn key(&self) -> PageKey {
        self.guard.key()
    }

    pub fn lsn(&self) -> u64 {
        self.guard.lsn()
    }

    pub fn get_u8(&self, offset: usize) -> u8 {
        get_u8_at(self.guard.data(), offset)
    }

    pub fn get_u16(&self, offset: usize) -> u16 {
        get_u16_at(self.guard.data(), offset)
    }

    pub fn get_u32(&self, offset: usize) -> u32 {
        get_u32_at(self.guard.data(), offset)
    }

    pub fn get_u64(&self, offset: usize) -> u64 {
        get_u64_at(self.guard.data(), offset)
    }

    pub fn get_bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.guard.data()[offset..offset + len]
    }
}

/// Write view over an exclusively pinned page. Every setter emits exactly
/// one page operation with the previous state of the mutated range.
pub struct DurablePage<'a> {
    guard: PageWriteGuard<'a>,
    ops: Vec<PageOp>,
}

impl<'a> DurablePage<'a> {
    pub fn new(guard: PageWriteGuard<'a>) -> Self {
        Self {
            guard,
            ops: Vec::new(),
        }
    }

    pub fn key(&self) -> PageKey {
        self.guard.key()
    }

    pub fn lsn(&self) -> u64 {
        self.guard.lsn()
    }

    pub fn get_u8(&self, offset: usize) -> u8 {
        get_u8_at(self.guard.data(), offset)
    }

    pub fn get_u16(&self, offset: usize) -> u16 {
        get_u16_at(self.guard.data(), offset)
    }

    pub fn get_u32(&self, offset: usize) -> u32 {
        get_u32_at(self.guard.data(), offset)
    }

    pub fn get_u64(&self, offset: usize) -> u64 {
        get_u64_at(self.guard.data(), offset)
    }

    pub fn get_bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.guard.data()[offset..offset + len]
    }

    /// Two-byte setter used by slot arrays; journalled as a byte-range op.
    pub fn set_u16(&mut self, offset: usize, value: u16) {
        self.set_bytes(offset, &value.to_le_bytes());
    }

    pub fn set_u8(&mut self, offset: usize, value: u8) {
        let prev = self.get_u8(offset);
        self.guard.data_mut()[offset] = value;
        self.ops.push(PageOp::SetU8 {
            offset: offset as u32,
            new: value,
            prev,
        });
    }

    pub fn set_u32(&mut self, offset: usize, value: u32) {
        let prev = self.get_u32(offset);
        self.guard.data_mut()[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        self.ops.push(PageOp::SetU32 {
            offset: offset as u32,
            new: value,
            prev,
        });
    }

    pub fn set_u64(&mut self, offset: usize, value: u64) {
        let prev = self.get_u64(offset);
        self.guard.data_mut()[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
        self.ops.push(PageOp::SetU64 {
            offset: offset as u32,
            new: value,
            prev,
        });
    }

    pub fn set_bytes(&mut self, offset: usize, value: &[u8]) {
        let prev = self.guard.data()[offset..offset + value.len()].to_vec();
        self.guard.data_mut()[offset..offset + value.len()].copy_from_slice(value);
        self.ops.push(PageOp::SetBytes {
            offset: offset as u32,
            new: value.to_vec(),
            prev,
        });
    }

    /// Copies `len` bytes from `src` to `dst` within the page, recording the
    /// destination's previous content.
    pub fn move_data(&mut self, src: usize, dst: usize, len: usize) -> Result<()> {
        ensure!(
            src + len <= PAGE_SIZE && dst + len <= PAGE_SIZE,
            "move_data range escapes the page"
        );
        let data = self.guard.data()[src..src + len].to_vec();
        self.set_bytes(dst, &data);
        Ok(())
    }

    /// Number of operations recorded so far.
    pub fn pending_ops(&self) -> usize {
        self.ops.len()
    }

    /// Splits the view into its pin guard and the recorded operation list.
    /// The release path appends the operations to the WAL in order and
    /// stamps the page LSN before dropping the guard.
    pub fn into_parts(self) -> (PageWriteGuard<'a>, Vec<PageOp>) {
        (self.guard, self.ops)
    }
}
