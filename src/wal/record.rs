//! # WAL Record Types
//!
//! Typed records appended to the write-ahead log, ordered by LSN. The set of
//! kinds covers the atomic-operation lifecycle (begin / commit / rollback),
//! file lifecycle (created / deleted) and page operations.
//!
//! Page operations are a tagged variant rather than a type hierarchy: each
//! variant carries the forward state and the previous state, so `redo`
//! re-applies the mutation and `undo` restores the page byte-for-byte. Every
//! page-operation payload starts with `(op_id, file_id, page_index)`.
//!
//! Record payloads are self-contained; framing (length varint + checksum) is
//! the log writer's concern.

use eyre::{bail, ensure, Result};

/// Log sequence number. Monotonically increasing, assigned at append.
pub type Lsn = u64;

/// LSN value meaning "no record"; real LSNs start at 1.
pub const NIL_LSN: Lsn = 0;

/// Wire tag of a WAL record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalRecordKind {
    AtomicBegin = 1,
    AtomicCommit = 2,
    AtomicRollback = 3,
    FileCreated = 4,
    FileDeleted = 5,
    PageSetU8 = 6,
    PageSetU32 = 7,
    PageSetU64 = 8,
    PageSetBytes = 9,
}

impl WalRecordKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::AtomicBegin),
            2 => Some(Self::AtomicCommit),
            3 => Some(Self::AtomicRollback),
            4 => Some(Self::FileCreated),
            5 => Some(Self::FileDeleted),
            6 => Some(Self::PageSetU8),
            7 => Some(Self::PageSetU32),
            8 => Some(Self::PageSetU64),
            9 => Some(Self::PageSetBytes),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A single page mutation with enough state to redo and undo it.
///
/// `new` and `prev` always describe the same byte range, so applying `redo`
/// followed by `undo` (or the reverse) is an identity on the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOp {
    SetU8 { offset: u32, new: u8, prev: u8 },
    SetU32 { offset: u32, new: u32, prev: u32 },
    SetU64 { offset: u32, new: u64, prev: u64 },
    SetBytes { offset: u32, new: Vec<u8>, prev: Vec<u8> },
}

impl PageOp {
    /// Applies the forward mutation. The page must be in the exact state it
    /// had just before this record was originally emitted.
    pub fn redo(&self, page: &mut [u8]) {
        match self {
            Self::SetU8 { offset, new, .. } => {
                page[*offset as usize] = *new;
            }
            Self::SetU32 { offset, new, .. } => {
                let off = *offset as usize;
                page[off..off + 4].copy_from_slice(&new.to_le_bytes());
            }
            Self::SetU64 { offset, new, .. } => {
                let off = *offset as usize;
                page[off..off + 8].copy_from_slice(&new.to_le_bytes());
            }
            Self::SetBytes { offset, new, .. } => {
                let off = *offset as usize;
                page[off..off + new.len()].copy_from_slice(new);
            }
        }
    }

    /// Restores the previous state of the mutated range.
    pub fn undo(&self, page: &mut [u8]) {
        match self {
            Self::SetU8 { offset, prev, .. } => {
                page[*offset as usize] = *prev;
            }
            Self::SetU32 { offset, prev, .. } => {
                let off = *offset as usize;
                page[off..off + 4].copy_from_slice(&prev.to_le_bytes());
            }
            Self::SetU64 { offset, prev, .. } => {
                let off = *offset as usize;
                page[off..off + 8].copy_from_slice(&prev.to_le_bytes());
            }
            Self::SetBytes { offset, prev, .. } => {
                let off = *offset as usize;
                page[off..off + prev.len()].copy_from_slice(prev);
            }
        }
    }

    fn kind(&self) -> WalRecordKind {
        match self {
            Self::SetU8 { .. } => WalRecordKind::PageSetU8,
            Self::SetU32 { .. } => WalRecordKind::PageSetU32,
            Self::SetU64 { .. } => WalRecordKind::PageSetU64,
            Self::SetBytes { .. } => WalRecordKind::PageSetBytes,
        }
    }
}

/// A typed WAL record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    AtomicBegin {
        op_id: u64,
    },
    AtomicCommit {
        op_id: u64,
    },
    AtomicRollback {
        op_id: u64,
    },
    FileCreated {
        name: String,
        file_id: u32,
    },
    FileDeleted {
        file_id: u32,
    },
    PageOp {
        op_id: u64,
        file_id: u32,
        page_index: u32,
        /// Page LSN before this operation was applied. Undo restores it.
        prev_lsn: Lsn,
        op: PageOp,
    },
}

impl WalRecord {
    #[must_use]
    pub fn kind(&self) -> WalRecordKind {
        match self {
            Self::AtomicBegin { .. } => WalRecordKind::AtomicBegin,
            Self::AtomicCommit { .. } => WalRecordKind::AtomicCommit,
            Self::AtomicRollback { .. } => WalRecordKind::AtomicRollback,
            Self::FileCreated { .. } => WalRecordKind::FileCreated,
            Self::FileDeleted { .. } => WalRecordKind::FileDeleted,
            Self::PageOp { op, .. } => op.kind(),
        }
    }

    /// Operation-unit id this record belongs to, if any.
    #[must_use]
    pub fn op_id(&self) -> Option<u64> {
        match self {
            Self::AtomicBegin { op_id }
            | Self::AtomicCommit { op_id }
            | Self::AtomicRollback { op_id }
            | Self::PageOp { op_id, .. } => Some(*op_id),
            Self::FileCreated { .. } | Self::FileDeleted { .. } => None,
        }
    }

    /// Serializes the record payload (kind byte not included).
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();

        match self {
            Self::AtomicBegin { op_id } | Self::AtomicCommit { op_id } | Self::AtomicRollback { op_id } => {
                buf.extend_from_slice(&op_id.to_le_bytes());
            }

            Self::FileCreated { name, file_id } => {
                buf.extend_from_slice(&file_id.to_le_bytes());
                buf.extend_from_slice(&(name.len() as u32).to_le_bytes());
                buf.extend_from_slice(name.as_bytes());
            }

            Self::FileDeleted { file_id } => {
                buf.extend_from_slice(&file_id.to_le_bytes());
            }

            Self::PageOp {
                op_id,
                file_id,
                page_index,
                prev_lsn,
                op,
            } => {
                buf.extend_from_slice(&op_id.to_le_bytes());
                buf.extend_from_slice(&file_id.to_le_bytes());
                buf.extend_from_slice(&page_index.to_le_bytes());
                buf.extend_from_slice(&prev_lsn.to_le_bytes());

                match op {
                    PageOp::SetU8 { offset, new, prev } => {
                        buf.extend_from_slice(&offset.to_le_bytes());
                        buf.push(*new);
                        buf.push(*prev);
                    }
                    PageOp::SetU32 { offset, new, prev } => {
                        buf.extend_from_slice(&offset.to_le_bytes());
                        buf.extend_from_slice(&new.to_le_bytes());
                        buf.extend_from_slice(&prev.to_le_bytes());
                    }
                    PageOp::SetU64 { offset, new, prev } => {
                        buf.extend_from_slice(&offset.to_le_bytes());
                        buf.extend_from_slice(&new.to_le_bytes());
                        buf.extend_from_slice(&prev.to_le_bytes());
                    }
                    PageOp::SetBytes { offset, new, prev } => {
                        buf.extend_from_slice(&offset.to_le_bytes());
                        buf.extend_from_slice(&(new.len() as u32).to_le_bytes());
                        buf.extend_from_slice(new);
                        buf.extend_from_slice(prev);
                    }
                }
            }
        }

        buf
    }

    /// Deserializes a record from its kind and payload.
    pub fn decode_payload(kind: WalRecordKind, payload: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(payload);

        let record = match kind {
            WalRecordKind::AtomicBegin => Self::AtomicBegin {
                op_id: cursor.read_u64()?,
            },
            WalRecordKind::AtomicCommit => Self::AtomicCommit {
                op_id: cursor.read_u64()?,
            },
            WalRecordKind::AtomicRollback => Self::AtomicRollback {
                op_id: cursor.read_u64()?,
            },
            WalRecordKind::FileCreated => {
                let file_id = cursor.read_u32()?;
                let len = cursor.read_u32()? as usize;
                let bytes = cursor.read_bytes(len)?;
                let name = String::from_utf8(bytes.to_vec())
                    .map_err(|e| eyre::eyre!("invalid utf-8 in file-created record: {}", e))?;
                Self::FileCreated { name, file_id }
            }
            WalRecordKind::FileDeleted => Self::FileDeleted {
                file_id: cursor.read_u32()?,
            },
            WalRecordKind::PageSetU8
            | WalRecordKind::PageSetU32
            | WalRecordKind::PageSetU64
            | WalRecordKind::PageSetBytes => {
                let op_id = cursor.read_u64()?;
                let file_id = cursor.read_u32()?;
                let page_index = cursor.read_u32()?;
                let prev_lsn = cursor.read_u64()?;
                let offset = cursor.read_u32()?;

                let op = match kind {
                    WalRecordKind::PageSetU8 => PageOp::SetU8 {
                        offset,
                        new: cursor.read_u8()?,
                        prev: cursor.read_u8()?,
                    },
                    WalRecordKind::PageSetU32 => PageOp::SetU32 {
                        offset,
                        new: cursor.read_u32()?,
                        prev: cursor.read_u32()?,
                    },
                    WalRecordKind::PageSetU64 => PageOp::SetU64 {
                        offset,
                        new: cursor.read_u64()?,
                        prev: cursor.read_u64()?,
                    },
                    WalRecordKind::PageSetBytes => {
                        let len = cursor.read_u32()? as usize;
                        let new = cursor.read_bytes(len)?.to_vec();
                        let prev = cursor.read_bytes(len)?.to_vec();
                        PageOp::SetBytes { offset, new, prev }
                    }
                    _ => unreachable!(),
                };

                Self::PageOp {
                    op_id,
                    file_id,
                    page_index,
                    prev_lsn,
                    op,
                }
            }
        };

        ensure!(
            cursor.exhausted(),
            "trailing bytes in {:?} record: {} of {} consumed",
            kind,
            cursor.pos,
            payload.len()
        );

        Ok(record)
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn exhausted(&self) -> bool {
        self.pos == self.buf.len()
    }

    fn read_u8(&mut self) -> Result<u8> {
        if self.pos >= self.buf.len() {
            bail!("unexpected end of WAL record payload");
        }
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap())) // INVARIANT: read_bytes returned exactly 4
    }

    fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.read_bytes(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap())) // INVARIANT: read_bytes returned exactly 8
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.buf.len() {
            bail!("unexpected end of WAL record payload");
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(record: WalRecord) {
        let payload = record.encode_payload();
        let decoded = WalRecord::decode_payload(record.kind(), &payload).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn atomic_records_roundtrip() {
        roundtrip(WalRecord::AtomicBegin { op_id: 7 });
        roundtrip(WalRecord::AtomicCommit { op_id: u64::MAX });
        roundtrip(WalRecord::AtomicRollback { op_id: 0 });
    }

    #[test]
    fn file_records_roundtrip() {
        roundtrip(WalRecord::FileCreated {
            name: "accounts.pbt".to_string(),
            file_id: 12,
        });
        roundtrip(WalRecord::FileDeleted { file_id: 12 });
    }

    #[test]
    fn page_op_records_roundtrip() {
        roundtrip(WalRecord::PageOp {
            op_id: 1,
            file_id: 2,
            page_index: 3,
            prev_lsn: 9,
            op: PageOp::SetU8 {
                offset: 16,
                new: 0xAB,
                prev: 0xCD,
            },
        });
        roundtrip(WalRecord::PageOp {
            op_id: 1,
            file_id: 2,
            page_index: 3,
            prev_lsn: 9,
            op: PageOp::SetU32 {
                offset: 20,
                new: 77,
                prev: 66,
            },
        });
        roundtrip(WalRecord::PageOp {
            op_id: 1,
            file_id: 2,
            page_index: 3,
            prev_lsn: 9,
            op: PageOp::SetU64 {
                offset: 24,
                new: u64::MAX,
                prev: 0,
            },
        });
        roundtrip(WalRecord::PageOp {
            op_id: 1,
            file_id: 2,
            page_index: 3,
            prev_lsn: 9,
            op: PageOp::SetBytes {
                offset: 100,
                new: vec![1, 2, 3, 4],
                prev: vec![9, 8, 7, 6],
            },
        });
    }

    #[test]
    fn redo_then_undo_restores_page() {
        let mut page = vec![0u8; 256];
        page[100..104].copy_from_slice(&[9, 8, 7, 6]);
        let original = page.clone();

        let op = PageOp::SetBytes {
            offset: 100,
            new: vec![1, 2, 3, 4],
            prev: vec![9, 8, 7, 6],
        };

        op.redo(&mut page);
        assert_eq!(&page[100..104], &[1, 2, 3, 4]);

        op.undo(&mut page);
        assert_eq!(page, original);
    }

    #[test]
    fn undo_then_redo_is_inverse_for_scalars() {
        let mut page = vec![0u8; 64];
        let op = PageOp::SetU64 {
            offset: 8,
            new: 0x1122_3344_5566_7788,
            prev: 0,
        };

        op.redo(&mut page);
        let after_redo = page.clone();
        op.undo(&mut page);
        assert_eq!(&page[8..16], &[0u8; 8]);
        op.redo(&mut page);
        assert_eq!(page, after_redo);
    }

    #[test]
    fn truncated_payload_rejected() {
        let record = WalRecord::FileCreated {
            name: "x.pbt".to_string(),
            file_id: 1,
        };
        let payload = record.encode_payload();
        let result = WalRecord::decode_payload(WalRecordKind::FileCreated, &payload[..4]);
        assert!(result.is_err());
    }

    #[test]
    fn trailing_bytes_rejected() {
        let record = WalRecord::AtomicCommit { op_id: 5 };
        let mut payload = record.encode_payload();
        payload.push(0);
        let result = WalRecord::decode_payload(WalRecordKind::AtomicCommit, &payload);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("trailing bytes"));
    }

    #[test]
    fn kind_byte_roundtrip() {
        for byte in 1u8..=9 {
            let kind = WalRecordKind::from_byte(byte).unwrap();
            assert_eq!(kind.as_byte(), byte);
        }
        assert!(WalRecordKind::from_byte(0).is_none());
        assert!(WalRecordKind::from_byte(10).is_none());
    }
}
