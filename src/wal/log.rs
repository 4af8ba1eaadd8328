//! # Write-Ahead Log
//!
//! Append-only log of typed records ordered by LSN. All page mutations reach
//! the log before their pages reach the data files; the page cache consults
//! [`Wal::flushed_lsn`] before writing any dirty page back.
//!
//! ## Segment Layout
//!
//! The log is a sequence of segment files inside its own directory:
//!
//! ```text
//! engine_dir/
//! └── wal/
//!     ├── wal.000001       # sealed
//!     ├── wal.000002       # sealed
//!     └── wal.000003       # active, append position at end
//! ```
//!
//! A new segment is started once the active one passes the configured size.
//! Every segment opens with a fixed magic-bearing header; a wrong magic or
//! version is reported as corruption rather than scanned past.
//!
//! ## Frame Format
//!
//! ```text
//! +-------------+--------------------------+-----------+
//! | varint(len) | body                     | crc64     |
//! +-------------+--------------------------+-----------+
//!                 body = kind u8 | lsn u64 | payload
//! ```
//!
//! The CRC64 covers the body only. A frame that fails length or checksum
//! validation terminates a forward scan: it is the torn tail of an
//! interrupted append, and everything before it is intact.
//!
//! ## Durability
//!
//! `log()` assigns the LSN and buffers the frame; `flush()` writes the
//! buffer and fsyncs, after which `flushed_lsn()` covers every assigned LSN.
//! Appends spill the buffer to the OS once it passes `WRITE_BUFFER_LIMIT`
//! without fsyncing, so an unflushed tail can still be torn.

use std::fs::{create_dir_all, read_dir, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{ensure, Result, WrapErr};
use memmap2::Mmap;
use parking_lot::Mutex;
use tracing::{debug, trace};
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::record::{Lsn, WalRecord, WalRecordKind, NIL_LSN};
use crate::encoding::{decode_varint, encode_varint, varint_len};

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Pending appends are spilled to the OS past this many buffered bytes.
const WRITE_BUFFER_LIMIT: usize = 8 * 1024 * 1024;

const CRC_SIZE: usize = 8;

pub const SEGMENT_MAGIC: [u8; 8] = *b"TSSRWAL\x01";
pub const SEGMENT_VERSION: u32 = 1;

/// Fixed header at the start of every segment file.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct SegmentHeader {
    magic: [u8; 8],
    version: U32,
    reserved: U32,
}

pub const SEGMENT_HEADER_SIZE: usize = 16;

const _: () = assert!(std::mem::size_of::<SegmentHeader>() == SEGMENT_HEADER_SIZE);

impl SegmentHeader {
    fn new() -> Self {
        Self {
            magic: SEGMENT_MAGIC,
            version: U32::new(SEGMENT_VERSION),
            reserved: U32::new(0),
        }
    }

    fn validate(bytes: &[u8]) -> Result<()> {
        ensure!(
            bytes.len() >= SEGMENT_HEADER_SIZE,
            "WAL segment shorter than its header"
        );
        let header = Self::ref_from_bytes(&bytes[..SEGMENT_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse WAL segment header: {:?}", e))?;
        ensure!(
            header.magic == SEGMENT_MAGIC,
            "invalid magic in WAL segment header"
        );
        ensure!(
            header.version.get() == SEGMENT_VERSION,
            "unsupported WAL segment version {}",
            header.version.get()
        );
        Ok(())
    }
}

struct WalSegment {
    file: File,
    sequence: u64,
    offset: u64,
}

impl WalSegment {
    fn create(path: &Path, sequence: u64) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create WAL segment at {:?}", path))?;

        file.write_all(SegmentHeader::new().as_bytes())
            .wrap_err("failed to write WAL segment header")?;

        Ok(Self {
            file,
            sequence,
            offset: SEGMENT_HEADER_SIZE as u64,
        })
    }

    fn open_at_end(path: &Path, sequence: u64) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open WAL segment at {:?}", path))?;

        let mut header = [0u8; SEGMENT_HEADER_SIZE];
        let len = file.metadata().wrap_err("failed to stat WAL segment")?.len();
        if len < SEGMENT_HEADER_SIZE as u64 {
            // Torn creation: restart the segment from a clean header.
            file.set_len(0).wrap_err("failed to reset torn WAL segment")?;
            file.write_all(SegmentHeader::new().as_bytes())
                .wrap_err("failed to write WAL segment header")?;
        } else {
            file.read_exact(&mut header)
                .wrap_err("failed to read WAL segment header")?;
            SegmentHeader::validate(&header)?;
        }

        let offset = file
            .seek(SeekFrom::End(0))
            .wrap_err("failed to seek to end of WAL segment")?;

        Ok(Self {
            file,
            sequence,
            offset,
        })
    }
}

struct Appender {
    segment: WalSegment,
    buffer: Vec<u8>,
    next_lsn: Lsn,
}

pub struct Wal {
    dir: PathBuf,
    segment_size: u64,
    appender: Mutex<Appender>,
    flushed: AtomicU64,
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("dir", &self.dir)
            .field("segment_size", &self.segment_size)
            .finish()
    }
}

fn segment_path(dir: &Path, sequence: u64) -> PathBuf {
    dir.join(format!("wal.{:06}", sequence))
}

fn list_segments(dir: &Path) -> Result<Vec<u64>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut sequences = Vec::new();
    for entry in read_dir(dir).wrap_err_with(|| format!("failed to read WAL directory {:?}", dir))? {
        let entry = entry.wrap_err("failed to read WAL directory entry")?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(num) = name.strip_prefix("wal.") {
            if let Ok(sequence) = num.parse::<u64>() {
                sequences.push(sequence);
            }
        }
    }
    sequences.sort_unstable();
    Ok(sequences)
}

impl Wal {
    /// Opens (or creates) the log under `dir`, scanning existing segments to
    /// restore the LSN counter and the append position.
    pub fn open<P: AsRef<Path>>(dir: P, segment_size: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        create_dir_all(&dir)
            .wrap_err_with(|| format!("failed to create WAL directory at {:?}", dir))?;

        let sequences = list_segments(&dir)?;
        let mut last_lsn = NIL_LSN;

        for &sequence in &sequences {
            let path = segment_path(&dir, sequence);
            for frame in scan_segment(&path)? {
                last_lsn = frame.0;
            }
        }

        let segment = match sequences.last() {
            Some(&sequence) => WalSegment::open_at_end(&segment_path(&dir, sequence), sequence)?,
            None => WalSegment::create(&segment_path(&dir, 1), 1)?,
        };

        debug!(
            segments = sequences.len().max(1),
            last_lsn, "opened write-ahead log"
        );

        Ok(Self {
            dir,
            segment_size,
            appender: Mutex::new(Appender {
                segment,
                buffer: Vec::new(),
                next_lsn: last_lsn + 1,
            }),
            flushed: AtomicU64::new(last_lsn),
        })
    }

    /// Appends `record`, returning its assigned LSN. The record is buffered;
    /// call [`Self::flush`] (or `flush_through`) to make it durable.
    pub fn log(&self, record: &WalRecord) -> Result<Lsn> {
        let mut appender = self.appender.lock();

        let lsn = appender.next_lsn;
        appender.next_lsn += 1;

        let payload = record.encode_payload();
        let body_len = 1 + 8 + payload.len();

        let mut frame = Vec::with_capacity(varint_len(body_len as u64) + body_len + CRC_SIZE);
        let mut len_buf = [0u8; 9];
        let len_bytes = encode_varint(body_len as u64, &mut len_buf);
        frame.extend_from_slice(&len_buf[..len_bytes]);

        let body_start = frame.len();
        frame.push(record.kind().as_byte());
        frame.extend_from_slice(&lsn.to_le_bytes());
        frame.extend_from_slice(&payload);
        let crc = CRC64.checksum(&frame[body_start..]);
        frame.extend_from_slice(&crc.to_le_bytes());

        appender.buffer.extend_from_slice(&frame);
        trace!(lsn, kind = ?record.kind(), "logged WAL record");

        if appender.buffer.len() >= WRITE_BUFFER_LIMIT {
            self.spill(&mut appender)?;
        }

        Ok(lsn)
    }

    fn spill(&self, appender: &mut Appender) -> Result<()> {
        if appender.buffer.is_empty() {
            return Ok(());
        }

        if appender.segment.offset >= self.segment_size {
            let next = appender.segment.sequence + 1;
            appender.segment = WalSegment::create(&segment_path(&self.dir, next), next)?;
            debug!(sequence = next, "rotated WAL segment");
        }

        appender
            .segment
            .file
            .write_all(&appender.buffer)
            .wrap_err("failed to write WAL buffer")?;
        appender.segment.offset += appender.buffer.len() as u64;
        appender.buffer.clear();
        Ok(())
    }

    /// Makes the log durable through the latest assigned LSN.
    pub fn flush(&self) -> Result<()> {
        let mut appender = self.appender.lock();
        self.spill(&mut appender)?;
        appender
            .segment
            .file
            .sync_all()
            .wrap_err("failed to sync WAL segment")?;
        self.flushed.store(appender.next_lsn - 1, Ordering::Release);
        Ok(())
    }

    /// Makes the log durable through at least `lsn`.
    pub fn flush_through(&self, lsn: Lsn) -> Result<()> {
        if self.flushed_lsn() >= lsn {
            return Ok(());
        }
        self.flush()
    }

    /// Highest LSN known to be durable.
    pub fn flushed_lsn(&self) -> Lsn {
        self.flushed.load(Ordering::Acquire)
    }

    /// LSN the next appended record will receive.
    pub fn end_lsn(&self) -> Lsn {
        self.appender.lock().next_lsn
    }

    /// Reads records with `lsn >= from_lsn` in log order. The scan stops at
    /// the first torn or corrupt frame, which marks the end of the intact
    /// log.
    pub fn read_forward(&self, from_lsn: Lsn) -> Result<Vec<(Lsn, WalRecord)>> {
        {
            // Sealed bytes only: anything still buffered is by definition
            // not durable and invisible to recovery.
            let mut appender = self.appender.lock();
            self.spill(&mut appender)?;
        }

        let mut records = Vec::new();
        for sequence in list_segments(&self.dir)? {
            for (lsn, record) in scan_segment(&segment_path(&self.dir, sequence))? {
                if lsn >= from_lsn {
                    records.push((lsn, record));
                }
            }
        }
        Ok(records)
    }

    /// Drops all log content, starting a fresh segment. The LSN counter keeps
    /// counting forward. Used by the checkpoint path once every dirty page is
    /// safely in the data files.
    pub fn truncate(&self) -> Result<()> {
        let mut appender = self.appender.lock();
        appender.buffer.clear();

        let current = appender.segment.sequence;
        for sequence in list_segments(&self.dir)? {
            if sequence != current {
                let path = segment_path(&self.dir, sequence);
                std::fs::remove_file(&path)
                    .wrap_err_with(|| format!("failed to remove WAL segment {:?}", path))?;
            }
        }

        appender
            .segment
            .file
            .set_len(0)
            .wrap_err("failed to truncate WAL segment")?;
        appender
            .segment
            .file
            .seek(SeekFrom::Start(0))
            .wrap_err("failed to rewind WAL segment")?;
        appender
            .segment
            .file
            .write_all(SegmentHeader::new().as_bytes())
            .wrap_err("failed to rewrite WAL segment header")?;
        appender.segment.offset = SEGMENT_HEADER_SIZE as u64;
        self.flushed.store(appender.next_lsn - 1, Ordering::Release);

        debug!(next_lsn = appender.next_lsn, "truncated write-ahead log");
        Ok(())
    }
}

/// Parses every intact frame of one segment. A short, torn or checksum-failed
/// tail ends the scan without error.
fn scan_segment(path: &Path) -> Result<Vec<(Lsn, WalRecord)>> {
    let file = File::open(path).wrap_err_with(|| format!("failed to open WAL segment {:?}", path))?;
    let len = file.metadata().wrap_err("failed to stat WAL segment")?.len() as usize;
    // A segment shorter than its header is a creation torn by a crash; it
    // holds no records.
    if len < SEGMENT_HEADER_SIZE {
        return Ok(Vec::new());
    }

    // SAFETY: the mapping is read-only and private to this scan; appends go
    // through a different descriptor but only ever add bytes past `len`.
    let mmap = unsafe { Mmap::map(&file).wrap_err_with(|| format!("failed to mmap WAL segment {:?}", path))? };

    SegmentHeader::validate(&mmap[..SEGMENT_HEADER_SIZE])?;

    let mut records = Vec::new();
    let mut pos = SEGMENT_HEADER_SIZE;

    while pos < len {
        let (body_len, len_bytes) = match decode_varint(&mmap[pos..]) {
            Ok(v) => v,
            Err(_) => break,
        };
        let body_len = body_len as usize;
        let body_start = pos + len_bytes;
        let frame_end = body_start + body_len + CRC_SIZE;
        if body_len < 9 || frame_end > len {
            break;
        }

        let body = &mmap[body_start..body_start + body_len];
        let stored_crc = u64::from_le_bytes(
            mmap[body_start + body_len..frame_end].try_into().unwrap(), // INVARIANT: frame_end bounds checked above
        );
        if CRC64.checksum(body) != stored_crc {
            break;
        }

        let kind = match WalRecordKind::from_byte(body[0]) {
            Some(kind) => kind,
            None => break,
        };
        let lsn = u64::from_le_bytes(body[1..9].try_into().unwrap()); // INVARIANT: body_len >= 9 checked above
        let record = match WalRecord::decode_payload(kind, &body[9..]) {
            Ok(record) => record,
            Err(_) => break,
        };

        records.push((lsn, record));
        pos = frame_end;
    }

    Ok(records)
}
