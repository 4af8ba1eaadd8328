//! Write-ahead logging: typed records ordered by LSN and the segmented
//! append-only log that stores them.

mod log;
mod record;

pub use log::Wal;
pub use record::{Lsn, PageOp, WalRecord, WalRecordKind, NIL_LSN};
