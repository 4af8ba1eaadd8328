//! # Tessera - Durable Paginated Indexing Engine
//!
//! Tessera is an embedded storage engine providing durable ordered indexes
//! and record-position maps over fixed-size pages. Every mutation is
//! journalled to a write-ahead log before its page can reach a data file,
//! and multi-page operations commit or roll back as atomic units.
//!
//! ## Quick Start
//!
//! ```ignore
//! use tessera::{Engine, EngineConfig, PrefixTree};
//!
//! let engine = Engine::open("./data", EngineConfig::default())?;
//!
//! let tree = PrefixTree::create(engine.clone(), "accounts", false, None)?;
//! tree.put("alice", b"1000")?;
//! assert_eq!(tree.get("alice")?, Some(b"1000".to_vec()));
//!
//! let mut cursor = tree.iterate_entries_major("a", true, true);
//! while let Some((key, value)) = cursor.next()? {
//!     println!("{key} = {value:?}");
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  Index structures                                     │
//! │  PrefixTree │ BonsaiTree │ HashDirectory │ PositionMap│
//! ├──────────────────────────────────────────────────────┤
//! │  Engine context (atomic ops, file lifecycle, locks)   │
//! ├──────────────────────────────────────────────────────┤
//! │  DurablePage (journalled mutations)                   │
//! ├───────────────────────────┬──────────────────────────┤
//! │  PageCache (pins, LRU)    │  Write-Ahead Log (LSN)   │
//! ├───────────────────────────┴──────────────────────────┤
//! │  WriteCache (files, paged IO, fsync)                  │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Durability Model
//!
//! - Every page mutation primitive emits one WAL page operation carrying
//!   both the new and the previous bytes.
//! - Pages are written back only once the WAL is durable through their LSN.
//! - An atomic operation's commit record is flushed before the operation
//!   reports success; rollback undoes the buffered operations in reverse.
//! - Opening an engine replays the log: committed operations are redone
//!   where pages missed them, interrupted ones are undone.
//!
//! ## File Layout
//!
//! ```text
//! engine_dir/
//! ├── accounts.pbt         # prefix B+-tree data
//! ├── accounts.npt         # its null-key bucket (optional)
//! ├── links.bonsai         # bonsai trees (many per file)
//! ├── router.hid           # extendible hash directory
//! ├── positions.cpm        # cluster position map
//! └── wal/
//!     └── wal.000001       # write-ahead log segments
//! ```

pub mod atomic;
pub mod bonsai;
pub mod btree;
pub mod cluster;
pub mod config;
pub mod crypto;
pub mod encoding;
pub mod engine;
pub mod hashdir;
pub mod serializer;
pub mod storage;
pub mod wal;

pub use bonsai::{BonsaiPointer, BonsaiTree};
pub use btree::{PrefixTree, UpdateAction, Validator, ValidatorResult};
pub use cluster::{ClusterPositionMap, PositionEntry};
pub use config::EngineConfig;
pub use engine::Engine;
pub use hashdir::HashDirectory;
