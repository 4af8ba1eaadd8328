//! # Value Pages
//!
//! Values too large to embed in a leaf entry live in a singly linked chain
//! of dedicated pages; the leaf stores the head page index. Chains are
//! written back-to-front so each page can point at its successor without a
//! second pass.
//!
//! ## Layout (from `PAGE_DATA_OFFSET`)
//!
//! ```text
//! Offset  Size  Field
//! 16      4     next_page     chain link, NIL_PAGE at the end
//! 20      4     chunk_len     bytes of value data in this page
//! 24      *     value data
//! ```

use eyre::{ensure, Result};

use crate::atomic::AtomicHandle;
use crate::config::{PAGE_DATA_OFFSET, PAGE_SIZE};
use crate::engine::Engine;

use super::bucket::NIL_PAGE;

pub const NEXT_PAGE_OFFSET: usize = PAGE_DATA_OFFSET;
pub const CHUNK_LEN_OFFSET: usize = NEXT_PAGE_OFFSET + 4;
pub const CHUNK_DATA_OFFSET: usize = CHUNK_LEN_OFFSET + 4;

/// Value bytes one page can hold.
pub const CHUNK_CAPACITY: usize = PAGE_SIZE - CHUNK_DATA_OFFSET;

/// Writes `value` as a page chain, returning the head page index.
pub fn write_chain(
    engine: &Engine,
    file_id: u32,
    value: &[u8],
    atomic: &AtomicHandle,
) -> Result<u32> {
    ensure!(!value.is_empty(), "value chains cannot be empty");

    let chunks: Vec<&[u8]> = value.chunks(CHUNK_CAPACITY).collect();
    let mut next = NIL_PAGE;

    for chunk in chunks.iter().rev() {
        let (mut page, page_index) = engine.add_page(file_id)?;
        page.set_u32(NEXT_PAGE_OFFSET, next);
        page.set_u32(CHUNK_LEN_OFFSET, chunk.len() as u32);
        page.set_bytes(CHUNK_DATA_OFFSET, chunk);
        engine.release_page(page, atomic)?;
        next = page_index;
    }

    Ok(next)
}

/// Reassembles a value from the chain starting at `head`.
pub fn read_chain(engine: &Engine, file_id: u32, head: u32) -> Result<Vec<u8>> {
    let mut value = Vec::new();
    let mut page_index = head;
    let mut hops = 0u32;

    while page_index != NIL_PAGE {
        ensure!(
            hops <= engine.filled_up_to(file_id)?,
            "value chain longer than the file; link cycle at page {}",
            page_index
        );
        hops += 1;

        let view = engine.load_for_read(file_id, page_index)?;
        let chunk_len = view.get_u32(CHUNK_LEN_OFFSET) as usize;
        ensure!(
            chunk_len <= CHUNK_CAPACITY,
            "value chunk of {} bytes exceeds page capacity",
            chunk_len
        );
        value.extend_from_slice(view.get_bytes(CHUNK_DATA_OFFSET, chunk_len));
        page_index = view.get_u32(NEXT_PAGE_OFFSET);
    }

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, Arc<Engine>, u32) {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        let file_id = engine
            .atomic()
            .run_atomic("test", |atomic| engine.add_file("values.pbt", atomic))
            .unwrap();
        (dir, engine, file_id)
    }

    #[test]
    fn single_page_chain_roundtrip() {
        let (_dir, engine, file_id) = setup();
        let value = vec![0xABu8; 100];

        let head = engine
            .atomic()
            .run_atomic("test", |atomic| write_chain(&engine, file_id, &value, atomic))
            .unwrap();

        assert_eq!(read_chain(&engine, file_id, head).unwrap(), value);
    }

    #[test]
    fn multi_page_chain_roundtrip() {
        let (_dir, engine, file_id) = setup();
        let value: Vec<u8> = (0..CHUNK_CAPACITY * 2 + 1000)
            .map(|i| (i % 251) as u8)
            .collect();

        let head = engine
            .atomic()
            .run_atomic("test", |atomic| write_chain(&engine, file_id, &value, atomic))
            .unwrap();

        assert_eq!(engine.filled_up_to(file_id).unwrap(), 3);
        assert_eq!(read_chain(&engine, file_id, head).unwrap(), value);
    }

    #[test]
    fn chains_survive_recovery() {
        let dir = tempdir().unwrap();
        let value: Vec<u8> = (0..CHUNK_CAPACITY + 7).map(|i| (i % 201) as u8).collect();
        let head;
        {
            let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
            let file_id = engine
                .atomic()
                .run_atomic("test", |atomic| engine.add_file("values.pbt", atomic))
                .unwrap();
            head = engine
                .atomic()
                .run_atomic("test", |atomic| {
                    write_chain(&engine, file_id, &value, atomic)
                })
                .unwrap();
        }

        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        let file_id = engine.open_file("values.pbt").unwrap();
        assert_eq!(read_chain(&engine, file_id, head).unwrap(), value);
    }
}
