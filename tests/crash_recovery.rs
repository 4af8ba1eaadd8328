//! Crash-consistency scenarios: committed work survives losing the page
//! cache, interrupted work vanishes, and replay is idempotent.

use std::sync::Arc;

use tempfile::tempdir;
use tessera::btree::PrefixTree;
use tessera::config::PAGE_SIZE;
use tessera::{Engine, EngineConfig};

#[test]
fn committed_insert_survives_cache_loss() {
    let dir = tempdir().unwrap();

    {
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        let tree = PrefixTree::create(Arc::clone(&engine), "kv", false, None).unwrap();
        for i in 0..1000u32 {
            tree.put(&format!("key{:06}", i), &i.to_le_bytes()).unwrap();
        }
        // Simulated crash: volatile state is dropped, nothing was flushed
        // to the data files, the WAL survives.
        engine.drop_page_cache();
    }

    let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
    let tree = PrefixTree::open(engine, "kv", None).unwrap();

    assert_eq!(tree.size().unwrap(), 1000);
    for i in 0..1000u32 {
        assert_eq!(
            tree.get(&format!("key{:06}", i)).unwrap(),
            Some(i.to_le_bytes().to_vec()),
            "key{:06} lost in replay",
            i
        );
    }
}

#[test]
fn rolled_back_insert_leaves_no_trace() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
    let tree = PrefixTree::create(Arc::clone(&engine), "kv", false, None).unwrap();

    tree.put("seed", b"1").unwrap();
    let root_lsn_before = {
        let view = engine.load_for_read(engine.open_file("kv.pbt").unwrap(), 0).unwrap();
        view.lsn()
    };

    // An explicit atomic scope around an insert, ended with rollback.
    let atomic_manager = engine.atomic();
    atomic_manager.start("test").unwrap();
    tree.put("x", b"1").unwrap();
    atomic_manager.end(true).unwrap();

    assert_eq!(tree.get("x").unwrap(), None);
    assert_eq!(tree.get("seed").unwrap(), Some(b"1".to_vec()));

    let root_lsn_after = {
        let view = engine.load_for_read(engine.open_file("kv.pbt").unwrap(), 0).unwrap();
        view.lsn()
    };
    assert_eq!(
        root_lsn_after, root_lsn_before,
        "rollback must restore the pre-operation root LSN"
    );
}

#[test]
fn replay_after_partial_flush_is_byte_identical() {
    let dir = tempdir().unwrap();

    // Build state, flush everything, snapshot the data file.
    {
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        let tree = PrefixTree::create(Arc::clone(&engine), "kv", false, None).unwrap();
        for i in 0..500u32 {
            tree.put(&format!("key{:06}", i), &i.to_le_bytes()).unwrap();
        }
        engine.flush_all().unwrap();
    }
    let flushed = std::fs::read(dir.path().join("kv.pbt")).unwrap();
    assert!(flushed.len() >= PAGE_SIZE);

    // Truncate the data file back to nothing (lost page writes) while
    // keeping the WAL; replay must reproduce the same bytes.
    std::fs::write(dir.path().join("kv.pbt"), []).unwrap();

    {
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        assert!(engine.recovery_stats().redone_records > 0);
        engine.flush_all().unwrap();
    }

    let replayed = std::fs::read(dir.path().join("kv.pbt")).unwrap();
    assert_eq!(flushed.len(), replayed.len());
    assert_eq!(flushed, replayed, "replayed pages differ from committed pages");
}

#[test]
fn double_recovery_is_idempotent() {
    let dir = tempdir().unwrap();

    {
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        let tree = PrefixTree::create(Arc::clone(&engine), "kv", false, None).unwrap();
        for i in 0..200u32 {
            tree.put(&format!("k{}", i), b"v").unwrap();
        }
        engine.drop_page_cache();
    }

    // Recover twice in a row; the second run must find nothing to redo
    // beyond what the LSN guards skip, and the data must be intact.
    {
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        drop(engine);
    }
    let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
    let tree = PrefixTree::open(engine, "kv", None).unwrap();
    assert_eq!(tree.size().unwrap(), 200);
}

#[test]
fn checkpoint_then_reopen_is_clean() {
    let dir = tempdir().unwrap();

    {
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        let tree = PrefixTree::create(Arc::clone(&engine), "kv", false, None).unwrap();
        for i in 0..100u32 {
            tree.put(&format!("k{}", i), b"v").unwrap();
        }
        engine.checkpoint().unwrap();
    }

    let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
    assert!(engine.recovery_stats().is_clean());
    let tree = PrefixTree::open(engine, "kv", None).unwrap();
    assert_eq!(tree.size().unwrap(), 100);
}

#[test]
fn mixed_committed_and_removed_keys_recover() {
    let dir = tempdir().unwrap();

    {
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        let tree = PrefixTree::create(Arc::clone(&engine), "kv", false, None).unwrap();
        for i in 0..300u32 {
            tree.put(&format!("k{:04}", i), &i.to_le_bytes()).unwrap();
        }
        for i in (0..300u32).step_by(3) {
            tree.remove(&format!("k{:04}", i)).unwrap();
        }
        engine.drop_page_cache();
    }

    let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
    let tree = PrefixTree::open(engine, "kv", None).unwrap();

    assert_eq!(tree.size().unwrap(), 200);
    for i in 0..300u32 {
        let expected = if i % 3 == 0 {
            None
        } else {
            Some(i.to_le_bytes().to_vec())
        };
        assert_eq!(tree.get(&format!("k{:04}", i)).unwrap(), expected);
    }
}

#[test]
fn file_lifecycle_replays_idempotently() {
    let dir = tempdir().unwrap();

    {
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        let tree = PrefixTree::create(Arc::clone(&engine), "doomed", false, None).unwrap();
        tree.put("k", b"v").unwrap();
        tree.delete().unwrap();

        let survivor = PrefixTree::create(Arc::clone(&engine), "kept", false, None).unwrap();
        survivor.put("k", b"v").unwrap();
        engine.drop_page_cache();
    }

    let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
    assert!(!engine.file_exists("doomed.pbt"));
    assert!(engine.file_exists("kept.pbt"));

    let tree = PrefixTree::open(engine, "kept", None).unwrap();
    assert_eq!(tree.get("k").unwrap(), Some(b"v".to_vec()));
}
