//! Tests for Engine
//!
//! These tests verify:
//! - Engine lifecycle (open/close/reopen)
//! - Writes and point reads across memtables and segments
//! - Flushes triggered by memory pressure
//! - Backpressure when flushing cannot keep up
//! - Schema changes and compaction through the engine
//! - Concurrent access patterns

#[path = "../common/mod.rs"]
mod common;

use std::fs;
use std::sync::Arc;
use std::thread;

use atlastable::{
    AtlasError, ColumnKind, ColumnType, Config, Engine, MemoryPressure, Mutation, MutationReader, PartitionRange,
};
use common::*;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn config(dir: &TempDir) -> Config {
    Config::builder()
        .data_dir(dir.path())
        .sync_segments(false)
        .build()
}

fn setup_temp_engine() -> (TempDir, Engine) {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open(config(&temp_dir), schema()).unwrap();
    (temp_dir, engine)
}

/// Engine that flushes after a few kilobytes of writes
fn setup_temp_engine_with_small_limits(soft: usize, hard: usize) -> (TempDir, Engine) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .sync_segments(false)
        .dirty_soft_limit(soft)
        .dirty_hard_limit(hard)
        .build();
    let engine = Engine::open(config, schema()).unwrap();
    (temp_dir, engine)
}

/// A write carrying a 512-byte value
fn large_write(engine: &Engine, n: u32, ts: i64) -> Mutation {
    let mut m = Mutation::new(engine.schema(), key(n % 20));
    m.set_clustered_cell(ck(n), "v", vec![n as u8; 512], ts).unwrap();
    m
}

fn read_everything(engine: &Engine) -> Vec<Mutation> {
    let mut reader = engine.make_reader(engine.schema(), PartitionRange::full()).unwrap();
    read_all(&mut reader)
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_engine_open_creates_directories() {
    let temp_dir = TempDir::new().unwrap();
    let data_dir = temp_dir.path().join("table");

    let engine = Engine::open_path(&data_dir, schema()).unwrap();

    assert!(data_dir.exists());
    assert!(engine.storage_dir().exists());
    assert_eq!(engine.storage_dir(), data_dir.join("segments"));
    assert_eq!(engine.segment_count(), 0);
    assert!(engine.active_memtable().is_empty());
}

#[test]
fn test_engine_rejects_inconsistent_limits() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .dirty_soft_limit(1024)
        .dirty_hard_limit(512)
        .build();

    let err = Engine::open(config, schema()).err().unwrap();
    assert!(matches!(err, AtlasError::Config(_)));
}

#[test]
fn test_close_flushes_and_reopen_loads_segments() {
    let temp_dir = TempDir::new().unwrap();
    let s = schema();
    let batch = MutationGenerator::new(1, s.clone(), sorted_keys(12)).batch(120);
    {
        let engine = Engine::open(config(&temp_dir), s.clone()).unwrap();
        for m in &batch {
            engine.apply(m).unwrap();
        }
        engine.close().unwrap();
    }

    let engine = Engine::open(config(&temp_dir), s.clone()).unwrap();
    assert_eq!(engine.segment_count(), 1);
    assert!(engine.active_memtable().is_empty());
    assert_eq!(read_everything(&engine), reconcile(&batch));
}

// =============================================================================
// Read/Write Tests
// =============================================================================

#[test]
fn test_apply_and_find() {
    let (_dir, engine) = setup_temp_engine();
    let s = engine.schema();

    engine.apply(&cell_mutation(&s, &key(1), 1, "first", 1)).unwrap();
    engine.apply(&cell_mutation(&s, &key(1), 1, "second", 2)).unwrap();

    let found = engine.find(&key(1)).unwrap().unwrap();
    assert_eq!(value_of(&found, 1), Some(b"second".to_vec()));
    assert!(engine.find(&key(2)).unwrap().is_none());
}

#[test]
fn test_flush_moves_data_to_segment() {
    let (_dir, engine) = setup_temp_engine();
    let s = engine.schema();
    let batch = MutationGenerator::new(2, s.clone(), sorted_keys(10)).batch(80);
    for m in &batch {
        engine.apply(m).unwrap();
    }

    let summary = engine.flush().unwrap().unwrap();
    assert_eq!(summary.partitions, reconcile(&batch).len());
    assert!(summary.bytes > 0);
    assert_eq!(engine.segment_count(), 1);
    assert_eq!(engine.sealed_count(), 0);
    assert!(engine.active_memtable().is_empty());
    assert_eq!(engine.memory_manager().virtual_dirty_memory(), 0);

    assert_eq!(read_everything(&engine), reconcile(&batch));
    // Nothing left to flush
    assert!(engine.flush().unwrap().is_none());
}

#[test]
fn test_reads_reconcile_every_generation() {
    let (_dir, engine) = setup_temp_engine();
    let s = engine.schema();
    let mut generator = MutationGenerator::new(3, s.clone(), sorted_keys(15));
    let mut applied = Vec::new();

    for round in 0..3 {
        for m in generator.batch(50) {
            engine.apply(&m).unwrap();
            applied.push(m);
        }
        if round < 2 {
            engine.flush().unwrap();
        }
    }

    assert_eq!(engine.segment_count(), 2);
    let expected = reconcile(&applied);
    assert_eq!(read_everything(&engine), expected);
    for m in &expected {
        assert_eq!(engine.find(m.key()).unwrap().as_ref(), Some(m));
    }
}

#[test]
fn test_ranged_engine_reader_fast_forwards() {
    let (_dir, engine) = setup_temp_engine();
    let s = engine.schema();
    let keys = sorted_keys(10);
    for k in keys.iter().step_by(2) {
        engine.apply(&cell_mutation(&s, k, 1, "old", 1)).unwrap();
    }
    engine.flush().unwrap();
    for k in keys.iter().skip(1).step_by(2) {
        engine.apply(&cell_mutation(&s, k, 1, "new", 2)).unwrap();
    }

    let mut reader = engine
        .make_reader(s.clone(), PartitionRange::between(keys[0].clone(), keys[3].clone()))
        .unwrap();
    assert_eq!(keys_of(&read_all(&mut reader)), keys[0..3].to_vec());

    reader
        .fast_forward_to(PartitionRange::starting_with(keys[7].clone()))
        .unwrap();
    assert_eq!(keys_of(&read_all(&mut reader)), keys[7..].to_vec());
}

// =============================================================================
// Memory Pressure Tests
// =============================================================================

#[test]
fn test_soft_limit_triggers_flush() {
    let (_dir, engine) = setup_temp_engine_with_small_limits(16 * 1024, 64 * 1024 * 1024);
    let mut applied = Vec::new();

    for n in 0..200 {
        let m = large_write(&engine, n, n as i64 + 1);
        engine.apply(&m).unwrap();
        applied.push(m);
    }

    assert!(engine.segment_count() >= 1);
    assert!(engine.memory_manager().virtual_dirty_memory() < 16 * 1024 + 4096);
    assert_eq!(read_everything(&engine), reconcile(&applied));
}

#[test]
fn test_backpressure_when_flush_cannot_proceed() {
    let (_dir, engine) = setup_temp_engine_with_small_limits(4 * 1024, 16 * 1024);
    fs::remove_dir_all(engine.storage_dir()).unwrap();

    let mut applied = Vec::new();
    let mut rejected = None;
    for n in 0..1000 {
        let m = large_write(&engine, n, n as i64 + 1);
        match engine.apply(&m) {
            Ok(()) => applied.push(m),
            Err(err) => {
                rejected = Some(err);
                break;
            }
        }
    }

    match rejected {
        Some(AtlasError::Backpressure { virtual_dirty, limit }) => {
            assert_eq!(limit, 16 * 1024);
            assert!(virtual_dirty >= limit);
        }
        other => panic!("expected backpressure, got {:?}", other),
    }
    assert!(engine.sealed_count() >= 1);
    assert_eq!(engine.memory_manager().pressure(), MemoryPressure::Throttle);
    // Sealed memtables still serve reads
    assert_eq!(read_everything(&engine), reconcile(&applied));

    fs::create_dir_all(engine.storage_dir()).unwrap();
    let summary = engine.flush().unwrap().unwrap();
    assert_eq!(engine.sealed_count(), 0);
    assert!(summary.partitions > 0);
    assert_eq!(engine.memory_manager().virtual_dirty_memory(), 0);
    assert_eq!(engine.memory_manager().pressure(), MemoryPressure::Normal);

    let m = large_write(&engine, 5000, 5000);
    engine.apply(&m).unwrap();
    applied.push(m);
    assert_eq!(read_everything(&engine), reconcile(&applied));
}

// =============================================================================
// Schema and Compaction Tests
// =============================================================================

#[test]
fn test_set_schema_applies_to_new_writes_and_old_segments() {
    let (_dir, engine) = setup_temp_engine();
    let s1 = engine.schema();
    engine.apply(&cell_mutation(&s1, &key(1), 1, "before", 1)).unwrap();
    engine.flush().unwrap();

    let s2 = schema_builder()
        .with_column("added", ColumnType::Text, ColumnKind::Regular)
        .build();
    engine.set_schema(s2.clone()).unwrap();
    assert_eq!(engine.schema().version(), s2.version());

    let mut m = Mutation::new(s2.clone(), key(1));
    m.set_clustered_cell(ck(2), "added", &b"after"[..], 2).unwrap();
    engine.apply(&m).unwrap();

    let found = engine.find(&key(1)).unwrap().unwrap();
    assert_eq!(found.schema().version(), s2.version());
    assert_eq!(value_of(&found, 1), Some(b"before".to_vec()));
    let added = found.partition().row(&ck(2)).and_then(|r| r.cell("added")).unwrap();
    assert_eq!(added.value().map(|v| v.to_vec()), Some(b"after".to_vec()));
}

#[test]
fn test_reopen_after_set_schema_upgrades_old_segments() {
    let temp_dir = TempDir::new().unwrap();
    let s1 = schema();
    let s2 = schema_builder().without_column("s1").build();
    {
        let engine = Engine::open(config(&temp_dir), s1.clone()).unwrap();
        let mut m = cell_mutation(&s1, &key(1), 1, "kept", 1);
        m.set_static_cell("s1", &b"dropped"[..], 1).unwrap();
        engine.apply(&m).unwrap();
        engine.flush().unwrap();

        engine.set_schema(s2.clone()).unwrap();
        let found = engine.find(&key(1)).unwrap().unwrap();
        assert!(found.partition().static_row().cell("s1").is_none());
        engine.close().unwrap();
    }

    let engine = Engine::open(config(&temp_dir), s2.clone()).unwrap();
    assert_eq!(engine.segment_count(), 1);
    let found = engine.find(&key(1)).unwrap().unwrap();
    assert!(found.partition().static_row().cell("s1").is_none());
    assert_eq!(value_of(&found, 1), Some(b"kept".to_vec()));
}

#[test]
fn test_reopen_with_incompatible_column_reuse_is_integrity_error() {
    let temp_dir = TempDir::new().unwrap();
    let s1 = schema();
    {
        let engine = Engine::open(config(&temp_dir), s1.clone()).unwrap();
        engine.apply(&cell_mutation(&s1, &key(1), 1, "bytes", 1)).unwrap();
        engine.close().unwrap();
    }

    let reused = schema_builder()
        .with_column("v", ColumnType::Int, ColumnKind::Regular)
        .build();
    let engine = Engine::open(config(&temp_dir), reused).unwrap();
    assert!(matches!(engine.find(&key(1)), Err(AtlasError::DataIntegrity(_))));
}

#[test]
fn test_set_incompatible_schema_is_rejected() {
    let (_dir, engine) = setup_temp_engine();
    let before = engine.schema();
    let bad = schema_builder()
        .with_column("v", ColumnType::Int, ColumnKind::Regular)
        .build();

    assert!(matches!(engine.set_schema(bad), Err(AtlasError::DataIntegrity(_))));
    assert_eq!(engine.schema().version(), before.version());
}

#[test]
fn test_full_compaction_keeps_content() {
    let (_dir, engine) = setup_temp_engine();
    let s = engine.schema();
    let batch = MutationGenerator::new(4, s.clone(), sorted_keys(8)).batch(100);
    for m in &batch {
        engine.apply(m).unwrap();
    }

    let stats = engine.full_compaction();
    assert_eq!(stats.partitions_visited, engine.active_memtable().partition_count());
    assert_eq!(engine.active_memtable().version_count(), engine.active_memtable().partition_count());
    assert_eq!(read_everything(&engine), reconcile(&batch));
    engine.request_reclaim().unwrap();
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_concurrent_writers_with_flushes() {
    let (_dir, engine) = setup_temp_engine_with_small_limits(32 * 1024, 64 * 1024 * 1024);
    let engine = Arc::new(engine);

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let mut applied = Vec::new();
                for i in 0..100u32 {
                    let n = t * 1000 + i;
                    let m = large_write(&engine, n, n as i64 + 1);
                    engine.apply(&m).unwrap();
                    applied.push(m);
                }
                applied
            })
        })
        .collect();

    let mut applied = Vec::new();
    for handle in handles {
        applied.extend(handle.join().unwrap());
    }

    assert!(engine.segment_count() >= 1);
    assert_eq!(read_everything(&engine), reconcile(&applied));

    let engine = Arc::try_unwrap(engine).ok().unwrap();
    engine.close().unwrap();
}

#[test]
fn test_readers_during_flush_never_miss_data() {
    let (_dir, engine) = setup_temp_engine();
    let s = engine.schema();
    let keys = sorted_keys(30);
    for k in &keys {
        engine.apply(&cell_mutation(&s, k, 1, "x", 1)).unwrap();
    }
    let engine = Arc::new(engine);

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let keys = keys.clone();
            thread::spawn(move || {
                for _ in 0..20 {
                    assert_eq!(keys_of(&read_everything(&engine)), keys);
                }
            })
        })
        .collect();

    engine.flush().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(engine.segment_count(), 1);
}
