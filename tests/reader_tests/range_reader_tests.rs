//! Reader Tests
//!
//! Tests verify:
//! - Range scoping and fast-forwarding
//! - Partition skipping
//! - Fragment order inside a partition
//! - Schema-tolerant reads
//! - Expiry against the injected clock
//! - Merging readers over several sources

#[path = "../common/mod.rs"]
mod common;

use std::sync::Arc;
use std::task::Poll;

use atlastable::reader::MergingReader;
use atlastable::storage::MemorySource;
use atlastable::{
    AtlasError, Clock, ClusteringKey, ColumnKind, ColumnType, DataSource, DirtyMemoryManager, Memtable, Mutation,
    MutationFragment, MutationReader, PartitionRange, RangeTombstone,
};
use common::*;

fn row_number(key: &ClusteringKey) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&key.0[0]);
    u32::from_be_bytes(buf)
}

fn filled(keys: &[atlastable::DecoratedKey]) -> (atlastable::SchemaPtr, Arc<Memtable>) {
    let s = schema();
    let mt = memtable(&s);
    for k in keys {
        mt.apply(&cell_mutation(&s, k, 1, "x", 1)).unwrap();
    }
    (s, mt)
}

// =============================================================================
// Ranges
// =============================================================================

#[test]
fn test_reader_respects_range_bounds() {
    let keys = sorted_keys(6);
    let (s, mt) = filled(&keys);

    let between = read_all(&mut mt.make_reader(s.clone(), PartitionRange::between(keys[1].clone(), keys[4].clone())));
    assert_eq!(keys_of(&between), keys[1..4].to_vec());

    let after = read_all(&mut mt.make_reader(s.clone(), PartitionRange::starting_after(keys[3].clone())));
    assert_eq!(keys_of(&after), keys[4..].to_vec());

    let single = read_all(&mut mt.make_reader(s.clone(), PartitionRange::singular(keys[2].clone())));
    assert_eq!(keys_of(&single), vec![keys[2].clone()]);

    let empty = read_all(&mut mt.make_reader(s.clone(), PartitionRange::between(keys[3].clone(), keys[3].clone())));
    assert!(empty.is_empty());
}

#[test]
fn test_end_of_stream_is_sticky() {
    let keys = sorted_keys(1);
    let (s, mt) = filled(&keys);
    let mut reader = mt.make_reader(s.clone(), PartitionRange::full());

    read_all(&mut reader);
    assert!(matches!(reader.poll_fragment().unwrap(), Poll::Ready(None)));
    assert!(reader.next_fragment().unwrap().is_none());
}

// =============================================================================
// Fast Forward
// =============================================================================

#[test]
fn test_fast_forward_yields_exactly_new_range() {
    let keys = sorted_keys(6);
    let (s, mt) = filled(&keys);
    let mut reader = mt.make_reader(s.clone(), PartitionRange::between(keys[0].clone(), keys[4].clone()));

    let first = reader.next_mutation().unwrap().unwrap();
    assert_eq!(first.key(), &keys[0]);

    reader
        .fast_forward_to(PartitionRange::between(keys[3].clone(), keys[5].clone()))
        .unwrap();

    let rest = read_all(&mut reader);
    assert_eq!(keys_of(&rest), vec![keys[3].clone(), keys[4].clone()]);
    assert!(reader.next_fragment().unwrap().is_none());
}

#[test]
fn test_fast_forward_after_exhaustion() {
    let keys = sorted_keys(6);
    let (s, mt) = filled(&keys);
    let mut reader = mt.make_reader(s.clone(), PartitionRange::between(keys[0].clone(), keys[2].clone()));

    assert_eq!(read_all(&mut reader).len(), 2);
    reader
        .fast_forward_to(PartitionRange::starting_with(keys[4].clone()))
        .unwrap();
    assert_eq!(keys_of(&read_all(&mut reader)), keys[4..].to_vec());
}

#[test]
fn test_fast_forward_backward_is_rejected() {
    let keys = sorted_keys(6);
    let (s, mt) = filled(&keys);
    let mut reader = mt.make_reader(s.clone(), PartitionRange::between(keys[2].clone(), keys[5].clone()));

    let err = reader
        .fast_forward_to(PartitionRange::between(keys[0].clone(), keys[3].clone()))
        .unwrap_err();
    assert!(matches!(err, AtlasError::PreconditionViolated(_)));
}

#[test]
fn test_fast_forward_over_consumed_partition_is_rejected() {
    let keys = sorted_keys(6);
    let (s, mt) = filled(&keys);
    let mut reader = mt.make_reader(s.clone(), PartitionRange::between(keys[0].clone(), keys[5].clone()));

    reader.next_mutation().unwrap();
    reader.next_mutation().unwrap();

    let err = reader
        .fast_forward_to(PartitionRange::starting_with(keys[1].clone()))
        .unwrap_err();
    assert!(matches!(err, AtlasError::PreconditionViolated(_)));
}

// =============================================================================
// Partition Skipping and Fragment Order
// =============================================================================

#[test]
fn test_next_partition_skips_rest_of_partition() {
    let s = schema();
    let mt = memtable(&s);
    let keys = sorted_keys(2);
    for row in 0..10 {
        mt.apply(&cell_mutation(&s, &keys[0], row, "x", 1)).unwrap();
    }
    mt.apply(&cell_mutation(&s, &keys[1], 1, "y", 1)).unwrap();

    let mut reader = mt.make_reader(s.clone(), PartitionRange::full());
    assert!(reader.next_fragment().unwrap().unwrap().is_partition_start());
    assert!(matches!(
        reader.next_fragment().unwrap(),
        Some(MutationFragment::ClusteringRow { .. })
    ));
    reader.next_partition().unwrap();

    match reader.next_fragment().unwrap() {
        Some(MutationFragment::PartitionStart { key, .. }) => assert_eq!(key, keys[1]),
        other => panic!("expected second partition, got {:?}", other),
    }
}

#[test]
fn test_fragments_follow_clustering_order() {
    let s = schema();
    let mt = memtable(&s);
    let k = key(1);

    let mut m = Mutation::new(s.clone(), k.clone());
    m.set_static_cell("s1", &b"static"[..], 1).unwrap();
    for row in [4, 0, 7, 2] {
        m.set_clustered_cell(ck(row), "v", &b"x"[..], 10).unwrap();
    }
    m.delete_range(RangeTombstone::closed(ck(5), ck(6), tombstone(5)));
    mt.apply(&m).unwrap();

    let mut reader = mt.make_reader(s.clone(), PartitionRange::full());
    let mut shape = Vec::new();
    while let Some(fragment) = reader.next_fragment().unwrap() {
        shape.push(match fragment {
            MutationFragment::PartitionStart { .. } => "start".to_string(),
            MutationFragment::StaticRow(_) => "static".to_string(),
            MutationFragment::ClusteringRow { key, .. } => format!("row{}", row_number(&key)),
            MutationFragment::RangeTombstone(_) => "rt".to_string(),
            MutationFragment::PartitionEnd => "end".to_string(),
        });
    }
    assert_eq!(shape, ["start", "static", "row0", "row2", "row4", "rt", "row7", "end"]);
}

#[test]
fn test_range_tombstone_shadows_rows_from_older_versions() {
    let s = schema();
    let mt = memtable(&s);
    let k = key(1);
    for row in 0..5 {
        mt.apply(&cell_mutation(&s, &k, row, "x", 1)).unwrap();
    }
    let pinned = pin(&mt, &s, &k);
    let mut delete = Mutation::new(s.clone(), k.clone());
    delete.delete_range(RangeTombstone::closed(ck(1), ck(3), tombstone(2)));
    mt.apply(&delete).unwrap();

    let read = read_all(&mut mt.make_reader(s.clone(), PartitionRange::full()));
    let rows: Vec<_> = read[0].partition().rows().keys().cloned().collect();
    assert_eq!(rows, vec![ck(0), ck(4)]);
    assert_eq!(pinned.finish().partition().row_count(), 5);
}

// =============================================================================
// Schema Tolerance
// =============================================================================

#[test]
fn test_reader_with_added_column_sees_it_absent() {
    let s1 = schema();
    let s2 = schema_builder()
        .with_column("added", ColumnType::Text, ColumnKind::Regular)
        .build();
    let mt = memtable(&s1);
    let mut generator = MutationGenerator::new(3, s1.clone(), sorted_keys(8));
    for m in generator.batch(60) {
        mt.apply(&m).unwrap();
    }

    let mut old_reader = mt.make_reader(s1.clone(), PartitionRange::full());
    let mut new_reader = mt.make_reader(s2.clone(), PartitionRange::full());
    let old_rows = read_all(&mut old_reader);
    let new_rows = read_all(&mut new_reader);

    let count = |ms: &[Mutation]| ms.iter().map(|m| m.partition().row_count()).sum::<usize>();
    assert_eq!(count(&old_rows), count(&new_rows));
    assert!(new_rows
        .iter()
        .flat_map(|m| m.partition().rows().values())
        .all(|row| row.cell("added").is_none()));
    assert!(new_rows.iter().all(|m| m.schema().version() == s2.version()));
}

#[test]
fn test_reader_with_dropped_column_omits_it() {
    let s1 = schema_builder()
        .with_column("extra", ColumnType::Text, ColumnKind::Regular)
        .build();
    let s2 = schema_builder().build();
    let mt = memtable(&s1);
    let k = key(1);

    let mut m = Mutation::new(s1.clone(), k.clone());
    m.set_clustered_cell(ck(1), "extra", &b"e"[..], 1).unwrap();
    m.set_clustered_cell(ck(2), "v", &b"v"[..], 1).unwrap();
    mt.apply(&m).unwrap();

    let read = read_all(&mut mt.make_reader(s2.clone(), PartitionRange::full()));
    // Row 1 held only the dropped column
    assert!(read[0].partition().row(&ck(1)).is_none());
    assert_eq!(value_of(&read[0], 2), Some(b"v".to_vec()));
}

#[test]
fn test_schema_change_between_partitions_of_one_reader() {
    let s1 = schema();
    let s2 = schema_builder()
        .with_column("added", ColumnType::Text, ColumnKind::Regular)
        .build();
    let mt = memtable(&s1);
    let keys = sorted_keys(3);
    for k in &keys {
        mt.apply(&cell_mutation(&s1, k, 1, "old", 1)).unwrap();
    }

    let mut reader = mt.make_reader(s1.clone(), PartitionRange::full());
    assert_eq!(reader.next_mutation().unwrap().unwrap().key(), &keys[0]);

    mt.set_schema(s2.clone()).unwrap();
    let mut m = Mutation::new(s2.clone(), keys[2].clone());
    m.set_clustered_cell(ck(2), "added", &b"new"[..], 2).unwrap();
    m.set_clustered_cell(ck(3), "v", &b"new"[..], 2).unwrap();
    mt.apply(&m).unwrap();

    let rest = read_all(&mut reader);
    assert_eq!(keys_of(&rest), keys[1..].to_vec());
    let last = &rest[1];
    assert!(last.partition().row(&ck(2)).is_none());
    assert_eq!(value_of(last, 3), Some(b"new".to_vec()));
    assert_eq!(value_of(last, 1), Some(b"old".to_vec()));
}

#[test]
fn test_incompatible_reader_schema_is_integrity_error() {
    let s1 = schema();
    let s2 = schema_builder()
        .with_column("v", ColumnType::Int, ColumnKind::Regular)
        .build();
    let mt = memtable(&s1);
    mt.apply(&cell_mutation(&s1, &key(1), 1, "x", 1)).unwrap();

    let mut reader = mt.make_reader(s2, PartitionRange::full());
    assert!(matches!(reader.next_fragment().unwrap_err(), AtlasError::DataIntegrity(_)));
}

// =============================================================================
// Expiry
// =============================================================================

#[test]
fn test_expired_cells_read_as_dead() {
    let s = schema();
    let clock = clock();
    let mt = Memtable::with_clock(s.clone(), DirtyMemoryManager::unlimited(), clock.clone());
    let k = key(1);

    let mut m = Mutation::new(s.clone(), k.clone());
    m.set_expiring_cell(ck(1), "v", &b"ttl"[..], 1, 60, clock.now()).unwrap();
    mt.apply(&m).unwrap();

    let live = read_all(&mut mt.make_reader(s.clone(), PartitionRange::full()));
    assert_eq!(value_of(&live[0], 1), Some(b"ttl".to_vec()));

    clock.advance(60);
    let expired = read_all(&mut mt.make_reader(s.clone(), PartitionRange::full()));
    let cell = expired[0].partition().row(&ck(1)).unwrap().cell("v").unwrap();
    assert!(cell.is_dead_marker());
}

// =============================================================================
// Merging Reader
// =============================================================================

#[test]
fn test_merging_reader_reconciles_overlapping_sources() {
    let s = schema();
    let keys = sorted_keys(6);
    let mut generator = MutationGenerator::new(17, s.clone(), keys.clone());
    let first = generator.batch(30);
    let second = generator.batch(30);

    let mt = memtable(&s);
    for m in &first {
        mt.apply(m).unwrap();
    }
    let source = Arc::new(MemorySource::new(s.clone(), second.clone()).unwrap().with_clock(clock()));

    let readers: Vec<Box<dyn MutationReader>> = vec![
        Box::new(mt.make_reader(s.clone(), PartitionRange::full())),
        source.create_reader(s.clone(), PartitionRange::full()).unwrap(),
    ];
    let mut merged = MergingReader::new(s.clone(), PartitionRange::full(), readers);
    assert_eq!(merged.source_count(), 2);

    let all: Vec<Mutation> = first.iter().chain(second.iter()).cloned().collect();
    assert_eq!(read_all(&mut merged), reconcile(&all));
}

#[test]
fn test_merging_reader_fast_forward() {
    let s = schema();
    let keys = sorted_keys(8);
    let mt = memtable(&s);
    for k in keys.iter().step_by(2) {
        mt.apply(&cell_mutation(&s, k, 1, "mem", 1)).unwrap();
    }
    let source = Arc::new(
        MemorySource::new(
            s.clone(),
            keys.iter().skip(1).step_by(2).map(|k| cell_mutation(&s, k, 1, "src", 1)),
        )
        .unwrap(),
    );

    let range = PartitionRange::between(keys[0].clone(), keys[3].clone());
    let readers: Vec<Box<dyn MutationReader>> = vec![
        Box::new(mt.make_reader(s.clone(), range.clone())),
        source.create_reader(s.clone(), range.clone()).unwrap(),
    ];
    let mut merged = MergingReader::new(s.clone(), range, readers);

    assert_eq!(merged.next_mutation().unwrap().unwrap().key(), &keys[0]);
    merged
        .fast_forward_to(PartitionRange::between(keys[5].clone(), keys[7].clone()))
        .unwrap();
    assert_eq!(keys_of(&read_all(&mut merged)), vec![keys[5].clone(), keys[6].clone()]);
}

#[test]
fn test_memory_source_reader_fast_forward() {
    let s = schema();
    let keys = sorted_keys(5);
    let source = Arc::new(
        MemorySource::new(s.clone(), keys.iter().map(|k| cell_mutation(&s, k, 1, "x", 1))).unwrap(),
    );
    assert_eq!(source.len(), 5);

    let mut reader = source
        .clone()
        .create_reader(s.clone(), PartitionRange::between(keys[0].clone(), keys[2].clone()))
        .unwrap();
    assert_eq!(keys_of(&read_all(&mut reader)), keys[0..2].to_vec());
    reader
        .fast_forward_to(PartitionRange::starting_with(keys[3].clone()))
        .unwrap();
    assert_eq!(keys_of(&read_all(&mut reader)), keys[3..].to_vec());
    assert!(matches!(
        reader.fast_forward_to(PartitionRange::starting_with(keys[0].clone())),
        Err(AtlasError::PreconditionViolated(_))
    ));
}

/// Source whose readers accept any fast-forward without checking it
struct LenientSource(Arc<MemorySource>);

struct LenientReader(Box<dyn MutationReader>);

impl DataSource for LenientSource {
    fn create_reader(
        self: Arc<Self>,
        schema: atlastable::SchemaPtr,
        range: PartitionRange,
    ) -> atlastable::Result<Box<dyn MutationReader>> {
        let inner = Arc::clone(&self.0).create_reader(schema, range)?;
        Ok(Box::new(LenientReader(inner)))
    }
}

impl MutationReader for LenientReader {
    fn schema(&self) -> &atlastable::SchemaPtr {
        self.0.schema()
    }

    fn poll_fragment(&mut self) -> atlastable::Result<Poll<Option<MutationFragment>>> {
        self.0.poll_fragment()
    }

    fn next_partition(&mut self) -> atlastable::Result<()> {
        self.0.next_partition()
    }

    fn fast_forward_to(&mut self, _range: PartitionRange) -> atlastable::Result<()> {
        Ok(())
    }
}

#[test]
fn test_partitions_read_after_flush_count_as_consumed() {
    let keys = sorted_keys(6);
    let (s, mt) = filled(&keys);
    let content = read_all(&mut mt.make_reader(s.clone(), PartitionRange::full()));

    let mut reader = mt.make_reader(s.clone(), PartitionRange::full());
    assert_eq!(reader.next_mutation().unwrap().unwrap().key(), &keys[0]);

    let replacement = Arc::new(MemorySource::new(s.clone(), content).unwrap());
    mt.mark_flushed(Arc::new(LenientSource(replacement))).unwrap();

    assert_eq!(reader.next_mutation().unwrap().unwrap().key(), &keys[1]);
    assert_eq!(reader.next_mutation().unwrap().unwrap().key(), &keys[2]);
    assert!(reader.is_delegating());

    for consumed in [&keys[1], &keys[2]] {
        assert!(matches!(
            reader.fast_forward_to(PartitionRange::starting_with(consumed.clone())),
            Err(AtlasError::PreconditionViolated(_))
        ));
    }
    reader
        .fast_forward_to(PartitionRange::starting_with(keys[4].clone()))
        .unwrap();
}
