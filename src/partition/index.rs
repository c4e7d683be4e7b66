//! Partition Index
//!
//! Ordered map from decorated key to partition entry. Iteration order is
//! the ring order (token, then key bytes), strictly increasing.

use std::collections::BTreeMap;
use std::ops::Bound;

use super::entry::{CompactionStats, PartitionEntry};
use super::version::PartitionSnapshot;
use crate::keys::{DecoratedKey, PartitionRange};

/// Entries of one memtable, keyed in ring order
#[derive(Debug, Default)]
pub struct PartitionIndex {
    entries: BTreeMap<DecoratedKey, PartitionEntry>,
    /// Last key visited by incremental compaction
    compaction_cursor: Option<DecoratedKey>,
}

impl PartitionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &DecoratedKey) -> Option<&PartitionEntry> {
        self.entries.get(key)
    }

    /// Entry for `key`, inserting a shell at its ring position if absent
    pub(crate) fn get_or_insert(&mut self, key: &DecoratedKey) -> &mut PartitionEntry {
        self.entries
            .entry(key.clone())
            .or_insert_with(|| PartitionEntry::shell(key.clone()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &PartitionEntry> {
        self.entries.values()
    }

    /// Snapshot of the first non-shell partition in `range` that sorts
    /// after `after`
    pub fn next_in_range(
        &self,
        range: &PartitionRange,
        after: Option<&DecoratedKey>,
    ) -> Option<PartitionSnapshot> {
        let range = match after {
            Some(key) => range.resume_after(key),
            None => range.clone(),
        };
        if range.is_empty() {
            return None;
        }
        self.entries
            .range::<DecoratedKey, _>(range.bounds())
            .find_map(|(_, entry)| entry.snapshot())
    }

    /// Compact every entry
    pub(crate) fn compact_all(&mut self) -> CompactionStats {
        let mut stats = CompactionStats::default();
        for entry in self.entries.values_mut() {
            stats += entry.compact();
        }
        self.compaction_cursor = None;
        stats
    }

    /// Compact up to `budget` entries, resuming where the previous step
    /// stopped and wrapping around at the end of the ring
    pub(crate) fn compact_step(&mut self, budget: usize) -> CompactionStats {
        let mut stats = CompactionStats::default();
        let start = match self.compaction_cursor.take() {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        let mut last = None;
        for (key, entry) in self
            .entries
            .range_mut::<DecoratedKey, _>((start, Bound::Unbounded))
            .take(budget)
        {
            stats += entry.compact();
            last = Some(key.clone());
        }
        if stats.partitions_visited == budget {
            self.compaction_cursor = last;
        }
        stats
    }

    /// Drop every entry; versions still pinned by snapshots stay alive
    pub(crate) fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        self.compaction_cursor = None;
        count
    }
}
