//! Partition content: the unit that gets reconciled.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::cell::{Cell, Timestamp, Tombstone};
use super::row::{RangeTombstone, Row};
use crate::clock::GcTime;
use crate::keys::ClusteringKey;
use crate::schema::ColumnMapping;

/// All data of one partition
///
/// Kept in compacted form: nothing shadowed by a tombstone is retained, and
/// rows left with no content are removed. Merging two partitions in any
/// order yields the same value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationPartition {
    tombstone: Tombstone,
    static_row: Row,
    rows: BTreeMap<ClusteringKey, Row>,
    range_tombstones: BTreeSet<RangeTombstone>,
}

impl MutationPartition {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn tombstone(&self) -> Tombstone {
        self.tombstone
    }

    pub fn static_row(&self) -> &Row {
        &self.static_row
    }

    pub fn rows(&self) -> &BTreeMap<ClusteringKey, Row> {
        &self.rows
    }

    pub fn row(&self, key: &ClusteringKey) -> Option<&Row> {
        self.rows.get(key)
    }

    pub fn range_tombstones(&self) -> &BTreeSet<RangeTombstone> {
        &self.range_tombstones
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn into_parts(
        self,
    ) -> (
        Tombstone,
        Row,
        BTreeMap<ClusteringKey, Row>,
        BTreeSet<RangeTombstone>,
    ) {
        (self.tombstone, self.static_row, self.rows, self.range_tombstones)
    }

    pub fn is_empty(&self) -> bool {
        !self.tombstone.is_some()
            && self.static_row.is_empty()
            && self.rows.is_empty()
            && self.range_tombstones.is_empty()
    }

    /// Partition tombstone combined with every range tombstone covering `key`
    pub fn tombstone_for_row(&self, key: &ClusteringKey) -> Tombstone {
        effective_tombstone(self.tombstone, &self.range_tombstones, key)
    }

    // =========================================================================
    // Updates
    // =========================================================================

    pub fn apply_delete(&mut self, tombstone: Tombstone) {
        if tombstone > self.tombstone {
            self.tombstone = tombstone;
            self.compact_all();
        }
    }

    pub fn apply_range_tombstone(&mut self, rt: RangeTombstone) {
        if rt.tombstone <= self.tombstone {
            return;
        }
        if self.range_tombstones.insert(rt) {
            self.compact_all();
        }
    }

    pub fn apply_row_tombstone(&mut self, key: ClusteringKey, tombstone: Tombstone) {
        let row = Row {
            tombstone,
            ..Row::default()
        };
        self.apply_row(key, row);
    }

    pub fn set_row_marker(&mut self, key: ClusteringKey, timestamp: Timestamp) {
        let row = Row {
            marker: Some(timestamp),
            ..Row::default()
        };
        self.apply_row(key, row);
    }

    pub fn set_cell(&mut self, key: ClusteringKey, column: String, cell: Cell) {
        let mut row = Row::new();
        row.cells.insert(column, cell);
        self.apply_row(key, row);
    }

    pub fn set_static_cell(&mut self, column: String, cell: Cell) {
        self.static_row.apply_cell(column, cell);
        self.static_row.compact(self.tombstone);
    }

    pub fn apply_static_row(&mut self, row: Row) {
        self.static_row.apply(row);
        self.static_row.compact(self.tombstone);
    }

    /// Reconcile a single row into the partition
    pub fn apply_row(&mut self, key: ClusteringKey, row: Row) {
        self.rows.entry(key.clone()).or_default().apply(row);
        self.compact_row(&key);
    }

    /// Reconcile another partition into this one
    pub fn apply(&mut self, other: MutationPartition) {
        let tombstones_changed = other.tombstone > self.tombstone
            || other
                .range_tombstones
                .iter()
                .any(|rt| !self.range_tombstones.contains(rt));

        self.tombstone.apply(other.tombstone);
        self.range_tombstones.extend(other.range_tombstones);
        self.static_row.apply(other.static_row);

        if tombstones_changed {
            for (key, row) in other.rows {
                self.rows.entry(key).or_default().apply(row);
            }
            self.compact_all();
        } else {
            self.static_row.compact(self.tombstone);
            for (key, row) in other.rows {
                self.rows.entry(key.clone()).or_default().apply(row);
                self.compact_row(&key);
            }
        }
    }

    /// Restrict to columns that survive a schema change
    pub fn upgrade(&mut self, mapping: &ColumnMapping) {
        if mapping.is_identity() {
            return;
        }
        self.static_row.upgrade(mapping);
        for row in self.rows.values_mut() {
            row.upgrade(mapping);
        }
        self.rows.retain(|_, row| !row.is_empty());
    }

    /// Convert cells expired at `now` into dead cells
    pub fn expire(&mut self, now: GcTime) {
        self.static_row.expire(now);
        for row in self.rows.values_mut() {
            row.expire(now);
        }
    }

    /// Approximate footprint in bytes
    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<MutationPartition>()
            + self.static_row.memory_usage()
            + self
                .rows
                .iter()
                .map(|(key, row)| {
                    std::mem::size_of::<ClusteringKey>() + key.byte_size() + row.memory_usage()
                })
                .sum::<usize>()
            + self
                .range_tombstones
                .iter()
                .map(RangeTombstone::memory_usage)
                .sum::<usize>()
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn compact_row(&mut self, key: &ClusteringKey) {
        let outer = self.tombstone_for_row(key);
        if let Some(row) = self.rows.get_mut(key) {
            row.compact(outer);
            if row.is_empty() {
                self.rows.remove(key);
            }
        }
    }

    fn compact_all(&mut self) {
        let partition_tombstone = self.tombstone;
        self.range_tombstones
            .retain(|rt| rt.tombstone > partition_tombstone);
        self.static_row.compact(partition_tombstone);

        let range_tombstones = &self.range_tombstones;
        for (key, row) in self.rows.iter_mut() {
            row.compact(effective_tombstone(partition_tombstone, range_tombstones, key));
        }
        self.rows.retain(|_, row| !row.is_empty());
    }
}

/// Max of the partition tombstone and all range tombstones covering `key`
pub(crate) fn effective_tombstone<'a>(
    partition: Tombstone,
    range_tombstones: impl IntoIterator<Item = &'a RangeTombstone>,
    key: &ClusteringKey,
) -> Tombstone {
    let mut t = partition;
    for rt in range_tombstones.into_iter().filter(|rt| rt.covers(key)) {
        t.apply(rt.tombstone);
    }
    t
}
