//! Rows and range tombstones.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::cell::{Cell, Timestamp, Tombstone};
use crate::clock::GcTime;
use crate::keys::ClusteringKey;
use crate::schema::ColumnMapping;

/// Cells of one row, keyed by column name, plus row-level liveness
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    /// Row marker: the row exists even with no cells
    pub marker: Option<Timestamp>,
    /// Row deletion
    pub tombstone: Tombstone,
    pub cells: BTreeMap<String, Cell>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.marker.is_none() && !self.tombstone.is_some() && self.cells.is_empty()
    }

    pub fn cell(&self, column: &str) -> Option<&Cell> {
        self.cells.get(column)
    }

    /// Reconcile a cell into the row
    pub fn apply_cell(&mut self, column: String, cell: Cell) {
        match self.cells.remove(&column) {
            Some(existing) => {
                self.cells.insert(column, existing.reconcile(cell));
            }
            None => {
                self.cells.insert(column, cell);
            }
        }
    }

    /// Reconcile another row into this one
    pub fn apply(&mut self, other: Row) {
        self.marker = match (self.marker, other.marker) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self.tombstone.apply(other.tombstone);
        for (column, cell) in other.cells {
            self.apply_cell(column, cell);
        }
    }

    /// Drop everything deleted by `outer` or by the row's own tombstone.
    ///
    /// A row tombstone already covered by `outer` is redundant and dropped
    /// too, which keeps the merged form independent of merge order.
    pub fn compact(&mut self, outer: Tombstone) {
        if !outer.is_some() && !self.tombstone.is_some() {
            return;
        }
        if self.tombstone <= outer {
            self.tombstone = Tombstone::NONE;
        }
        let mut effective = outer;
        effective.apply(self.tombstone);
        if let Some(ts) = self.marker {
            if effective.deletes(ts) {
                self.marker = None;
            }
        }
        self.cells.retain(|_, cell| !effective.deletes(cell.timestamp));
    }

    /// Keep only the columns that survive a schema change
    pub fn upgrade(&mut self, mapping: &ColumnMapping) {
        if !mapping.is_identity() {
            self.cells.retain(|name, _| mapping.keeps(name));
        }
    }

    /// Convert expired cells into dead cells
    pub fn expire(&mut self, now: GcTime) {
        for cell in self.cells.values_mut() {
            cell.expire(now);
        }
    }

    /// Whether anything in the row is live at `now`
    pub fn is_live(&self, now: GcTime) -> bool {
        self.marker.is_some() || self.cells.values().any(|c| c.is_live(now))
    }

    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Row>()
            + self
                .cells
                .iter()
                .map(|(name, cell)| name.len() + cell.memory_usage())
                .sum::<usize>()
    }
}

/// Deletion of a range of clustering rows
///
/// Bounds are clustering key prefixes; an empty inclusive prefix is an
/// open bound.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RangeTombstone {
    pub start: ClusteringKey,
    pub start_inclusive: bool,
    pub end: ClusteringKey,
    pub end_inclusive: bool,
    pub tombstone: Tombstone,
}

impl RangeTombstone {
    /// `[start, end]` inclusive on both sides
    pub fn closed(start: ClusteringKey, end: ClusteringKey, tombstone: Tombstone) -> Self {
        Self {
            start,
            start_inclusive: true,
            end,
            end_inclusive: true,
            tombstone,
        }
    }

    /// Whether the row at `key` falls inside the range
    pub fn covers(&self, key: &ClusteringKey) -> bool {
        let after_start = match compare_prefix(key, &self.start) {
            Ordering::Greater => true,
            Ordering::Equal => self.start_inclusive,
            Ordering::Less => false,
        };
        let before_end = match compare_prefix(key, &self.end) {
            Ordering::Less => true,
            Ordering::Equal => self.end_inclusive,
            Ordering::Greater => false,
        };
        after_start && before_end
    }

    /// Whether the range starts at or before the row at `key`
    pub fn starts_before(&self, key: &ClusteringKey) -> bool {
        match compare_prefix(key, &self.start) {
            Ordering::Greater => true,
            Ordering::Equal => self.start_inclusive,
            Ordering::Less => false,
        }
    }

    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<RangeTombstone>() + self.start.byte_size() + self.end.byte_size()
    }
}

/// Compare a full key against a bound prefix on the prefix's components only
fn compare_prefix(key: &ClusteringKey, prefix: &ClusteringKey) -> Ordering {
    for (i, component) in prefix.0.iter().enumerate() {
        match key.0.get(i) {
            Some(k) => match k.cmp(component) {
                Ordering::Equal => continue,
                other => return other,
            },
            None => return Ordering::Less,
        }
    }
    Ordering::Equal
}
