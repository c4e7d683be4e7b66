//! Lazy merge of one partition snapshot into fragments.
//!
//! Rows are reconciled one clustering key at a time across every version
//! of the snapshot, so skipping the rest of a partition costs nothing.

use std::collections::BTreeSet;
use std::ops::Bound;

use super::MutationFragment;
use crate::clock::GcTime;
use crate::error::Result;
use crate::keys::ClusteringKey;
use crate::mutation::{effective_tombstone, MutationPartition, RangeTombstone, Row, Tombstone};
use crate::partition::PartitionSnapshot;
use crate::schema::{ColumnMapping, SchemaPtr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Start,
    Static,
    Rows,
    Done,
}

/// Fragment producer over one pinned partition
pub(crate) struct PartitionCursor {
    snapshot: PartitionSnapshot,
    /// Per version, newest first; `None` when already in the reader schema
    mappings: Vec<Option<ColumnMapping>>,
    tombstone: Tombstone,
    range_tombstones: Vec<RangeTombstone>,
    next_rt: usize,
    last_row: Option<ClusteringKey>,
    /// Row found while a range tombstone had to go out first
    pending_row: Option<(ClusteringKey, Row)>,
    stage: Stage,
    now: GcTime,
}

impl PartitionCursor {
    /// Prepare the merge; fails if a version cannot be read as `schema`
    pub(crate) fn new(snapshot: PartitionSnapshot, schema: &SchemaPtr, now: GcTime) -> Result<Self> {
        let mut mappings = Vec::new();
        let mut tombstone = Tombstone::NONE;
        for version in snapshot.versions() {
            let mapping = if version.schema().version() == schema.version() {
                None
            } else {
                Some(version.schema().mapping_to(schema)?)
            };
            mappings.push(mapping);
            tombstone.apply(version.partition().tombstone());
        }

        let range_tombstones: BTreeSet<RangeTombstone> = snapshot
            .versions()
            .flat_map(|v| v.partition().range_tombstones().iter())
            .filter(|rt| rt.tombstone > tombstone)
            .cloned()
            .collect();

        Ok(Self {
            snapshot,
            mappings,
            tombstone,
            range_tombstones: range_tombstones.into_iter().collect(),
            next_rt: 0,
            last_row: None,
            pending_row: None,
            stage: Stage::Start,
            now,
        })
    }

    pub(crate) fn snapshot(&self) -> &PartitionSnapshot {
        &self.snapshot
    }

    pub(crate) fn is_done(&self) -> bool {
        self.stage == Stage::Done
    }

    /// Next fragment of the partition; `None` once `PartitionEnd` was returned
    pub(crate) fn next_fragment(&mut self) -> Option<MutationFragment> {
        loop {
            match self.stage {
                Stage::Start => {
                    self.stage = Stage::Static;
                    return Some(MutationFragment::PartitionStart {
                        key: self.snapshot.key().clone(),
                        tombstone: self.tombstone,
                    });
                }
                Stage::Static => {
                    self.stage = Stage::Rows;
                    let row = self.merge_row(|p| Some(p.static_row()), self.tombstone);
                    if !row.is_empty() {
                        return Some(MutationFragment::StaticRow(row));
                    }
                }
                Stage::Rows => {
                    if self.pending_row.is_none() {
                        self.pending_row = self.next_row();
                    }
                    let rt_first = match (&self.pending_row, self.range_tombstones.get(self.next_rt)) {
                        (Some((key, _)), Some(rt)) => rt.starts_before(key),
                        (None, Some(_)) => true,
                        (_, None) => false,
                    };
                    if rt_first {
                        let rt = self.range_tombstones[self.next_rt].clone();
                        self.next_rt += 1;
                        return Some(MutationFragment::RangeTombstone(rt));
                    }
                    match self.pending_row.take() {
                        Some((key, row)) => return Some(MutationFragment::ClusteringRow { key, row }),
                        None => {
                            self.stage = Stage::Done;
                            return Some(MutationFragment::PartitionEnd);
                        }
                    }
                }
                Stage::Done => return None,
            }
        }
    }

    /// Next clustering row with content left after reconciliation
    fn next_row(&mut self) -> Option<(ClusteringKey, Row)> {
        loop {
            let key = self.next_row_key()?;
            let outer = effective_tombstone(self.tombstone, &self.range_tombstones, &key);
            let row = self.merge_row(|p| p.row(&key), outer);
            self.last_row = Some(key.clone());
            if !row.is_empty() {
                return Some((key, row));
            }
        }
    }

    /// Smallest clustering key after the last one visited, in any version
    fn next_row_key(&self) -> Option<ClusteringKey> {
        let lower = match &self.last_row {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        self.snapshot
            .versions()
            .filter_map(|v| {
                v.partition()
                    .rows()
                    .range::<ClusteringKey, _>((lower, Bound::Unbounded))
                    .next()
                    .map(|(k, _)| k)
            })
            .min()
            .cloned()
    }

    /// Reconcile the row picked by `pick` from every version
    fn merge_row<'a, F>(&'a self, pick: F, outer: Tombstone) -> Row
    where
        F: Fn(&'a MutationPartition) -> Option<&'a Row>,
    {
        let mut merged = Row::new();
        for (version, mapping) in self.snapshot.versions().zip(&self.mappings) {
            if let Some(row) = pick(version.partition()) {
                let mut row = row.clone();
                if let Some(mapping) = mapping {
                    row.upgrade(mapping);
                }
                merged.apply(row);
            }
        }
        merged.compact(outer);
        merged.expire(self.now);
        merged
    }
}
