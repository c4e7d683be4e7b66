//! Partition entries: the owner of a version chain.

use std::ops::AddAssign;
use std::sync::Arc;

use super::version::{PartitionSnapshot, PartitionVersion};
use crate::keys::DecoratedKey;
use crate::memory::MemoryAccount;
use crate::mutation::MutationPartition;
use crate::schema::SchemaPtr;

/// Outcome of one or more compaction steps
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub partitions_visited: usize,
    pub versions_merged: usize,
    pub bytes_reclaimed: usize,
}

impl AddAssign for CompactionStats {
    fn add_assign(&mut self, other: Self) {
        self.partitions_visited += other.partitions_visited;
        self.versions_merged += other.versions_merged;
        self.bytes_reclaimed += other.bytes_reclaimed;
    }
}

/// Head of one partition's version chain (newest first)
#[derive(Debug)]
pub struct PartitionEntry {
    key: DecoratedKey,
    head: Option<Arc<PartitionVersion>>,
}

impl PartitionEntry {
    /// Entry with no versions yet
    pub(crate) fn shell(key: DecoratedKey) -> Self {
        Self { key, head: None }
    }

    pub fn key(&self) -> &DecoratedKey {
        &self.key
    }

    /// No data was ever merged into this entry
    pub fn is_shell(&self) -> bool {
        self.head.is_none()
    }

    pub fn version_count(&self) -> usize {
        self.snapshot().map_or(0, |s| s.version_count())
    }

    /// Pin the current head
    pub fn snapshot(&self) -> Option<PartitionSnapshot> {
        self.head
            .as_ref()
            .map(|head| PartitionSnapshot::new(self.key.clone(), Arc::clone(head)))
    }

    /// Merge new data at the head of the chain.
    ///
    /// The head is extended in place when nothing but this entry references
    /// it; otherwise (a snapshot pins it, it was already flushed, or it was
    /// written under another schema) a new head is published on top.
    pub(crate) fn apply(
        &mut self,
        partition: MutationPartition,
        schema: &SchemaPtr,
        account: &Arc<MemoryAccount>,
    ) {
        if let Some(head) = self.head.as_mut().and_then(Arc::get_mut) {
            if head.accepts_in_place(schema) {
                head.apply_in_place(partition);
                return;
            }
        }
        let older = self.head.take();
        self.head = Some(Arc::new(PartitionVersion::new(
            partition,
            schema.clone(),
            older,
            Arc::clone(account),
        )));
    }

    /// Collapse every run of versions that no snapshot pins
    pub(crate) fn compact(&mut self) -> CompactionStats {
        let mut stats = CompactionStats {
            partitions_visited: 1,
            ..CompactionStats::default()
        };
        compact_link(&mut self.head, &mut stats);
        stats
    }
}

/// Walk the chain from `link`, merging each unpinned older version into
/// the version above it. Stops at the first pinned version: everything
/// below it is reachable by a reader and stays as is.
fn compact_link(link: &mut Option<Arc<PartitionVersion>>, stats: &mut CompactionStats) {
    let Some(current) = link.as_mut().and_then(Arc::get_mut) else {
        return;
    };
    while let Some(older) = current.older.take() {
        if !current.can_absorb(&older) {
            current.older = Some(older);
            break;
        }
        match Arc::try_unwrap(older) {
            Ok(older) => {
                stats.bytes_reclaimed += current.absorb(older);
                stats.versions_merged += 1;
            }
            Err(pinned) => {
                current.older = Some(pinned);
                return;
            }
        }
    }
    compact_link(&mut current.older, stats);
}
