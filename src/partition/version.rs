//! Partition versions and snapshots.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::clock::GcTime;
use crate::error::Result;
use crate::keys::DecoratedKey;
use crate::memory::MemoryAccount;
use crate::mutation::MutationPartition;
use crate::schema::SchemaPtr;

/// Fixed cost charged for every version on top of its content
pub(crate) const VERSION_OVERHEAD: usize = std::mem::size_of::<PartitionVersion>();

/// One link of a partition's version chain
///
/// Published behind an `Arc`; content is only ever changed through
/// `Arc::get_mut`, i.e. while no snapshot can observe it.
#[derive(Debug)]
pub struct PartitionVersion {
    partition: MutationPartition,
    schema: SchemaPtr,
    pub(super) older: Option<Arc<PartitionVersion>>,
    /// Bytes charged to the account for this version
    size: usize,
    /// Streamed out by a flush reader
    flushed: AtomicBool,
    account: Arc<MemoryAccount>,
}

impl PartitionVersion {
    pub(crate) fn new(
        partition: MutationPartition,
        schema: SchemaPtr,
        older: Option<Arc<PartitionVersion>>,
        account: Arc<MemoryAccount>,
    ) -> Self {
        let size = VERSION_OVERHEAD + partition.memory_usage();
        account.charge(size);
        Self {
            partition,
            schema,
            older,
            size,
            flushed: AtomicBool::new(false),
            account,
        }
    }

    pub fn partition(&self) -> &MutationPartition {
        &self.partition
    }

    pub fn schema(&self) -> &SchemaPtr {
        &self.schema
    }

    pub fn older(&self) -> Option<&Arc<PartitionVersion>> {
        self.older.as_ref()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed.load(Ordering::Acquire)
    }

    /// Flag as streamed out; the first call lowers virtual dirty memory
    pub(crate) fn mark_flushed(&self) -> usize {
        if self.flushed.swap(true, Ordering::AcqRel) {
            return 0;
        }
        self.account.mark_flushed(self.size);
        self.size
    }

    /// Whether new data for `schema` may be merged straight into this version
    pub(crate) fn accepts_in_place(&self, schema: &SchemaPtr) -> bool {
        !self.is_flushed() && self.schema.version() == schema.version()
    }

    pub(crate) fn apply_in_place(&mut self, partition: MutationPartition) {
        self.partition.apply(partition);
        self.recharge(self.size);
    }

    /// Whether `older` may be collapsed into this version
    pub(crate) fn can_absorb(&self, older: &PartitionVersion) -> bool {
        self.is_flushed() == older.is_flushed() && self.schema.version() == older.schema.version()
    }

    /// Collapse `older` into this version, adopting its own older link
    ///
    /// Returns the number of bytes reclaimed.
    pub(crate) fn absorb(&mut self, mut older: PartitionVersion) -> usize {
        // Zeroed so dropping `older` releases nothing; the net change is
        // charged below in one step.
        let older_size = std::mem::replace(&mut older.size, 0);
        let content = std::mem::take(&mut older.partition);
        self.older = older.older.take();
        self.partition.apply(content);
        let before = self.size + older_size;
        self.recharge(before);
        before.saturating_sub(self.size)
    }

    fn recharge(&mut self, charged: usize) {
        let new_size = VERSION_OVERHEAD + self.partition.memory_usage();
        self.account.resize(charged, new_size, self.is_flushed());
        self.size = new_size;
    }
}

impl Drop for PartitionVersion {
    fn drop(&mut self) {
        if self.size > 0 {
            self.account.release(self.size, self.is_flushed());
        }
    }
}

/// A reader's pinned view of one partition
///
/// Holds the chain head as it was when the partition was visited; later
/// writes publish newer heads and are not visible through it.
#[derive(Debug, Clone)]
pub struct PartitionSnapshot {
    key: DecoratedKey,
    head: Arc<PartitionVersion>,
}

impl PartitionSnapshot {
    pub(crate) fn new(key: DecoratedKey, head: Arc<PartitionVersion>) -> Self {
        Self { key, head }
    }

    pub fn key(&self) -> &DecoratedKey {
        &self.key
    }

    /// Versions from newest to oldest
    pub fn versions(&self) -> Versions<'_> {
        Versions {
            next: Some(&self.head),
        }
    }

    pub fn version_count(&self) -> usize {
        self.versions().count()
    }

    /// Flag every version as flushed; returns the bytes newly flushed
    pub(crate) fn mark_flushed(&self) -> usize {
        self.versions().map(PartitionVersion::mark_flushed).sum()
    }

    /// Fully reconciled content, expressed under `schema`
    pub fn merged(&self, schema: &SchemaPtr, now: GcTime) -> Result<MutationPartition> {
        let mut merged = MutationPartition::new();
        for version in self.versions() {
            let mut content = version.partition().clone();
            if version.schema().version() != schema.version() {
                let mapping = version.schema().mapping_to(schema)?;
                content.upgrade(&mapping);
            }
            merged.apply(content);
        }
        merged.expire(now);
        Ok(merged)
    }
}

/// Iterator over a snapshot's versions
pub struct Versions<'a> {
    next: Option<&'a Arc<PartitionVersion>>,
}

impl<'a> Iterator for Versions<'a> {
    type Item = &'a PartitionVersion;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.older.as_ref();
        Some(&**current)
    }
}
