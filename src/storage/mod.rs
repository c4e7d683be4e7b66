//! Storage Module
//!
//! Where mutation data lives once it leaves a memtable, and the interfaces
//! the memtable uses to reach it.
//!
//! ## Responsibilities
//! - [`DataSource`]: anything readers can be created from (a memtable, an
//!   in-memory source, a segment file)
//! - [`PartitionSink`]: consumes a flush reader's fragment stream and
//!   yields the durable source that replaces the memtable
//! - Segment files and the [`StorageManager`] that tracks them
//!
//! ## Segment File Format
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │ Header (14 bytes)                                       │
//! │   Magic: "ATSG" (4) | Version: u16 (2) | Count: u64 (8) │
//! ├─────────────────────────────────────────────────────────┤
//! │ Data Block (variable)                                   │
//! │   [Len: u32][bincode SchemaDescriptor] (writing schema) │
//! │   [Len: u32][bincode (DecoratedKey, MutationPartition)] │
//! │   ... one entry per partition, in ring order ...        │
//! ├─────────────────────────────────────────────────────────┤
//! │ Index Block (variable)                                  │
//! │   [Len: u32][Offset: u64][bincode DecoratedKey]         │
//! ├─────────────────────────────────────────────────────────┤
//! │ Footer (16 bytes)                                       │
//! │   IndexOffset: u64 (8) | DataCRC: u32 (4) | Padding (4) │
//! └─────────────────────────────────────────────────────────┘
//! ```

mod manager;
mod memory;
mod segment;

use std::sync::Arc;

pub use manager::StorageManager;
pub use memory::{MemorySink, MemorySource};
pub use segment::{SegmentReader, SegmentSource, SegmentWriter};

use crate::error::{AtlasError, Result};
use crate::keys::{DecoratedKey, PartitionRange};
use crate::mutation::MutationPartition;
use crate::reader::{MutationFragment, MutationReader};
use crate::schema::SchemaPtr;

/// A source of mutation readers
pub trait DataSource: Send + Sync {
    /// Reader over `range`, expressed in `schema`
    fn create_reader(self: Arc<Self>, schema: SchemaPtr, range: PartitionRange) -> Result<Box<dyn MutationReader>>;
}

/// Consumer of a fragment stream, producing the source that serves it back
pub trait PartitionSink {
    type Output: DataSource + 'static;

    fn consume(&mut self, fragment: MutationFragment) -> Result<()>;

    fn finish(self) -> Result<Arc<Self::Output>>;
}

/// Reassembles fragments into whole partitions
#[derive(Debug, Default)]
pub(crate) struct FragmentCollector {
    current: Option<(DecoratedKey, MutationPartition)>,
    last_key: Option<DecoratedKey>,
}

impl FragmentCollector {
    /// Feed one fragment; returns a partition when its end is reached
    pub(crate) fn push(&mut self, fragment: MutationFragment) -> Result<Option<(DecoratedKey, MutationPartition)>> {
        match fragment {
            MutationFragment::PartitionStart { key, tombstone } => {
                if let Some((open, _)) = &self.current {
                    return Err(AtlasError::Storage(format!(
                        "partition {} started before {} ended",
                        key, open
                    )));
                }
                if self.last_key.as_ref().is_some_and(|last| *last >= key) {
                    return Err(AtlasError::Storage(format!(
                        "partition {} is out of ring order",
                        key
                    )));
                }
                let mut partition = MutationPartition::new();
                partition.apply_delete(tombstone);
                self.current = Some((key, partition));
                Ok(None)
            }
            MutationFragment::PartitionEnd => {
                let done = self.take_open("partition end")?;
                self.last_key = Some(done.0.clone());
                Ok(Some(done))
            }
            MutationFragment::StaticRow(row) => {
                self.open_partition("static row")?.apply_static_row(row);
                Ok(None)
            }
            MutationFragment::ClusteringRow { key, row } => {
                self.open_partition("clustering row")?.apply_row(key, row);
                Ok(None)
            }
            MutationFragment::RangeTombstone(rt) => {
                self.open_partition("range tombstone")?.apply_range_tombstone(rt);
                Ok(None)
            }
        }
    }

    /// Fails if a partition was started but never ended
    pub(crate) fn finish(&self) -> Result<()> {
        match &self.current {
            Some((key, _)) => Err(AtlasError::Storage(format!(
                "stream ended inside partition {}",
                key
            ))),
            None => Ok(()),
        }
    }

    fn open_partition(&mut self, what: &str) -> Result<&mut MutationPartition> {
        match self.current.as_mut() {
            Some((_, partition)) => Ok(partition),
            None => Err(AtlasError::Storage(format!("{} outside of a partition", what))),
        }
    }

    fn take_open(&mut self, what: &str) -> Result<(DecoratedKey, MutationPartition)> {
        self.current
            .take()
            .ok_or_else(|| AtlasError::Storage(format!("{} outside of a partition", what)))
    }
}
