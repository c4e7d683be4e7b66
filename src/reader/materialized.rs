//! Reader over sources that store partitions already reconciled.

use std::collections::VecDeque;
use std::sync::Arc;
use std::task::Poll;

use super::{check_fast_forward, partition_fragments, MutationFragment, MutationReader};
use crate::clock::Clock;
use crate::error::Result;
use crate::keys::{DecoratedKey, PartitionRange};
use crate::mutation::MutationPartition;
use crate::schema::SchemaPtr;

/// Ordered point access to stored partitions
pub trait PartitionLookup: Send + Sync {
    /// Schema the stored partitions are expressed in
    fn schema(&self) -> &SchemaPtr;

    /// First stored partition in `range` sorting after `after`
    fn find_next(
        &self,
        range: &PartitionRange,
        after: Option<&DecoratedKey>,
    ) -> Result<Option<(DecoratedKey, MutationPartition)>>;
}

/// Streams partitions of a [`PartitionLookup`] one at a time
pub struct MaterializedReader<L: PartitionLookup + ?Sized> {
    source: Arc<L>,
    schema: SchemaPtr,
    range: PartitionRange,
    last_key: Option<DecoratedKey>,
    /// Remaining fragments of the current partition
    buffer: VecDeque<MutationFragment>,
    exhausted: bool,
    clock: Arc<dyn Clock>,
}

impl<L: PartitionLookup + ?Sized> MaterializedReader<L> {
    pub fn new(source: Arc<L>, schema: SchemaPtr, range: PartitionRange, clock: Arc<dyn Clock>) -> Self {
        Self {
            source,
            schema,
            range,
            last_key: None,
            buffer: VecDeque::new(),
            exhausted: false,
            clock,
        }
    }

    fn load_next(&mut self) -> Result<bool> {
        let Some((key, mut partition)) = self.source.find_next(&self.range, self.last_key.as_ref())? else {
            return Ok(false);
        };
        let stored = self.source.schema();
        if stored.version() != self.schema.version() {
            partition.upgrade(&stored.mapping_to(&self.schema)?);
        }
        partition.expire(self.clock.now());
        self.last_key = Some(key.clone());
        self.buffer = partition_fragments(key, partition);
        Ok(true)
    }
}

impl<L: PartitionLookup + ?Sized> MutationReader for MaterializedReader<L> {
    fn schema(&self) -> &SchemaPtr {
        &self.schema
    }

    fn poll_fragment(&mut self) -> Result<Poll<Option<MutationFragment>>> {
        if let Some(fragment) = self.buffer.pop_front() {
            return Ok(Poll::Ready(Some(fragment)));
        }
        if self.exhausted || !self.load_next()? {
            self.exhausted = true;
            return Ok(Poll::Ready(None));
        }
        Ok(Poll::Ready(self.buffer.pop_front()))
    }

    fn next_partition(&mut self) -> Result<()> {
        self.buffer.clear();
        Ok(())
    }

    fn fast_forward_to(&mut self, range: PartitionRange) -> Result<()> {
        check_fast_forward(&self.range, self.last_key.as_ref(), &range)?;
        self.buffer.clear();
        self.range = range;
        self.exhausted = false;
        Ok(())
    }
}
