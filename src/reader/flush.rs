//! Flush reader: streams a whole memtable out to storage.

use std::sync::Arc;
use std::task::Poll;

use tracing::{debug, trace};

use super::{MutationFragment, MutationReader, PartitionCursor};
use crate::error::{AtlasError, Result};
use crate::keys::{DecoratedKey, PartitionRange};
use crate::memtable::{Lookup, Memtable};
use crate::schema::SchemaPtr;

/// Full-range, forward-only reader used by the flush path
///
/// Every partition it leaves (by reaching its end or skipping it) is
/// marked flushed, which lowers the memtable's virtual dirty memory; the
/// partition's snapshot is released at the same time. Only one flush
/// reader may be active per memtable; dropping it frees the slot.
pub struct FlushReader {
    memtable: Arc<Memtable>,
    schema: SchemaPtr,
    range: PartitionRange,
    last_key: Option<DecoratedKey>,
    current: Option<PartitionCursor>,
    partitions_flushed: usize,
    bytes_flushed: usize,
    exhausted: bool,
}

impl FlushReader {
    /// Caller must hold the memtable's flush slot
    pub(crate) fn new(memtable: Arc<Memtable>, schema: SchemaPtr) -> Self {
        Self {
            memtable,
            schema,
            range: PartitionRange::full(),
            last_key: None,
            current: None,
            partitions_flushed: 0,
            bytes_flushed: 0,
            exhausted: false,
        }
    }

    /// Partitions fully streamed so far
    pub fn partitions_flushed(&self) -> usize {
        self.partitions_flushed
    }

    /// Bytes of versions marked flushed so far
    pub fn bytes_flushed(&self) -> usize {
        self.bytes_flushed
    }

    /// Mark the current partition flushed and release it
    fn leave_partition(&mut self) {
        if let Some(cursor) = self.current.take() {
            let bytes = cursor.snapshot().mark_flushed();
            self.bytes_flushed += bytes;
            self.partitions_flushed += 1;
            trace!(key = %cursor.snapshot().key(), bytes, "partition flushed");
        }
    }
}

impl MutationReader for FlushReader {
    fn schema(&self) -> &SchemaPtr {
        &self.schema
    }

    fn poll_fragment(&mut self) -> Result<Poll<Option<MutationFragment>>> {
        loop {
            if let Some(cursor) = self.current.as_mut() {
                if let Some(fragment) = cursor.next_fragment() {
                    if cursor.is_done() {
                        self.leave_partition();
                    }
                    return Ok(Poll::Ready(Some(fragment)));
                }
                self.leave_partition();
            }
            if self.exhausted {
                return Ok(Poll::Ready(None));
            }
            match self.memtable.lookup(&self.range, self.last_key.as_ref()) {
                Lookup::Found(snapshot) => {
                    let cursor = PartitionCursor::new(snapshot, &self.schema, self.memtable.now())?;
                    self.last_key = Some(cursor.snapshot().key().clone());
                    self.current = Some(cursor);
                }
                Lookup::Replaced(_) => {
                    return Err(AtlasError::precondition(
                        "memtable was marked flushed while its flush reader was active",
                    ));
                }
                Lookup::End => {
                    self.exhausted = true;
                    debug!(
                        partitions = self.partitions_flushed,
                        bytes = self.bytes_flushed,
                        "flush reader reached end of memtable"
                    );
                    return Ok(Poll::Ready(None));
                }
            }
        }
    }

    fn next_partition(&mut self) -> Result<()> {
        self.leave_partition();
        Ok(())
    }

    fn fast_forward_to(&mut self, _range: PartitionRange) -> Result<()> {
        Err(AtlasError::precondition("flush readers cannot be fast-forwarded"))
    }
}

impl Drop for FlushReader {
    fn drop(&mut self) {
        self.memtable.release_flush_slot();
    }
}
