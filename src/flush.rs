//! Flush coordination.
//!
//! Drives a memtable's flush reader into a [`PartitionSink`], then switches
//! the memtable over to the resulting source:
//!
//! ```text
//! make_flush_reader ─► sink.consume(fragment)* ─► sink.finish()
//!                   ─► mark_flushed(source) ─► revert_flushed_memory()
//! ```

use std::sync::Arc;
use std::time::Instant;

use tracing::info;

use crate::error::Result;
use crate::memtable::Memtable;
use crate::reader::MutationReader;
use crate::storage::{DataSource, PartitionSink};

/// Result of a completed flush
pub struct FlushOutcome<S> {
    /// The source that now backs the memtable
    pub source: Arc<S>,
    pub partitions: usize,
    /// Bytes of versions marked flushed by the reader
    pub bytes: usize,
}

impl<S> std::fmt::Debug for FlushOutcome<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushOutcome")
            .field("partitions", &self.partitions)
            .field("bytes", &self.bytes)
            .finish_non_exhaustive()
    }
}

/// Stream `memtable` into `sink` and mark it flushed
///
/// `sink` receives fragments in the memtable's current schema.
///
/// On error the memtable is left unflushed and keeps accepting reads; the
/// flush may be retried with a new sink.
pub fn flush_memtable<S: PartitionSink>(memtable: &Arc<Memtable>, mut sink: S) -> Result<FlushOutcome<S::Output>> {
    let started = Instant::now();
    let mut reader = memtable.make_flush_reader(memtable.schema())?;
    while let Some(fragment) = reader.next_fragment()? {
        sink.consume(fragment)?;
    }
    let partitions = reader.partitions_flushed();
    let bytes = reader.bytes_flushed();
    drop(reader);

    let source = sink.finish()?;
    memtable.mark_flushed(Arc::clone(&source) as Arc<dyn DataSource>)?;
    memtable.revert_flushed_memory()?;

    info!(
        memtable = memtable.id(),
        partitions,
        bytes,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "memtable flushed"
    );
    Ok(FlushOutcome {
        source,
        partitions,
        bytes,
    })
}
