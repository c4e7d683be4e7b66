//! Reader Module
//!
//! The fragment protocol shared by every reader of mutation data.
//!
//! ## Fragment Stream
//! ```text
//! PartitionStart(k0) [StaticRow] (RangeTombstone | ClusteringRow)* PartitionEnd
//! PartitionStart(k1) ...                                            PartitionEnd
//! <end of stream>
//! ```
//! Partitions come in ring order, rows and range tombstones in clustering
//! order (a range tombstone precedes the first row it covers).
//!
//! ## Readers
//! - [`MemtableReader`]: range-scoped, fast-forwardable, schema-tolerant
//! - [`FlushReader`]: full-range, forward-only; marks what it streams out
//! - [`MergingReader`]: reconciles several readers into one stream
//! - [`MaterializedReader`]: serves partitions looked up from a source that
//!   already holds them reconciled (in-memory or segment files)

mod combined;
mod cursor;
mod flush;
mod materialized;
mod range;

use std::collections::VecDeque;
use std::task::Poll;

pub use combined::MergingReader;
pub use flush::FlushReader;
pub use materialized::{MaterializedReader, PartitionLookup};
pub use range::MemtableReader;

pub(crate) use cursor::PartitionCursor;

use crate::error::{AtlasError, Result};
use crate::keys::{ClusteringKey, DecoratedKey, PartitionRange};
use crate::mutation::{Mutation, MutationPartition, RangeTombstone, Row, Tombstone};
use crate::schema::SchemaPtr;

/// One element of a reader's output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationFragment {
    PartitionStart {
        key: DecoratedKey,
        tombstone: Tombstone,
    },
    StaticRow(Row),
    ClusteringRow {
        key: ClusteringKey,
        row: Row,
    },
    RangeTombstone(RangeTombstone),
    PartitionEnd,
}

impl MutationFragment {
    pub fn is_partition_start(&self) -> bool {
        matches!(self, MutationFragment::PartitionStart { .. })
    }

    pub fn is_partition_end(&self) -> bool {
        matches!(self, MutationFragment::PartitionEnd)
    }
}

/// A resumable, forward-only producer of mutation fragments
///
/// Advancing is cooperative: `poll_fragment` returns `Ready(Some(_))` with
/// the next fragment, `Ready(None)` at end of stream, or `Pending` when the
/// reader waits on something external and must be polled again. A reader
/// must not be polled again after an error.
pub trait MutationReader: Send {
    /// Schema the fragments are expressed in
    fn schema(&self) -> &SchemaPtr;

    fn poll_fragment(&mut self) -> Result<Poll<Option<MutationFragment>>>;

    /// Skip whatever is left of the current partition
    fn next_partition(&mut self) -> Result<()>;

    /// Re-target the reader to `range`, which must lie ahead of everything
    /// already consumed
    fn fast_forward_to(&mut self, range: PartitionRange) -> Result<()>;

    /// Blocking convenience over [`MutationReader::poll_fragment`]
    fn next_fragment(&mut self) -> Result<Option<MutationFragment>> {
        loop {
            match self.poll_fragment()? {
                Poll::Ready(fragment) => return Ok(fragment),
                Poll::Pending => std::thread::yield_now(),
            }
        }
    }

    /// Collect the next partition into a mutation
    fn next_mutation(&mut self) -> Result<Option<Mutation>> {
        let (key, tombstone) = loop {
            match self.next_fragment()? {
                None => return Ok(None),
                Some(MutationFragment::PartitionStart { key, tombstone }) => break (key, tombstone),
                // Left over from a partially consumed partition
                Some(_) => continue,
            }
        };
        let mut partition = MutationPartition::new();
        partition.apply_delete(tombstone);
        loop {
            match self.next_fragment()? {
                Some(MutationFragment::StaticRow(row)) => partition.apply_static_row(row),
                Some(MutationFragment::ClusteringRow { key, row }) => partition.apply_row(key, row),
                Some(MutationFragment::RangeTombstone(rt)) => partition.apply_range_tombstone(rt),
                Some(MutationFragment::PartitionEnd) => break,
                Some(MutationFragment::PartitionStart { key: next, .. }) => {
                    return Err(AtlasError::integrity(format!(
                        "partition {} started before {} ended",
                        next, key
                    )));
                }
                None => {
                    return Err(AtlasError::integrity(format!(
                        "stream ended inside partition {}",
                        key
                    )));
                }
            }
        }
        Ok(Some(Mutation::from_parts(self.schema().clone(), key, partition)))
    }

    /// Drain the reader into mutations
    fn collect_mutations(&mut self) -> Result<Vec<Mutation>> {
        let mut out = Vec::new();
        while let Some(m) = self.next_mutation()? {
            out.push(m);
        }
        Ok(out)
    }
}

impl<R: MutationReader + ?Sized> MutationReader for Box<R> {
    fn schema(&self) -> &SchemaPtr {
        (**self).schema()
    }

    fn poll_fragment(&mut self) -> Result<Poll<Option<MutationFragment>>> {
        (**self).poll_fragment()
    }

    fn next_partition(&mut self) -> Result<()> {
        (**self).next_partition()
    }

    fn fast_forward_to(&mut self, range: PartitionRange) -> Result<()> {
        (**self).fast_forward_to(range)
    }
}

/// Split an already reconciled partition into its fragments
pub(crate) fn partition_fragments(
    key: DecoratedKey,
    partition: MutationPartition,
) -> VecDeque<MutationFragment> {
    let (tombstone, static_row, rows, range_tombstones) = partition.into_parts();
    let mut out = VecDeque::with_capacity(rows.len() + range_tombstones.len() + 3);
    out.push_back(MutationFragment::PartitionStart { key, tombstone });
    if !static_row.is_empty() {
        out.push_back(MutationFragment::StaticRow(static_row));
    }
    let mut rts = range_tombstones.into_iter().peekable();
    for (key, row) in rows {
        while let Some(rt) = rts.next_if(|rt| rt.starts_before(&key)) {
            out.push_back(MutationFragment::RangeTombstone(rt));
        }
        out.push_back(MutationFragment::ClusteringRow { key, row });
    }
    out.extend(rts.map(MutationFragment::RangeTombstone));
    out.push_back(MutationFragment::PartitionEnd);
    out
}

/// Checks shared by every fast-forwardable reader
pub(crate) fn check_fast_forward(
    current: &PartitionRange,
    last_key: Option<&DecoratedKey>,
    next: &PartitionRange,
) -> Result<()> {
    if next.starts_before(current) {
        return Err(AtlasError::precondition(
            "cannot fast-forward to a range starting before the current one",
        ));
    }
    if let Some(key) = last_key {
        if next.reaches_back_to(key) {
            return Err(AtlasError::precondition(format!(
                "cannot fast-forward to a range reaching back to consumed partition {}",
                key
            )));
        }
    }
    Ok(())
}
