//! Merging reader: one reconciled stream over several readers.

use std::collections::VecDeque;
use std::task::Poll;

use super::{check_fast_forward, partition_fragments, MutationFragment, MutationReader};
use crate::error::Result;
use crate::keys::{DecoratedKey, PartitionRange};
use crate::mutation::Mutation;
use crate::schema::SchemaPtr;

struct Source {
    reader: Box<dyn MutationReader>,
    /// Next partition of this source, read ahead
    head: Option<Mutation>,
    done: bool,
    /// Fast-forward to apply once `head` has been consumed
    pending_range: Option<PartitionRange>,
}

/// Reconciles the partitions of several readers, key by key
///
/// Partitions are read ahead one at a time from each source, so advancing
/// blocks on sources that return `Pending`.
pub struct MergingReader {
    schema: SchemaPtr,
    sources: Vec<Source>,
    range: PartitionRange,
    last_key: Option<DecoratedKey>,
    buffer: VecDeque<MutationFragment>,
}

impl MergingReader {
    /// `readers` must all produce fragments for `range` under `schema`
    pub fn new(schema: SchemaPtr, range: PartitionRange, readers: Vec<Box<dyn MutationReader>>) -> Self {
        let sources = readers
            .into_iter()
            .map(|reader| Source {
                reader,
                head: None,
                done: false,
                pending_range: None,
            })
            .collect();
        Self {
            schema,
            sources,
            range,
            last_key: None,
            buffer: VecDeque::new(),
        }
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    fn fill_heads(&mut self) -> Result<()> {
        for source in &mut self.sources {
            while source.head.is_none() && !source.done {
                match source.reader.next_mutation()? {
                    Some(m) if precedes(&self.range, m.key()) => continue,
                    Some(m) => source.head = Some(m),
                    None => source.done = true,
                }
            }
        }
        Ok(())
    }

    /// Reconcile every head sharing the smallest key
    fn merge_next(&mut self) -> Result<Option<Mutation>> {
        self.fill_heads()?;
        let Some(key) = self
            .sources
            .iter()
            .filter_map(|s| s.head.as_ref().map(Mutation::key))
            .min()
            .cloned()
        else {
            return Ok(None);
        };
        if self.range.is_before(&key) {
            return Ok(None);
        }

        let mut merged: Option<Mutation> = None;
        for source in &mut self.sources {
            if source.head.as_ref().map(Mutation::key) != Some(&key) {
                continue;
            }
            if let Some(head) = source.head.take() {
                match merged.as_mut() {
                    Some(m) => m.apply(&head)?,
                    None => merged = Some(head.upgrade(&self.schema)?),
                }
            }
            if let Some(range) = source.pending_range.take() {
                source.reader.fast_forward_to(range.resume_after(&key))?;
            }
        }
        Ok(merged)
    }
}

/// Whether `key` sorts before the start of `range`
fn precedes(range: &PartitionRange, key: &DecoratedKey) -> bool {
    !range.contains(key) && !range.is_before(key)
}

impl MutationReader for MergingReader {
    fn schema(&self) -> &SchemaPtr {
        &self.schema
    }

    fn poll_fragment(&mut self) -> Result<Poll<Option<MutationFragment>>> {
        if let Some(fragment) = self.buffer.pop_front() {
            return Ok(Poll::Ready(Some(fragment)));
        }
        match self.merge_next()? {
            Some(mutation) => {
                let (_, key, partition) = mutation.into_parts();
                self.last_key = Some(key.clone());
                self.buffer = partition_fragments(key, partition);
                Ok(Poll::Ready(self.buffer.pop_front()))
            }
            None => Ok(Poll::Ready(None)),
        }
    }

    fn next_partition(&mut self) -> Result<()> {
        self.buffer.clear();
        Ok(())
    }

    fn fast_forward_to(&mut self, range: PartitionRange) -> Result<()> {
        check_fast_forward(&self.range, self.last_key.as_ref(), &range)?;
        self.buffer.clear();
        for source in &mut self.sources {
            if source
                .head
                .as_ref()
                .is_some_and(|head| precedes(&range, head.key()))
            {
                source.head = None;
            }
            if source.head.is_some() {
                source.pending_range = Some(range.clone());
            } else {
                source.pending_range = None;
                source.done = false;
                source.reader.fast_forward_to(range.clone())?;
            }
        }
        self.range = range;
        Ok(())
    }
}
