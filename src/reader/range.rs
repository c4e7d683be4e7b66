//! General range reader over a memtable.

use std::sync::Arc;
use std::task::Poll;

use tracing::debug;

use super::{check_fast_forward, MutationFragment, MutationReader, PartitionCursor};
use crate::error::Result;
use crate::keys::{DecoratedKey, PartitionRange};
use crate::memtable::{Lookup, Memtable};
use crate::schema::SchemaPtr;

/// Range-scoped, fast-forwardable reader of one memtable
///
/// Each partition is pinned when the reader reaches it, so writes to
/// partitions not yet visited are seen and writes to the current or
/// earlier ones are not. Once the memtable is flushed, lookups go to the
/// replacement source, resuming after the last partition read from memory;
/// partitions read from there still count as consumed for fast-forward.
pub struct MemtableReader {
    memtable: Arc<Memtable>,
    schema: SchemaPtr,
    range: PartitionRange,
    last_key: Option<DecoratedKey>,
    current: Option<PartitionCursor>,
    delegate: Option<Box<dyn MutationReader>>,
    exhausted: bool,
}

impl MemtableReader {
    pub(crate) fn new(memtable: Arc<Memtable>, schema: SchemaPtr, range: PartitionRange) -> Self {
        Self {
            memtable,
            schema,
            range,
            last_key: None,
            current: None,
            delegate: None,
            exhausted: false,
        }
    }

    /// Range currently read
    pub fn range(&self) -> &PartitionRange {
        &self.range
    }

    /// Whether reads now go to the source that replaced the memtable
    pub fn is_delegating(&self) -> bool {
        self.delegate.is_some()
    }

    fn advance_partition(&mut self) -> Result<bool> {
        match self.memtable.lookup(&self.range, self.last_key.as_ref()) {
            Lookup::Found(snapshot) => {
                let cursor = PartitionCursor::new(snapshot, &self.schema, self.memtable.now())?;
                self.last_key = Some(cursor.snapshot().key().clone());
                self.current = Some(cursor);
                Ok(true)
            }
            Lookup::Replaced(source) => {
                let range = match &self.last_key {
                    Some(key) => self.range.resume_after(key),
                    None => self.range.clone(),
                };
                debug!(last_key = ?self.last_key, "memtable flushed, reader switching to replacement source");
                self.delegate = Some(source.create_reader(self.schema.clone(), range)?);
                Ok(true)
            }
            Lookup::End => Ok(false),
        }
    }
}

impl MutationReader for MemtableReader {
    fn schema(&self) -> &SchemaPtr {
        &self.schema
    }

    fn poll_fragment(&mut self) -> Result<Poll<Option<MutationFragment>>> {
        loop {
            if let Some(cursor) = self.current.as_mut() {
                if let Some(fragment) = cursor.next_fragment() {
                    return Ok(Poll::Ready(Some(fragment)));
                }
                self.current = None;
            }
            if let Some(delegate) = self.delegate.as_mut() {
                let polled = delegate.poll_fragment()?;
                if let Poll::Ready(Some(MutationFragment::PartitionStart { key, .. })) = &polled {
                    self.last_key = Some(key.clone());
                }
                return Ok(polled);
            }
            if self.exhausted || !self.advance_partition()? {
                self.exhausted = true;
                return Ok(Poll::Ready(None));
            }
        }
    }

    fn next_partition(&mut self) -> Result<()> {
        if self.current.take().is_some() {
            return Ok(());
        }
        match self.delegate.as_mut() {
            Some(delegate) => delegate.next_partition(),
            None => Ok(()),
        }
    }

    fn fast_forward_to(&mut self, range: PartitionRange) -> Result<()> {
        check_fast_forward(&self.range, self.last_key.as_ref(), &range)?;
        self.current = None;
        self.exhausted = false;
        if let Some(delegate) = self.delegate.as_mut() {
            delegate.fast_forward_to(range.clone())?;
        }
        self.range = range;
        Ok(())
    }
}
