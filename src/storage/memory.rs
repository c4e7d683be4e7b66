//! In-memory data source and sink.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{DataSource, FragmentCollector, PartitionSink};
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::keys::{DecoratedKey, PartitionRange};
use crate::mutation::{Mutation, MutationPartition};
use crate::reader::{MaterializedReader, MutationFragment, MutationReader, PartitionLookup};
use crate::schema::SchemaPtr;

/// Reconciled partitions held in memory
pub struct MemorySource {
    schema: SchemaPtr,
    partitions: BTreeMap<DecoratedKey, MutationPartition>,
    clock: Arc<dyn Clock>,
}

impl MemorySource {
    /// Source holding `mutations`; mutations of the same partition are
    /// reconciled
    pub fn new(schema: SchemaPtr, mutations: impl IntoIterator<Item = Mutation>) -> Result<Self> {
        let mut partitions: BTreeMap<DecoratedKey, MutationPartition> = BTreeMap::new();
        for mutation in mutations {
            let (_, key, partition) = mutation.upgrade(&schema)?.into_parts();
            partitions.entry(key).or_default().apply(partition);
        }
        Ok(Self {
            schema,
            partitions,
            clock: Arc::new(SystemClock::default()),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DecoratedKey> {
        self.partitions.keys()
    }
}

impl PartitionLookup for MemorySource {
    fn schema(&self) -> &SchemaPtr {
        &self.schema
    }

    fn find_next(
        &self,
        range: &PartitionRange,
        after: Option<&DecoratedKey>,
    ) -> Result<Option<(DecoratedKey, MutationPartition)>> {
        let range = match after {
            Some(key) => range.resume_after(key),
            None => range.clone(),
        };
        if range.is_empty() {
            return Ok(None);
        }
        Ok(self
            .partitions
            .range::<DecoratedKey, _>(range.bounds())
            .next()
            .map(|(k, p)| (k.clone(), p.clone())))
    }
}

impl DataSource for MemorySource {
    fn create_reader(self: Arc<Self>, schema: SchemaPtr, range: PartitionRange) -> Result<Box<dyn MutationReader>> {
        let clock = Arc::clone(&self.clock);
        Ok(Box::new(MaterializedReader::new(self, schema, range, clock)))
    }
}

/// Collects a fragment stream into a [`MemorySource`]
pub struct MemorySink {
    schema: SchemaPtr,
    collector: FragmentCollector,
    partitions: Vec<Mutation>,
}

impl MemorySink {
    pub fn new(schema: SchemaPtr) -> Self {
        Self {
            schema,
            collector: FragmentCollector::default(),
            partitions: Vec::new(),
        }
    }
}

impl PartitionSink for MemorySink {
    type Output = MemorySource;

    fn consume(&mut self, fragment: MutationFragment) -> Result<()> {
        if let Some((key, partition)) = self.collector.push(fragment)? {
            self.partitions
                .push(Mutation::from_parts(self.schema.clone(), key, partition));
        }
        Ok(())
    }

    fn finish(self) -> Result<Arc<MemorySource>> {
        self.collector.finish()?;
        Ok(Arc::new(MemorySource::new(self.schema, self.partitions)?))
    }
}
