//! Memtable implementation
//!
//! Partition index of version chains behind one RwLock, plus the flush
//! state machine.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, trace};

use crate::clock::{Clock, GcTime, SystemClock};
use crate::error::{AtlasError, Result};
use crate::keys::{DecoratedKey, PartitionRange};
use crate::memory::{DirtyMemoryManager, MemoryAccount, MemoryPressure};
use crate::mutation::Mutation;
use crate::partition::{CompactionStats, PartitionIndex, PartitionSnapshot};
use crate::reader::{FlushReader, MemtableReader, MutationReader};
use crate::schema::SchemaPtr;
use crate::storage::DataSource;
use crate::view::{ViewDefinition, ViewUpdate, ViewUpdateSink};

/// Partitions visited per compaction step when none is configured
const DEFAULT_COMPACTION_STEP_BUDGET: usize = 128;

static NEXT_MEMTABLE_ID: AtomicU64 = AtomicU64::new(1);

/// Outcome of looking up the next partition for a reader
pub(crate) enum Lookup {
    Found(PartitionSnapshot),
    /// The memtable was flushed; continue from this source
    Replaced(Arc<dyn DataSource>),
    End,
}

/// State guarded by the memtable lock
struct TableState {
    schema: SchemaPtr,
    index: PartitionIndex,
    /// Set by the first flush reader; no writes from then on
    sealed: bool,
    /// Set once by `mark_flushed`
    replacement: Option<Arc<dyn DataSource>>,
}

/// In-memory write buffer for one table generation
///
/// Shared as `Arc<Memtable>`; readers keep the memtable alive.
pub struct Memtable {
    /// Process-unique id, for logs
    id: u64,
    state: RwLock<TableState>,
    account: Arc<MemoryAccount>,
    clock: Arc<dyn Clock>,
    flush_reader_active: AtomicBool,
    memory_reverted: AtomicBool,
    compaction_step_budget: usize,
    views: RwLock<Vec<Arc<ViewDefinition>>>,
    view_sink: RwLock<Option<Arc<dyn ViewUpdateSink>>>,
}

impl Memtable {
    /// Empty memtable on the wall clock
    pub fn new(schema: SchemaPtr, manager: Arc<DirtyMemoryManager>) -> Arc<Self> {
        Self::with_clock(schema, manager, Arc::new(SystemClock::default()))
    }

    /// Empty memtable judging expiry against `clock`
    pub fn with_clock(
        schema: SchemaPtr,
        manager: Arc<DirtyMemoryManager>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Self::create(schema, manager, clock, DEFAULT_COMPACTION_STEP_BUDGET)
    }

    pub fn create(
        schema: SchemaPtr,
        manager: Arc<DirtyMemoryManager>,
        clock: Arc<dyn Clock>,
        compaction_step_budget: usize,
    ) -> Arc<Self> {
        let id = NEXT_MEMTABLE_ID.fetch_add(1, Ordering::Relaxed);
        debug!(memtable = id, schema = %schema.version(), "memtable created");
        Arc::new(Self {
            id,
            state: RwLock::new(TableState {
                schema,
                index: PartitionIndex::new(),
                sealed: false,
                replacement: None,
            }),
            account: MemoryAccount::new(manager),
            clock,
            flush_reader_active: AtomicBool::new(false),
            memory_reverted: AtomicBool::new(false),
            compaction_step_budget: compaction_step_budget.max(1),
            views: RwLock::new(Vec::new()),
            view_sink: RwLock::new(None),
        })
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Merge a mutation into its partition's version chain
    ///
    /// The mutation is upgraded to the memtable schema first; if that is
    /// not possible nothing is written.
    ///
    /// # Errors
    /// - `PreconditionViolated` once a flush reader was created, since the
    ///   flush could not see the write
    /// - `DataIntegrity` if the mutation cannot be expressed in the schema
    pub fn apply(&self, mutation: &Mutation) -> Result<()> {
        let views = self.affected_views(mutation);
        let now = self.clock.now();

        let (before, after) = {
            let mut state = self.state.write();
            if state.sealed {
                return Err(AtlasError::precondition(format!(
                    "memtable {} is sealed for flush and no longer accepts writes",
                    self.id
                )));
            }
            let schema = state.schema.clone();
            let partition = if mutation.schema().version() == schema.version() {
                mutation.partition().clone()
            } else {
                let (_, _, partition) = mutation.upgrade(&schema)?.into_parts();
                partition
            };

            let before = if views.is_empty() {
                None
            } else {
                Self::reconciled(&state.index, mutation.key(), &schema, now)?
            };

            let entry = state.index.get_or_insert(mutation.key());
            entry.apply(partition, &schema, &self.account);
            trace!(memtable = self.id, key = %mutation.key(), versions = entry.version_count(), "applied mutation");

            let after = if views.is_empty() {
                None
            } else {
                Self::reconciled(&state.index, mutation.key(), &schema, now)?
            };
            (before, after)
        };

        if let Some(after) = after {
            self.notify_views(views, mutation.key(), before, after);
        }

        if self.account.manager().pressure() >= MemoryPressure::Reclaim {
            self.compact_step(self.compaction_step_budget);
        }
        Ok(())
    }

    /// Replace the schema future writes are upgraded to
    ///
    /// # Errors
    /// `DataIntegrity` if data written so far cannot be read as `schema`.
    pub fn set_schema(&self, schema: SchemaPtr) -> Result<()> {
        let mut state = self.state.write();
        state.schema.mapping_to(&schema)?;
        debug!(
            memtable = self.id,
            from = %state.schema.version(),
            to = %schema.version(),
            "memtable schema changed"
        );
        state.schema = schema;
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Reader over `range`, expressed in `schema`
    pub fn make_reader(self: &Arc<Self>, schema: SchemaPtr, range: PartitionRange) -> MemtableReader {
        MemtableReader::new(Arc::clone(self), schema, range)
    }

    /// The single reader that streams this memtable to storage
    ///
    /// Seals the memtable: every later `apply` is rejected, including
    /// after a failed flush, so a retry streams exactly what was
    /// acknowledged.
    ///
    /// # Errors
    /// `PreconditionViolated` after `mark_flushed` or while another flush
    /// reader is alive.
    pub fn make_flush_reader(self: &Arc<Self>, schema: SchemaPtr) -> Result<FlushReader> {
        if self.is_flushed() {
            return Err(AtlasError::precondition(format!(
                "memtable {} is already flushed",
                self.id
            )));
        }
        if self
            .flush_reader_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(AtlasError::precondition(format!(
                "memtable {} already has an active flush reader",
                self.id
            )));
        }
        // Writes hold the lock exclusively, so none is half applied here
        self.state.write().sealed = true;
        info!(
            memtable = self.id,
            partitions = self.partition_count(),
            virtual_dirty = self.account.virtual_(),
            "flush reader created"
        );
        Ok(FlushReader::new(Arc::clone(self), schema))
    }

    /// Reconciled content of one partition, expressed in `schema`
    pub fn find_partition(&self, schema: &SchemaPtr, key: &DecoratedKey) -> Result<Option<Mutation>> {
        let (snapshot, replacement) = {
            let state = self.state.read();
            let snapshot = state.index.get(key).and_then(|entry| entry.snapshot());
            (snapshot, state.replacement.clone())
        };
        if let Some(source) = replacement {
            let mut reader = source.create_reader(schema.clone(), PartitionRange::singular(key.clone()))?;
            return reader.next_mutation();
        }
        match snapshot {
            Some(snapshot) => {
                let partition = snapshot.merged(schema, self.clock.now())?;
                Ok(Some(Mutation::from_parts(schema.clone(), key.clone(), partition)))
            }
            None => Ok(None),
        }
    }

    /// This memtable as a source of readers
    pub fn as_data_source(self: &Arc<Self>) -> Arc<dyn DataSource> {
        Arc::clone(self) as Arc<dyn DataSource>
    }

    // =========================================================================
    // Flush
    // =========================================================================

    /// Switch to the flushed state, backed by `source`
    ///
    /// The index is released; readers already created continue through
    /// `source` from the partition after the last one they read here.
    ///
    /// # Errors
    /// `PreconditionViolated` if already marked flushed.
    pub fn mark_flushed(&self, source: Arc<dyn DataSource>) -> Result<()> {
        let mut state = self.state.write();
        if state.replacement.is_some() {
            return Err(AtlasError::precondition(format!(
                "memtable {} was already marked flushed",
                self.id
            )));
        }
        state.sealed = true;
        state.replacement = Some(source);
        let released = state.index.clear();
        info!(
            memtable = self.id,
            partitions = released,
            real_dirty = self.account.real(),
            virtual_dirty = self.account.virtual_(),
            "memtable marked flushed"
        );
        Ok(())
    }

    /// Drop this memtable's remaining footprint from the memory manager
    ///
    /// # Errors
    /// `PreconditionViolated` before `mark_flushed` or when called twice.
    pub fn revert_flushed_memory(&self) -> Result<()> {
        if !self.is_flushed() {
            return Err(AtlasError::precondition(format!(
                "memtable {} must be marked flushed before reverting its memory",
                self.id
            )));
        }
        if self.memory_reverted.swap(true, Ordering::AcqRel) {
            return Err(AtlasError::precondition(format!(
                "memtable {} memory was already reverted",
                self.id
            )));
        }
        let (real, virtual_) = self.account.detach();
        info!(memtable = self.id, real, virtual_, "flushed memory reverted");
        Ok(())
    }

    // =========================================================================
    // Compaction
    // =========================================================================

    /// Compact every partition
    pub fn compact(&self) -> CompactionStats {
        let stats = self.state.write().index.compact_all();
        debug!(memtable = self.id, ?stats, "full compaction");
        stats
    }

    /// Compact up to `budget` partitions, continuing from the previous step
    pub fn compact_step(&self, budget: usize) -> CompactionStats {
        let stats = self.state.write().index.compact_step(budget.max(1));
        if stats.versions_merged > 0 {
            debug!(memtable = self.id, ?stats, "compaction step");
        }
        stats
    }

    // =========================================================================
    // Views
    // =========================================================================

    pub fn add_view(&self, view: ViewDefinition) {
        self.views.write().push(Arc::new(view));
    }

    pub fn set_view_sink(&self, sink: Arc<dyn ViewUpdateSink>) {
        *self.view_sink.write() = Some(sink);
    }

    fn affected_views(&self, mutation: &Mutation) -> Vec<Arc<ViewDefinition>> {
        if self.view_sink.read().is_none() {
            return Vec::new();
        }
        self.views
            .read()
            .iter()
            .filter(|view| view.may_be_affected_by(mutation))
            .cloned()
            .collect()
    }

    fn notify_views(
        &self,
        views: Vec<Arc<ViewDefinition>>,
        key: &DecoratedKey,
        before: Option<Mutation>,
        after: Mutation,
    ) {
        let sink = self.view_sink.read().clone();
        if let Some(sink) = sink {
            sink.on_update(ViewUpdate {
                views,
                key: key.clone(),
                before,
                after,
            });
        }
    }

    fn reconciled(
        index: &PartitionIndex,
        key: &DecoratedKey,
        schema: &SchemaPtr,
        now: GcTime,
    ) -> Result<Option<Mutation>> {
        let Some(snapshot) = index.get(key).and_then(|entry| entry.snapshot()) else {
            return Ok(None);
        };
        let partition = snapshot.merged(schema, now)?;
        Ok(Some(Mutation::from_parts(schema.clone(), key.clone(), partition)))
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn schema(&self) -> SchemaPtr {
        self.state.read().schema.clone()
    }

    /// Best-effort count of indexed partitions
    pub fn partition_count(&self) -> usize {
        self.state.read().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().index.is_empty()
    }

    pub fn is_flushed(&self) -> bool {
        self.state.read().replacement.is_some()
    }

    /// A flush reader was created; writes are rejected
    pub fn is_sealed(&self) -> bool {
        self.state.read().sealed
    }

    /// Total versions across all chains
    pub fn version_count(&self) -> usize {
        self.state
            .read()
            .index
            .iter()
            .map(|entry| entry.version_count())
            .sum()
    }

    /// Real bytes held by this memtable's versions
    pub fn occupancy(&self) -> usize {
        self.account.real()
    }

    pub fn account(&self) -> &Arc<MemoryAccount> {
        &self.account
    }

    // =========================================================================
    // Reader Support
    // =========================================================================

    pub(crate) fn lookup(&self, range: &PartitionRange, after: Option<&DecoratedKey>) -> Lookup {
        let state = self.state.read();
        if let Some(source) = &state.replacement {
            return Lookup::Replaced(Arc::clone(source));
        }
        match state.index.next_in_range(range, after) {
            Some(snapshot) => Lookup::Found(snapshot),
            None => Lookup::End,
        }
    }

    pub(crate) fn now(&self) -> GcTime {
        self.clock.now()
    }

    pub(crate) fn release_flush_slot(&self) {
        self.flush_reader_active.store(false, Ordering::Release);
    }
}

impl DataSource for Memtable {
    fn create_reader(self: Arc<Self>, schema: SchemaPtr, range: PartitionRange) -> Result<Box<dyn MutationReader>> {
        Ok(Box::new(MemtableReader::new(self, schema, range)))
    }
}
