//! Engine Module
//!
//! One table: the active memtable, memtables being flushed, and segments.
//!
//! ## Responsibilities
//! - Route writes to the active memtable generation
//! - React to memory pressure: rotate and flush, or push back on writers
//! - Serve reads that reconcile every generation and segment
//! - Own the background reclaimer

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::compaction::Reclaimer;
use crate::config::Config;
use crate::error::{AtlasError, Result};
use crate::flush::flush_memtable;
use crate::keys::{DecoratedKey, PartitionRange};
use crate::memory::{DirtyMemoryManager, MemoryPressure};
use crate::memtable::Memtable;
use crate::mutation::Mutation;
use crate::partition::CompactionStats;
use crate::reader::{MergingReader, MutationReader};
use crate::schema::SchemaPtr;
use crate::storage::{DataSource, StorageManager};

/// Result of an engine flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushSummary {
    pub partitions: usize,
    pub bytes: usize,
}

/// Storage engine of one table
///
/// ## Concurrency Model
///
/// - **Writes** hold the `active` read lock while applying, so a rotation
///   (which takes it exclusively) never races with a write to the
///   generation being sealed
/// - **Flushes** are serialized by `flush_lock`; a write that crosses the
///   soft limit while a flush runs does not wait for it
/// - **Reads** collect the active memtable, then sealed memtables, then
///   segments; a generation moving from sealed to segments in between is
///   seen twice, never zero times, and reconciliation absorbs the duplicate
pub struct Engine {
    /// Engine configuration
    config: Config,

    /// Directory holding segment files
    storage_dir: PathBuf,

    schema: RwLock<SchemaPtr>,

    manager: Arc<DirtyMemoryManager>,

    clock: Arc<dyn Clock>,

    /// Memtable receiving writes
    active: RwLock<Arc<Memtable>>,

    /// Rotated memtables whose flush has not completed
    sealed: RwLock<Vec<Arc<Memtable>>>,

    /// Persistent segments
    storage: StorageManager,

    /// Serializes flushes
    flush_lock: Mutex<()>,

    reclaimer: Reclaimer,
}

impl Engine {
    const SEGMENT_DIR: &'static str = "segments";

    /// Open or create an engine on the wall clock
    pub fn open(config: Config, schema: SchemaPtr) -> Result<Self> {
        Self::open_with_clock(config, schema, Arc::new(SystemClock::default()))
    }

    /// Open or create an engine
    ///
    /// On startup:
    /// 1. Validate config and create the data directory
    /// 2. Load existing segments
    /// 3. Start an empty memtable generation and the reclaimer
    pub fn open_with_clock(config: Config, schema: SchemaPtr, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let storage_dir = config.data_dir.join(Self::SEGMENT_DIR);
        fs::create_dir_all(&storage_dir)?;
        let storage = StorageManager::open(&storage_dir, &schema, config.sync_segments, Arc::clone(&clock))?;

        let manager = DirtyMemoryManager::new(&config);
        let reclaimer = Reclaimer::spawn(
            Arc::clone(&manager),
            Duration::from_millis(config.reclaim_interval_ms),
            config.compaction_step_budget,
        )?;
        let active = Memtable::create(
            schema.clone(),
            Arc::clone(&manager),
            Arc::clone(&clock),
            config.compaction_step_budget,
        );
        reclaimer.register(&active)?;

        info!(
            dir = %config.data_dir.display(),
            segments = storage.segment_count(),
            soft_limit = config.dirty_soft_limit,
            hard_limit = config.dirty_hard_limit,
            "engine opened"
        );

        Ok(Self {
            config,
            storage_dir,
            schema: RwLock::new(schema),
            manager,
            clock,
            active: RwLock::new(active),
            sealed: RwLock::new(Vec::new()),
            storage,
            flush_lock: Mutex::new(()),
            reclaimer,
        })
    }

    /// Open with a path (convenience method)
    pub fn open_path(path: &Path, schema: SchemaPtr) -> Result<Self> {
        let config = Config::builder().data_dir(path).build();
        Self::open(config, schema)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Apply a mutation to the active generation
    ///
    /// # Errors
    /// `Backpressure` while virtual dirty memory is over the hard limit;
    /// the write is not applied. Crossing the soft limit triggers a flush
    /// whose failure is logged, not returned.
    pub fn apply(&self, mutation: &Mutation) -> Result<()> {
        if self.manager.pressure() == MemoryPressure::Throttle {
            let virtual_dirty = self.manager.virtual_dirty_memory();
            warn!(virtual_dirty, "write rejected under memory pressure");
            return Err(AtlasError::Backpressure {
                virtual_dirty,
                limit: self.manager.hard_limit(),
            });
        }

        {
            let active = self.active.read();
            active.apply(mutation)?;
        }

        if self.manager.pressure() >= MemoryPressure::Flush {
            debug!(
                virtual_dirty = self.manager.virtual_dirty_memory(),
                "soft limit reached, flushing"
            );
            // The write itself is in; a failed flush is retried by the next
            // write that finds the soft limit exceeded
            match self.flush_lock.try_lock() {
                Some(guard) => {
                    if let Err(e) = self.flush_locked(&guard) {
                        warn!(error = %e, "flush after write failed");
                    }
                }
                None => trace!("flush already running"),
            }
        }
        Ok(())
    }

    /// Change the table schema for future writes and reads
    pub fn set_schema(&self, schema: SchemaPtr) -> Result<()> {
        let active = self.active.read();
        active.set_schema(schema.clone())?;
        *self.schema.write() = schema;
        Ok(())
    }

    // =========================================================================
    // Flush
    // =========================================================================

    /// Rotate the active memtable and flush every sealed one to segments
    ///
    /// Memtables whose earlier flush failed are retried first, oldest
    /// first. Returns `None` if there was nothing to flush. On error the
    /// failing memtable stays sealed and readable.
    pub fn flush(&self) -> Result<Option<FlushSummary>> {
        let guard = self.flush_lock.lock();
        self.flush_locked(&guard)
    }

    fn flush_locked(&self, _guard: &MutexGuard<'_, ()>) -> Result<Option<FlushSummary>> {
        self.rotate()?;
        let pending = self.sealed.read().clone();
        if pending.is_empty() {
            return Ok(None);
        }

        let mut summary = FlushSummary {
            partitions: 0,
            bytes: 0,
        };
        for memtable in pending {
            let flushed = self.flush_sealed(&memtable)?;
            summary.partitions += flushed.partitions;
            summary.bytes += flushed.bytes;
        }
        Ok(Some(summary))
    }

    /// Seal the active memtable unless it is empty
    fn rotate(&self) -> Result<()> {
        let mut active = self.active.write();
        if active.is_empty() {
            return Ok(());
        }
        let next = Memtable::create(
            active.schema(),
            Arc::clone(&self.manager),
            Arc::clone(&self.clock),
            self.config.compaction_step_budget,
        );
        let sealed = std::mem::replace(&mut *active, next);
        debug!(memtable = sealed.id(), partitions = sealed.partition_count(), "memtable sealed");
        self.sealed.write().push(sealed);
        self.reclaimer.register(&active)
    }

    fn flush_sealed(&self, memtable: &Arc<Memtable>) -> Result<FlushSummary> {
        let writer = self.storage.new_segment_writer(memtable.schema())?;
        let path = writer.path().to_path_buf();
        let outcome = match flush_memtable(memtable, writer) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(memtable = memtable.id(), error = %e, "flush failed");
                if let Err(remove_err) = fs::remove_file(&path) {
                    debug!(path = %path.display(), error = %remove_err, "no partial segment to remove");
                }
                return Err(e);
            }
        };
        self.storage.add_segment(Arc::clone(&outcome.source));
        self.sealed.write().retain(|m| !Arc::ptr_eq(m, memtable));
        Ok(FlushSummary {
            partitions: outcome.partitions,
            bytes: outcome.bytes,
        })
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Reader reconciling every generation and segment over `range`
    pub fn make_reader(&self, schema: SchemaPtr, range: PartitionRange) -> Result<MergingReader> {
        let mut readers: Vec<Box<dyn MutationReader>> = Vec::new();

        let active = Arc::clone(&*self.active.read());
        readers.push(Box::new(active.make_reader(schema.clone(), range.clone())));

        let sealed = self.sealed.read().clone();
        for memtable in sealed {
            readers.push(Box::new(memtable.make_reader(schema.clone(), range.clone())));
        }
        for segment in self.storage.segments() {
            readers.push(segment.create_reader(schema.clone(), range.clone())?);
        }
        Ok(MergingReader::new(schema, range, readers))
    }

    /// Reconciled content of one partition in the current schema
    pub fn find(&self, key: &DecoratedKey) -> Result<Option<Mutation>> {
        let mut reader = self.make_reader(self.schema(), PartitionRange::singular(key.clone()))?;
        reader.next_mutation()
    }

    // =========================================================================
    // Compaction
    // =========================================================================

    /// Compact every in-memory generation completely
    pub fn full_compaction(&self) -> CompactionStats {
        let mut stats = self.active.read().compact();
        for memtable in self.sealed.read().iter() {
            stats += memtable.compact();
        }
        stats
    }

    /// Ask the reclaimer for a pass now
    pub fn request_reclaim(&self) -> Result<()> {
        self.reclaimer.kick()
    }

    /// Flush whatever is left and stop background work
    pub fn close(self) -> Result<()> {
        self.flush()?;
        self.reclaimer.shutdown();
        Ok(())
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    pub fn schema(&self) -> SchemaPtr {
        self.schema.read().clone()
    }

    pub fn memory_manager(&self) -> &Arc<DirtyMemoryManager> {
        &self.manager
    }

    pub fn active_memtable(&self) -> Arc<Memtable> {
        Arc::clone(&*self.active.read())
    }

    /// Rotated memtables still being flushed
    pub fn sealed_count(&self) -> usize {
        self.sealed.read().len()
    }

    pub fn segment_count(&self) -> usize {
        self.storage.segment_count()
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
