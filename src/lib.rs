//! # AtlasTable
//!
//! The in-memory write path of a partitioned table store:
//! - Multi-version memtable with snapshot-stable, lazily merged readers
//! - Streaming flush that hands readers over to the flushed source
//! - Real and virtual dirty-memory accounting with write backpressure
//! - Incremental background compaction of version chains
//! - Checksummed on-disk segments for flushed data
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Engine                              │
//! │        (pressure → flush / backpressure, merged reads)      │
//! └──────────┬──────────────────┬───────────────────┬───────────┘
//!            │                  │                   │
//!            ▼                  ▼                   ▼
//!   ┌─────────────────┐ ┌──────────────┐   ┌─────────────────┐
//!   │ Active Memtable │ │   Sealed     │   │    Segments     │
//!   │  (RwLock index) │ │  Memtables   │──►│ (ATSG files)    │
//!   └────────┬────────┘ └──────────────┘   └─────────────────┘
//!            │              flush reader
//!            ▼
//!   ┌─────────────────┐        ┌──────────────────────────────┐
//!   │ Version chains  │◄───────│ DirtyMemoryManager           │
//!   │ newest → oldest │        │ (real / virtual dirty bytes) │
//!   └─────────────────┘        └──────────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod clock;
pub mod keys;
pub mod schema;
pub mod mutation;

pub mod memory;
pub mod partition;
pub mod memtable;
pub mod reader;
pub mod storage;
pub mod view;

pub mod flush;
pub mod compaction;
pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use clock::{Clock, GcTime, ManualClock, SystemClock};
pub use config::Config;
pub use engine::{Engine, FlushSummary};
pub use error::{AtlasError, Result};
pub use flush::{flush_memtable, FlushOutcome};
pub use keys::{ClusteringKey, DecoratedKey, PartitionKey, PartitionRange, Partitioner, Token};
pub use memory::{DirtyMemoryManager, MemoryAccount, MemoryPressure};
pub use memtable::Memtable;
pub use mutation::{Cell, Mutation, MutationPartition, RangeTombstone, Row, Timestamp, Tombstone};
pub use reader::{MutationFragment, MutationReader};
pub use schema::{ColumnKind, ColumnType, Schema, SchemaBuilder, SchemaDescriptor, SchemaPtr};
pub use storage::{DataSource, PartitionSink};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of AtlasTable
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
