//! MemTable Module
//!
//! In-memory write buffer of one table, for one generation of writes.
//!
//! ## Responsibilities
//! - Merge incoming mutations into per-partition version chains
//! - Serve range readers with per-partition snapshot isolation
//! - Stream its whole content out through a single flush reader
//! - Charge and release dirty memory as versions come and go
//!
//! ## Lifecycle
//! ```text
//!  new ──apply*──► make_flush_reader ──drain──► mark_flushed ──► revert_flushed_memory
//!   │                                               │
//!   └── readers at any time ────────────────────────┴──► continue on replacement source
//! ```
//! Creating the flush reader seals the memtable: from then on `apply` is
//! rejected. After `mark_flushed` its index is released; versions pinned by readers live on until those readers move
//! past them.
//!
//! ## Concurrency
//! The index, the schema and the flushed state sit behind one
//! `parking_lot::RwLock`: `apply` and compaction hold it exclusively and run
//! to completion, readers hold it shared just long enough to pin the next
//! partition.

mod table;

pub use table::Memtable;

pub(crate) use table::Lookup;
