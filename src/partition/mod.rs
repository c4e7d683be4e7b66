//! Partition Module
//!
//! Multi-version storage of one memtable's partitions.
//!
//! ## Structure
//! - [`PartitionIndex`]: ring-ordered map of [`PartitionEntry`]s
//! - [`PartitionEntry`]: owns the head of a partition's version chain
//! - [`PartitionVersion`]: one immutable-once-published link of the chain
//! - [`PartitionSnapshot`]: a reader's pin on a chain head
//!
//! ## Versioning
//! ```text
//! entry ──► v3 (newest) ──► v2 ──► v1 (oldest)
//!            ▲               ▲
//!         reader B        reader A
//! ```
//! A reader that visited the partition when v2 was the head holds v2 and
//! sees v2 + v1 only. Writes that arrive while the head is pinned push a new
//! head; compaction merges an older version into the one above it only when
//! no snapshot refers to the older one.

mod entry;
mod index;
mod version;

pub use entry::{CompactionStats, PartitionEntry};
pub use index::PartitionIndex;
pub use version::{PartitionSnapshot, PartitionVersion, Versions};
