//! Storage Manager
//!
//! Tracks the segment files of one table.
//!
//! ## Responsibilities
//! - Discover existing segments on startup
//! - Hand out writers for new segments
//! - Keep the open segments, newest first, for readers

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::clock::Clock;
use crate::error::Result;
use crate::schema::SchemaPtr;

use super::{SegmentSource, SegmentWriter};

/// Manages the segments of one table
///
/// ## Concurrency:
/// - `segments`: RwLock (many concurrent readers, exclusive writer)
/// - `next_segment_id`: atomic counter
pub struct StorageManager {
    /// Directory where segments are stored
    data_dir: PathBuf,

    /// Open segments, ordered newest → oldest
    segments: RwLock<Vec<Arc<SegmentSource>>>,

    next_segment_id: AtomicU64,

    /// fsync segments on finish
    sync: bool,

    clock: Arc<dyn Clock>,
}

impl StorageManager {
    /// Open or create storage in `path`
    ///
    /// `schema` is the current table schema; each existing segment is read
    /// back in the schema recorded in it and upgraded by its readers.
    pub fn open(path: &Path, schema: &SchemaPtr, sync: bool, clock: Arc<dyn Clock>) -> Result<Self> {
        fs::create_dir_all(path)?;

        let mut segment_ids: Vec<u64> = Vec::new();
        for entry in fs::read_dir(path)? {
            let file_path = entry?.path();
            if file_path.is_file() {
                if let Some(id) = Self::parse_segment_id(&file_path) {
                    segment_ids.push(id);
                }
            }
        }

        // Newest first
        segment_ids.sort_unstable_by(|a, b| b.cmp(a));

        let mut segments = Vec::with_capacity(segment_ids.len());
        for id in &segment_ids {
            let source = SegmentSource::open(&Self::segment_path_with_dir(path, *id), schema.clone())?
                .with_clock(Arc::clone(&clock));
            segments.push(Arc::new(source));
        }

        let next_id = segment_ids.first().map(|&id| id + 1).unwrap_or(1);
        info!(dir = %path.display(), segments = segments.len(), "storage opened");

        Ok(Self {
            data_dir: path.to_path_buf(),
            segments: RwLock::new(segments),
            next_segment_id: AtomicU64::new(next_id),
            sync,
            clock,
        })
    }

    /// Writer for a new segment; register the result with `add_segment`
    pub fn new_segment_writer(&self, schema: SchemaPtr) -> Result<SegmentWriter> {
        let id = self.next_segment_id.fetch_add(1, Ordering::SeqCst);
        let writer = SegmentWriter::create(&self.segment_path(id), schema)?
            .with_sync(self.sync)
            .with_clock(Arc::clone(&self.clock));
        Ok(writer)
    }

    /// Make a finished segment visible to readers
    pub fn add_segment(&self, segment: Arc<SegmentSource>) {
        self.segments.write().insert(0, segment);
    }

    /// Open segments, newest first
    pub fn segments(&self) -> Vec<Arc<SegmentSource>> {
        self.segments.read().clone()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.read().len()
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Get the next segment ID (for testing/debugging)
    pub fn next_segment_id(&self) -> u64 {
        self.next_segment_id.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn segment_path(&self, id: u64) -> PathBuf {
        Self::segment_path_with_dir(&self.data_dir, id)
    }

    fn segment_path_with_dir(dir: &Path, id: u64) -> PathBuf {
        dir.join(format!("segment_{:06}.seg", id))
    }

    /// "segment_000042.seg" → Some(42)
    fn parse_segment_id(path: &Path) -> Option<u64> {
        if path.extension()? != "seg" {
            return None;
        }
        let name = path.file_stem()?.to_string_lossy();
        name.strip_prefix("segment_")?.parse().ok()
    }
}
