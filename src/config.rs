//! Configuration for AtlasTable
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;

use crate::error::{AtlasError, Result};

/// Main configuration for an AtlasTable engine
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for flushed data
    /// Internal structure:
    ///   {data_dir}/
    ///     └── segments/        (flushed memtable segments)
    pub data_dir: PathBuf,

    /// fsync every segment before it is handed to `mark_flushed`
    pub sync_segments: bool,

    // -------------------------------------------------------------------------
    // Dirty Memory Configuration
    // -------------------------------------------------------------------------
    /// Virtual dirty bytes at which a flush is recommended
    pub dirty_soft_limit: usize,

    /// Virtual dirty bytes at which writers should be throttled
    pub dirty_hard_limit: usize,

    /// Real dirty bytes at which compaction passes run on the write path
    pub reclaim_threshold: usize,

    // -------------------------------------------------------------------------
    // Compaction Configuration
    // -------------------------------------------------------------------------
    /// Interval between background reclamation passes (milliseconds)
    pub reclaim_interval_ms: u64,

    /// Max partitions visited by a single incremental compaction step
    pub compaction_step_budget: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./atlastable_data"),
            sync_segments: true,
            dirty_soft_limit: 64 * 1024 * 1024,  // 64 MB
            dirty_hard_limit: 128 * 1024 * 1024, // 128 MB
            reclaim_threshold: 32 * 1024 * 1024, // 32 MB
            reclaim_interval_ms: 1000,
            compaction_step_budget: 128,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check that the limits are consistent with each other
    pub fn validate(&self) -> Result<()> {
        if self.dirty_soft_limit == 0 {
            return Err(AtlasError::Config("dirty_soft_limit must be > 0".to_string()));
        }
        if self.dirty_hard_limit < self.dirty_soft_limit {
            return Err(AtlasError::Config(format!(
                "dirty_hard_limit ({}) must be >= dirty_soft_limit ({})",
                self.dirty_hard_limit, self.dirty_soft_limit
            )));
        }
        if self.compaction_step_budget == 0 {
            return Err(AtlasError::Config(
                "compaction_step_budget must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all flushed segments)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Whether segments are fsynced before use
    pub fn sync_segments(mut self, sync: bool) -> Self {
        self.config.sync_segments = sync;
        self
    }

    /// Set the soft (flush) limit for virtual dirty memory (in bytes)
    pub fn dirty_soft_limit(mut self, bytes: usize) -> Self {
        self.config.dirty_soft_limit = bytes;
        self
    }

    /// Set the hard (throttle) limit for virtual dirty memory (in bytes)
    pub fn dirty_hard_limit(mut self, bytes: usize) -> Self {
        self.config.dirty_hard_limit = bytes;
        self
    }

    /// Set the real dirty memory level that triggers write-path compaction
    pub fn reclaim_threshold(mut self, bytes: usize) -> Self {
        self.config.reclaim_threshold = bytes;
        self
    }

    /// Set the background reclamation interval (in milliseconds)
    pub fn reclaim_interval_ms(mut self, ms: u64) -> Self {
        self.config.reclaim_interval_ms = ms;
        self
    }

    /// Set the number of partitions visited per compaction step
    pub fn compaction_step_budget(mut self, partitions: usize) -> Self {
        self.config.compaction_step_budget = partitions;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
