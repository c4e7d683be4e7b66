//! Segment Writer
//!
//! Writes a flush reader's partitions to a new segment file.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use super::reader::SegmentSource;
use super::{COUNT_OFFSET, HEADER_SIZE, MAGIC, VERSION};
use crate::clock::{Clock, SystemClock};
use crate::error::{AtlasError, Result};
use crate::keys::DecoratedKey;
use crate::mutation::MutationPartition;
use crate::reader::MutationFragment;
use crate::schema::SchemaPtr;
use crate::storage::{FragmentCollector, PartitionSink};

/// Builds one segment from partitions arriving in ring order
pub struct SegmentWriter {
    /// Output file path
    path: PathBuf,
    /// Schema the partitions are written in
    schema: SchemaPtr,
    writer: BufWriter<File>,
    partition_count: u64,
    /// Current write position (for index)
    current_offset: u64,
    /// Index: encoded key → file offset of its partition
    index: Vec<(Vec<u8>, u64)>,
    /// Running CRC of the data block
    data_hasher: crc32fast::Hasher,
    collector: FragmentCollector,
    sync: bool,
    clock: Arc<dyn Clock>,
}

impl SegmentWriter {
    /// Create the file and write its header
    pub fn create(path: &Path, schema: SchemaPtr) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        let mut writer = BufWriter::new(file);

        // Partition count is patched in by finish
        writer.write_all(MAGIC)?;
        writer.write_all(&VERSION.to_le_bytes())?;
        writer.write_all(&0u64.to_le_bytes())?;

        // Schema block opens the checksummed data block
        let mut data_hasher = crc32fast::Hasher::new();
        let descriptor = bincode::serialize(&schema.descriptor())?;
        let len_bytes = u32::try_from(descriptor.len())
            .map_err(|_| AtlasError::Storage("schema too large for a segment".to_string()))?
            .to_le_bytes();
        writer.write_all(&len_bytes)?;
        writer.write_all(&descriptor)?;
        data_hasher.update(&len_bytes);
        data_hasher.update(&descriptor);

        Ok(Self {
            path: path.to_path_buf(),
            schema,
            writer,
            partition_count: 0,
            current_offset: HEADER_SIZE + 4 + descriptor.len() as u64,
            index: Vec::new(),
            data_hasher,
            collector: FragmentCollector::default(),
            sync: true,
            clock: Arc::new(SystemClock::default()),
        })
    }

    /// Whether `finish` fsyncs the file (default: yes)
    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    /// Clock handed to the resulting source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn partition_count(&self) -> u64 {
        self.partition_count
    }

    /// Append one partition (must come after every partition written so far)
    pub fn add_partition(&mut self, key: &DecoratedKey, partition: &MutationPartition) -> Result<()> {
        let encoded_key = bincode::serialize(key)?;
        let body = bincode::serialize(&(key, partition))?;
        let len = u32::try_from(body.len())
            .map_err(|_| AtlasError::Storage(format!("partition {} too large for a segment", key)))?;

        self.index.push((encoded_key, self.current_offset));

        let len_bytes = len.to_le_bytes();
        self.writer.write_all(&len_bytes)?;
        self.writer.write_all(&body)?;
        self.data_hasher.update(&len_bytes);
        self.data_hasher.update(&body);

        self.current_offset += 4 + body.len() as u64;
        self.partition_count += 1;
        Ok(())
    }

    /// Write index and footer, then open the finished segment
    pub fn finish_segment(mut self) -> Result<Arc<SegmentSource>> {
        self.collector.finish()?;
        let index_offset = self.current_offset;

        // Index block: [len(4)][offset(8)][key]
        for (key, offset) in &self.index {
            self.writer.write_all(&(key.len() as u32).to_le_bytes())?;
            self.writer.write_all(&offset.to_le_bytes())?;
            self.writer.write_all(key)?;
        }

        let data_crc = self.data_hasher.finalize();
        self.writer.write_all(&index_offset.to_le_bytes())?;
        self.writer.write_all(&data_crc.to_le_bytes())?;
        self.writer.write_all(&[0u8; 4])?;
        self.writer.flush()?;

        let mut file = self
            .writer
            .into_inner()
            .map_err(|e| AtlasError::Storage(format!("Failed to flush segment: {}", e)))?;
        file.seek(SeekFrom::Start(COUNT_OFFSET))?;
        file.write_all(&self.partition_count.to_le_bytes())?;
        if self.sync {
            file.sync_all()?;
        }
        drop(file);

        debug!(
            path = %self.path.display(),
            partitions = self.partition_count,
            bytes = index_offset,
            "segment written"
        );
        let source = SegmentSource::open(&self.path, self.schema)?.with_clock(self.clock);
        Ok(Arc::new(source))
    }
}

impl PartitionSink for SegmentWriter {
    type Output = SegmentSource;

    fn consume(&mut self, fragment: MutationFragment) -> Result<()> {
        if let Some((key, partition)) = self.collector.push(fragment)? {
            self.add_partition(&key, &partition)?;
        }
        Ok(())
    }

    fn finish(self) -> Result<Arc<SegmentSource>> {
        self.finish_segment()
    }
}
