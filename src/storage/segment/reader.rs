//! Segment Reader
//!
//! Opens segment files and serves their partitions through an in-memory
//! index for O(log n) lookups.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::{read_u16, read_u32, read_u64, FOOTER_SIZE, HEADER_SIZE, MAGIC, VERSION};
use crate::clock::{Clock, SystemClock};
use crate::error::{AtlasError, Result};
use crate::keys::{DecoratedKey, PartitionRange};
use crate::mutation::MutationPartition;
use crate::reader::{MaterializedReader, MutationReader, PartitionLookup};
use crate::schema::{SchemaDescriptor, SchemaPtr};
use crate::storage::DataSource;

/// Readers of a segment
pub type SegmentReader = MaterializedReader<SegmentSource>;

/// An open segment file
///
/// The file handle sits behind a mutex so readers can share the source;
/// every lookup seeks to the partition it needs.
pub struct SegmentSource {
    path: PathBuf,
    schema: SchemaPtr,
    file: Mutex<BufReader<File>>,
    /// key → file offset of the partition entry
    index: BTreeMap<DecoratedKey, u64>,
    file_size: u64,
    clock: Arc<dyn Clock>,
}

impl SegmentSource {
    /// Open a segment of the table whose current schema is `current`
    ///
    /// Validates header and data checksum, then loads the index. The
    /// segment keeps the schema it was written in; readers upgrade from it.
    pub fn open(path: &Path, current: SchemaPtr) -> Result<Self> {
        let mut file = File::open(path)?;
        let file_size = file.metadata()?.len();
        if file_size < HEADER_SIZE + FOOTER_SIZE {
            return Err(AtlasError::Corruption(format!(
                "segment {} is too short ({} bytes)",
                path.display(),
                file_size
            )));
        }

        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)?;
        if &header[0..4] != MAGIC {
            return Err(AtlasError::Storage(format!(
                "Invalid segment magic: expected ATSG, got {:?}",
                &header[0..4]
            )));
        }
        let version = read_u16(&header, 4)?;
        if version != VERSION {
            return Err(AtlasError::Storage(format!(
                "Unsupported segment version: {}",
                version
            )));
        }
        let partition_count = read_u64(&header, 6)?;

        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let mut footer = [0u8; FOOTER_SIZE as usize];
        file.read_exact(&mut footer)?;
        let index_offset = read_u64(&footer, 0)?;
        let data_crc = read_u32(&footer, 8)?;
        if index_offset < HEADER_SIZE || index_offset > file_size - FOOTER_SIZE {
            return Err(AtlasError::Corruption(format!(
                "segment {} index offset {} out of bounds",
                path.display(),
                index_offset
            )));
        }

        // Data block checksum
        file.seek(SeekFrom::Start(HEADER_SIZE))?;
        let mut data = vec![0u8; (index_offset - HEADER_SIZE) as usize];
        file.read_exact(&mut data)?;
        if crc32fast::hash(&data) != data_crc {
            return Err(AtlasError::Corruption(format!(
                "segment {} data checksum mismatch",
                path.display()
            )));
        }

        let schema_len = read_u32(&data, 0)? as usize;
        let raw = data.get(4..4 + schema_len).ok_or_else(|| {
            AtlasError::Corruption(format!("segment {} schema block truncated", path.display()))
        })?;
        let descriptor: SchemaDescriptor = bincode::deserialize(raw)?;
        if !descriptor.describes(&current) {
            debug!(
                path = %path.display(),
                written_in = %descriptor.version,
                current = %current.version(),
                "segment written under an older schema"
            );
        }
        let schema = descriptor.resolve(&current);

        // Index block: [len(4)][offset(8)][key]
        let mut index_data = vec![0u8; (file_size - FOOTER_SIZE - index_offset) as usize];
        file.read_exact(&mut index_data)?;
        let mut index = BTreeMap::new();
        let mut pos = 0;
        while pos < index_data.len() {
            let key_len = read_u32(&index_data, pos)? as usize;
            let offset = read_u64(&index_data, pos + 4)?;
            pos += 12;
            let raw = index_data.get(pos..pos + key_len).ok_or_else(|| {
                AtlasError::Corruption(format!("segment {} index truncated", path.display()))
            })?;
            let key: DecoratedKey = bincode::deserialize(raw)?;
            pos += key_len;
            index.insert(key, offset);
        }
        if index.len() as u64 != partition_count {
            return Err(AtlasError::Corruption(format!(
                "segment {} has {} index entries, header says {}",
                path.display(),
                index.len(),
                partition_count
            )));
        }

        Ok(Self {
            path: path.to_path_buf(),
            schema,
            file: Mutex::new(BufReader::new(file)),
            index,
            file_size,
            clock: Arc::new(SystemClock::default()),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn partition_count(&self) -> usize {
        self.index.len()
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Smallest and largest key, `None` for an empty segment
    pub fn key_range(&self) -> Option<(&DecoratedKey, &DecoratedKey)> {
        let first = self.index.keys().next()?;
        let last = self.index.keys().next_back()?;
        Some((first, last))
    }

    /// Read the partition stored at `offset`
    fn read_partition(&self, offset: u64) -> Result<(DecoratedKey, MutationPartition)> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut len = [0u8; 4];
        file.read_exact(&mut len)?;
        let mut body = vec![0u8; u32::from_le_bytes(len) as usize];
        file.read_exact(&mut body)?;
        Ok(bincode::deserialize(&body)?)
    }
}

impl PartitionLookup for SegmentSource {
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
        let Some((key, &offset)) = self.index.range::<DecoratedKey, _>(range.bounds()).next() else {
            return Ok(None);
        };
        let (stored, partition) = self.read_partition(offset)?;
        if &stored != key {
            return Err(AtlasError::Corruption(format!(
                "segment {} offset {} holds {}, index says {}",
                self.path.display(),
                offset,
                stored,
                key
            )));
        }
        Ok(Some((stored, partition)))
    }
}

impl DataSource for SegmentSource {
    fn create_reader(self: Arc<Self>, schema: SchemaPtr, range: PartitionRange) -> Result<Box<dyn MutationReader>> {
        let clock = Arc::clone(&self.clock);
        Ok(Box::new(MaterializedReader::new(self, schema, range, clock)))
    }
}
