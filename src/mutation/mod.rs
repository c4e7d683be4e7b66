//! Mutation Module
//!
//! The data model of a write: one partition key plus the cells, rows and
//! tombstones written to it, expressed against a schema.
//!
//! ## Reconciliation
//! Mutations are never overwritten in place by later writes; two pieces of
//! data for the same partition are combined by reconciliation, which is
//! commutative and associative:
//! - higher timestamp wins per cell
//! - ties are broken deterministically (see [`Cell::reconcile_order`])
//! - a tombstone with timestamp >= a cell's suppresses that cell
//! - expiring cells turn dead once `now` reaches their expiry

mod cell;
mod partition;
mod row;

use bytes::Bytes;

pub use cell::{Cell, CellState, Expiry, Timestamp, Tombstone, MISSING_TIMESTAMP};
pub use partition::MutationPartition;
pub(crate) use partition::effective_tombstone;
pub use row::{RangeTombstone, Row};

use crate::clock::GcTime;
use crate::error::{AtlasError, Result};
use crate::keys::{ClusteringKey, DecoratedKey};
use crate::schema::{ColumnKind, SchemaPtr};

/// An update to exactly one partition
#[derive(Debug, Clone)]
pub struct Mutation {
    schema: SchemaPtr,
    key: DecoratedKey,
    partition: MutationPartition,
}

impl Mutation {
    /// Empty mutation for `key`
    pub fn new(schema: SchemaPtr, key: DecoratedKey) -> Self {
        Self {
            schema,
            key,
            partition: MutationPartition::new(),
        }
    }

    pub fn from_parts(schema: SchemaPtr, key: DecoratedKey, partition: MutationPartition) -> Self {
        Self {
            schema,
            key,
            partition,
        }
    }

    pub fn schema(&self) -> &SchemaPtr {
        &self.schema
    }

    pub fn key(&self) -> &DecoratedKey {
        &self.key
    }

    pub fn partition(&self) -> &MutationPartition {
        &self.partition
    }

    pub fn into_parts(self) -> (SchemaPtr, DecoratedKey, MutationPartition) {
        (self.schema, self.key, self.partition)
    }

    // =========================================================================
    // Builders
    // =========================================================================

    /// Write a regular column of a clustering row
    pub fn set_clustered_cell(
        &mut self,
        key: ClusteringKey,
        column: &str,
        value: impl Into<Bytes>,
        timestamp: Timestamp,
    ) -> Result<()> {
        self.schema.check_cell_column(column, ColumnKind::Regular)?;
        self.partition
            .set_cell(key, column.to_string(), Cell::live(timestamp, value));
        Ok(())
    }

    /// Write a regular column that expires `ttl` seconds after `now`
    pub fn set_expiring_cell(
        &mut self,
        key: ClusteringKey,
        column: &str,
        value: impl Into<Bytes>,
        timestamp: Timestamp,
        ttl: u32,
        now: GcTime,
    ) -> Result<()> {
        self.schema.check_cell_column(column, ColumnKind::Regular)?;
        self.partition.set_cell(
            key,
            column.to_string(),
            Cell::expiring(timestamp, value, ttl, now),
        );
        Ok(())
    }

    /// Write a static column
    pub fn set_static_cell(&mut self, column: &str, value: impl Into<Bytes>, timestamp: Timestamp) -> Result<()> {
        self.schema.check_cell_column(column, ColumnKind::Static)?;
        self.partition
            .set_static_cell(column.to_string(), Cell::live(timestamp, value));
        Ok(())
    }

    /// Delete one regular column of a row
    pub fn delete_cell(
        &mut self,
        key: ClusteringKey,
        column: &str,
        timestamp: Timestamp,
        deletion_time: GcTime,
    ) -> Result<()> {
        self.schema.check_cell_column(column, ColumnKind::Regular)?;
        self.partition
            .set_cell(key, column.to_string(), Cell::dead(timestamp, deletion_time));
        Ok(())
    }

    pub fn set_row_marker(&mut self, key: ClusteringKey, timestamp: Timestamp) {
        self.partition.set_row_marker(key, timestamp);
    }

    pub fn delete_row(&mut self, key: ClusteringKey, tombstone: Tombstone) {
        self.partition.apply_row_tombstone(key, tombstone);
    }

    pub fn delete_range(&mut self, rt: RangeTombstone) {
        self.partition.apply_range_tombstone(rt);
    }

    pub fn delete_partition(&mut self, tombstone: Tombstone) {
        self.partition.apply_delete(tombstone);
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Re-express this mutation under another schema
    pub fn upgrade(&self, schema: &SchemaPtr) -> Result<Mutation> {
        if self.schema.version() == schema.version() {
            return Ok(self.clone());
        }
        let mapping = self.schema.mapping_to(schema)?;
        let mut partition = self.partition.clone();
        partition.upgrade(&mapping);
        Ok(Mutation::from_parts(schema.clone(), self.key.clone(), partition))
    }

    /// Reconcile another mutation of the same partition into this one
    ///
    /// The result is expressed under this mutation's schema.
    pub fn apply(&mut self, other: &Mutation) -> Result<()> {
        if self.key != other.key {
            return Err(AtlasError::precondition(format!(
                "cannot merge mutations of different partitions: {} and {}",
                self.key, other.key
            )));
        }
        let other = other.upgrade(&self.schema)?;
        self.partition.apply(other.partition);
        Ok(())
    }

    /// Reconciled combination of two mutations
    pub fn merge(&self, other: &Mutation) -> Result<Mutation> {
        let mut merged = self.clone();
        merged.apply(other)?;
        Ok(merged)
    }

    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Mutation>() + self.key.key.as_bytes().len() + self.partition.memory_usage()
    }
}

/// Equal when they describe the same data for the same partition; the
/// schema they are expressed in is not compared.
impl PartialEq for Mutation {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.partition == other.partition
    }
}

impl Eq for Mutation {}
