//! Schema Module
//!
//! Table schemas and the column mapping used when data written under one
//! schema version is read (or applied) under another.
//!
//! ## Upgrade Rules
//! Columns are matched by name:
//! - present in both, compatible types → kept
//! - present only in the source → dropped
//! - present only in the target → absent on every old row
//! - incompatible type reuse, or static/regular kind change → `DataIntegrity`

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{AtlasError, Result};

/// Shared, immutable schema handle
pub type SchemaPtr = Arc<Schema>;

/// Unique identifier of a built schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SchemaVersion(pub u64);

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

static NEXT_SCHEMA_VERSION: AtomicU64 = AtomicU64::new(1);

/// Role a column plays in the table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnKind {
    PartitionKey,
    ClusteringKey,
    Static,
    Regular,
}

impl ColumnKind {
    /// Whether cells of this column live in rows (static or regular)
    pub fn holds_cells(self) -> bool {
        matches!(self, ColumnKind::Static | ColumnKind::Regular)
    }
}

/// Value type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Bytes,
    Text,
    Int,
    BigInt,
    Boolean,
}

impl ColumnType {
    /// Whether values written as `other` can be read as `self`
    pub fn is_value_compatible_with(self, other: ColumnType) -> bool {
        self == other || self == ColumnType::Bytes
    }
}

/// A single column definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    pub column_type: ColumnType,
    pub kind: ColumnKind,
}

/// Table schema
#[derive(Debug)]
pub struct Schema {
    keyspace: String,
    table: String,
    version: SchemaVersion,
    columns: Vec<ColumnDefinition>,
    by_name: HashMap<String, usize>,
}

impl Schema {
    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn version(&self) -> SchemaVersion {
        self.version
    }

    /// All columns in definition order
    pub fn columns(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    /// Look up a column by name
    pub fn column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.by_name.get(name).map(|&i| &self.columns[i])
    }

    /// Columns that carry cells in the static row
    pub fn static_columns(&self) -> impl Iterator<Item = &ColumnDefinition> {
        self.columns.iter().filter(|c| c.kind == ColumnKind::Static)
    }

    /// Columns that carry cells in clustering rows
    pub fn regular_columns(&self) -> impl Iterator<Item = &ColumnDefinition> {
        self.columns.iter().filter(|c| c.kind == ColumnKind::Regular)
    }

    /// Number of clustering key components
    pub fn clustering_key_size(&self) -> usize {
        self.columns
            .iter()
            .filter(|c| c.kind == ColumnKind::ClusteringKey)
            .count()
    }

    /// Check that a cell-holding column exists with the expected kind
    pub fn check_cell_column(&self, name: &str, kind: ColumnKind) -> Result<()> {
        match self.column(name) {
            Some(def) if def.kind == kind => Ok(()),
            Some(def) => Err(AtlasError::integrity(format!(
                "column {} is {:?}, not {:?}",
                name, def.kind, kind
            ))),
            None => Err(AtlasError::integrity(format!(
                "unknown column {} in {}.{} ({})",
                name, self.keyspace, self.table, self.version
            ))),
        }
    }

    /// Persistable description of this schema
    pub fn descriptor(&self) -> SchemaDescriptor {
        SchemaDescriptor {
            keyspace: self.keyspace.clone(),
            table: self.table.clone(),
            version: self.version,
            columns: self.columns.clone(),
        }
    }

    /// Build the column mapping used to read data written under `self` as `target`
    pub fn mapping_to(&self, target: &Schema) -> Result<ColumnMapping> {
        let mut keep = HashMap::new();
        for col in self.columns.iter().filter(|c| c.kind.holds_cells()) {
            let Some(new) = target.column(&col.name) else {
                continue;
            };
            if new.kind != col.kind {
                return Err(AtlasError::integrity(format!(
                    "column {} changed kind from {:?} to {:?} ({} -> {})",
                    col.name, col.kind, new.kind, self.version, target.version
                )));
            }
            if !new.column_type.is_value_compatible_with(col.column_type) {
                return Err(AtlasError::integrity(format!(
                    "column {} reused with incompatible type {:?} -> {:?} ({} -> {})",
                    col.name, col.column_type, new.column_type, self.version, target.version
                )));
            }
            keep.insert(col.name.clone(), col.kind);
        }
        Ok(ColumnMapping {
            from: self.version,
            to: target.version,
            keep,
        })
    }
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
    }
}

impl Eq for Schema {}

/// Result of matching two schemas column by column
#[derive(Debug, Clone)]
pub struct ColumnMapping {
    from: SchemaVersion,
    to: SchemaVersion,
    keep: HashMap<String, ColumnKind>,
}

impl ColumnMapping {
    pub fn from_version(&self) -> SchemaVersion {
        self.from
    }

    pub fn to_version(&self) -> SchemaVersion {
        self.to
    }

    /// Same schema on both sides, nothing to translate
    pub fn is_identity(&self) -> bool {
        self.from == self.to
    }

    /// Whether a column written under the source schema survives
    pub fn keeps(&self, column: &str) -> bool {
        self.keep.contains_key(column)
    }
}

/// Column set of a schema as stored alongside data written in it
///
/// Version numbers are only unique within one process; a descriptor read
/// back later is matched against live schemas by its columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub keyspace: String,
    pub table: String,
    /// Version of the writing schema, for logs
    pub version: SchemaVersion,
    pub columns: Vec<ColumnDefinition>,
}

impl SchemaDescriptor {
    /// Whether `schema` has exactly these columns
    pub fn describes(&self, schema: &Schema) -> bool {
        self.keyspace == schema.keyspace && self.table == schema.table && self.columns == schema.columns
    }

    /// `current` when it has the same columns, otherwise a rebuilt schema
    /// that readers upgrade from
    pub fn resolve(self, current: &SchemaPtr) -> SchemaPtr {
        if self.describes(current) {
            return current.clone();
        }
        SchemaBuilder {
            keyspace: self.keyspace,
            table: self.table,
            columns: self.columns,
        }
        .build()
    }
}

/// Builder for schemas
///
/// Cloning the builder and adding columns is the usual way to derive an
/// altered schema; every `build()` yields a new [`SchemaVersion`].
#[derive(Debug, Clone)]
pub struct SchemaBuilder {
    keyspace: String,
    table: String,
    columns: Vec<ColumnDefinition>,
}

impl SchemaBuilder {
    pub fn new(keyspace: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            keyspace: keyspace.into(),
            table: table.into(),
            columns: Vec::new(),
        }
    }

    /// Add a column (replaces an existing column of the same name)
    pub fn with_column(mut self, name: impl Into<String>, column_type: ColumnType, kind: ColumnKind) -> Self {
        let name = name.into();
        self.columns.retain(|c| c.name != name);
        self.columns.push(ColumnDefinition {
            name,
            column_type,
            kind,
        });
        self
    }

    /// Remove a column by name
    pub fn without_column(mut self, name: &str) -> Self {
        self.columns.retain(|c| c.name != name);
        self
    }

    pub fn build(self) -> SchemaPtr {
        let by_name = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.clone(), i))
            .collect();
        Arc::new(Schema {
            keyspace: self.keyspace,
            table: self.table,
            version: SchemaVersion(NEXT_SCHEMA_VERSION.fetch_add(1, Ordering::Relaxed)),
            columns: self.columns,
            by_name,
        })
    }
}
