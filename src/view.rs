//! Materialized-view hook.
//!
//! The memtable does not compute view updates. After each `apply` it hands
//! the views that may be affected, together with the partition state before
//! and after the write, to an injected [`ViewUpdateSink`].

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::keys::{DecoratedKey, PartitionRange};
use crate::mutation::{Mutation, Row};

/// What a view selects from its base table
#[derive(Debug, Clone)]
pub struct ViewDefinition {
    name: String,
    /// Base partitions the view covers
    key_filter: PartitionRange,
    /// Base columns the view reads; `None` for all of them
    columns: Option<BTreeSet<String>>,
}

impl ViewDefinition {
    /// View over every partition and column
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_filter: PartitionRange::full(),
            columns: None,
        }
    }

    pub fn with_key_filter(mut self, range: PartitionRange) -> Self {
        self.key_filter = range;
        self
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn partition_key_matches(&self, key: &DecoratedKey) -> bool {
        self.key_filter.contains(key)
    }

    /// False only when the update certainly leaves the view unchanged
    pub fn may_be_affected_by(&self, update: &Mutation) -> bool {
        if !self.partition_key_matches(update.key()) {
            return false;
        }
        let partition = update.partition();
        if partition.tombstone().is_some() || !partition.range_tombstones().is_empty() {
            return true;
        }
        self.row_touches_view(partition.static_row())
            || partition.rows().values().any(|row| self.row_touches_view(row))
    }

    fn row_touches_view(&self, row: &Row) -> bool {
        if row.marker.is_some() || row.tombstone.is_some() {
            return true;
        }
        match &self.columns {
            None => !row.cells.is_empty(),
            Some(selected) => row.cells.keys().any(|c| selected.contains(c)),
        }
    }
}

/// Inputs for computing view deltas of one applied mutation
#[derive(Debug, Clone)]
pub struct ViewUpdate {
    pub views: Vec<Arc<ViewDefinition>>,
    pub key: DecoratedKey,
    /// Reconciled partition before the write; `None` if it held no data
    pub before: Option<Mutation>,
    /// Reconciled partition after the write
    pub after: Mutation,
}

/// Consumer of view inputs (the view update engine)
pub trait ViewUpdateSink: Send + Sync {
    fn on_update(&self, update: ViewUpdate);
}
