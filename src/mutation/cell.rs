//! Cells, tombstones and the reconciliation rule.

use std::cmp::Ordering;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::clock::GcTime;

/// Write timestamp (microseconds, client supplied)
pub type Timestamp = i64;

/// Timestamp of "no write at all"
pub const MISSING_TIMESTAMP: Timestamp = i64::MIN;

/// Deletion marker
///
/// Ordered by timestamp, then deletion time, so the larger tombstone is the
/// one that wins reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tombstone {
    pub timestamp: Timestamp,
    pub deletion_time: GcTime,
}

impl Tombstone {
    /// The absent tombstone; deletes nothing
    pub const NONE: Tombstone = Tombstone {
        timestamp: MISSING_TIMESTAMP,
        deletion_time: GcTime(0),
    };

    pub fn new(timestamp: Timestamp, deletion_time: GcTime) -> Self {
        Self {
            timestamp,
            deletion_time,
        }
    }

    pub fn is_some(&self) -> bool {
        self.timestamp != MISSING_TIMESTAMP
    }

    /// Keep the larger of the two
    pub fn apply(&mut self, other: Tombstone) {
        if other > *self {
            *self = other;
        }
    }

    /// Whether data written at `timestamp` is suppressed by this tombstone
    pub fn deletes(&self, timestamp: Timestamp) -> bool {
        self.is_some() && timestamp <= self.timestamp
    }
}

impl Default for Tombstone {
    fn default() -> Self {
        Tombstone::NONE
    }
}

/// TTL information of an expiring cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Expiry {
    pub ttl: u32,
    pub expires_at: GcTime,
}

/// Payload of a cell
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CellState {
    Live { value: Bytes, expiry: Option<Expiry> },
    Dead { deletion_time: GcTime },
}

/// A single column value with its write timestamp
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cell {
    pub timestamp: Timestamp,
    pub state: CellState,
}

impl Cell {
    pub fn live(timestamp: Timestamp, value: impl Into<Bytes>) -> Self {
        Self {
            timestamp,
            state: CellState::Live {
                value: value.into(),
                expiry: None,
            },
        }
    }

    pub fn expiring(timestamp: Timestamp, value: impl Into<Bytes>, ttl: u32, now: GcTime) -> Self {
        Self {
            timestamp,
            state: CellState::Live {
                value: value.into(),
                expiry: Some(Expiry {
                    ttl,
                    expires_at: now.plus_seconds(ttl),
                }),
            },
        }
    }

    pub fn dead(timestamp: Timestamp, deletion_time: GcTime) -> Self {
        Self {
            timestamp,
            state: CellState::Dead { deletion_time },
        }
    }

    pub fn value(&self) -> Option<&Bytes> {
        match &self.state {
            CellState::Live { value, .. } => Some(value),
            CellState::Dead { .. } => None,
        }
    }

    pub fn is_dead_marker(&self) -> bool {
        matches!(self.state, CellState::Dead { .. })
    }

    /// Live as of `now` (not deleted and not expired)
    pub fn is_live(&self, now: GcTime) -> bool {
        match &self.state {
            CellState::Live { expiry: None, .. } => true,
            CellState::Live { expiry: Some(e), .. } => e.expires_at > now,
            CellState::Dead { .. } => false,
        }
    }

    /// Turn an expired cell into the dead cell it has become
    pub fn expire(&mut self, now: GcTime) {
        if let CellState::Live {
            expiry: Some(e), ..
        } = &self.state
        {
            if e.expires_at <= now {
                self.state = CellState::Dead {
                    deletion_time: e.expires_at,
                };
            }
        }
    }

    /// Total order used by reconciliation; the greater cell wins.
    ///
    /// Timestamp first. On a tie: dead beats live, then the larger deletion
    /// time (dead) or larger value (live), then expiring beats non-expiring,
    /// then the later expiry.
    pub fn reconcile_order(&self, other: &Cell) -> Ordering {
        self.timestamp.cmp(&other.timestamp).then_with(|| {
            match (&self.state, &other.state) {
                (CellState::Dead { .. }, CellState::Live { .. }) => Ordering::Greater,
                (CellState::Live { .. }, CellState::Dead { .. }) => Ordering::Less,
                (CellState::Dead { deletion_time: a }, CellState::Dead { deletion_time: b }) => {
                    a.cmp(b)
                }
                (
                    CellState::Live {
                        value: va,
                        expiry: ea,
                    },
                    CellState::Live {
                        value: vb,
                        expiry: eb,
                    },
                ) => va.cmp(vb).then_with(|| ea.cmp(eb)),
            }
        })
    }

    /// Reconcile two cells of the same column, keeping the winner
    pub fn reconcile(self, other: Cell) -> Cell {
        if other.reconcile_order(&self) == Ordering::Greater {
            other
        } else {
            self
        }
    }

    /// Approximate heap + inline footprint
    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Cell>() + self.value().map_or(0, |v| v.len())
    }
}
