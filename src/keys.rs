//! Partition and clustering keys, tokens and partition ranges.

use std::cmp::Ordering;
use std::fmt;
use std::hash::Hasher;
use std::ops::Bound;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use twox_hash::XxHash64;

/// Ranking token of a partition key
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Token(pub i64);

/// Raw partition key bytes
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionKey(pub Bytes);

impl PartitionKey {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Maps partition keys onto the token ring
pub struct Partitioner;

impl Partitioner {
    pub fn token(key: &PartitionKey) -> Token {
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(key.as_bytes());
        Token(hasher.finish() as i64)
    }

    pub fn decorate(key: PartitionKey) -> DecoratedKey {
        DecoratedKey {
            token: Self::token(&key),
            key,
        }
    }
}

/// Partition key paired with its token
///
/// Ordered by token first, then by key bytes, which is the ring order every
/// reader iterates in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DecoratedKey {
    pub token: Token,
    pub key: PartitionKey,
}

impl DecoratedKey {
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Partitioner::decorate(PartitionKey::new(bytes))
    }
}

impl Ord for DecoratedKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.token
            .cmp(&other.token)
            .then_with(|| self.key.cmp(&other.key))
    }
}

impl PartialOrd for DecoratedKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for DecoratedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}, ", self.token.0)?;
        for b in self.key.as_bytes() {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "}}")
    }
}

/// Clustering key: ordered components, compared lexicographically
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusteringKey(pub Vec<Bytes>);

impl ClusteringKey {
    /// Key of the single row of a table without clustering columns
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn single(component: impl Into<Bytes>) -> Self {
        Self(vec![component.into()])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn byte_size(&self) -> usize {
        self.0.iter().map(|c| c.len()).sum()
    }
}

/// A range of decorated keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRange {
    pub start: Bound<DecoratedKey>,
    pub end: Bound<DecoratedKey>,
}

impl PartitionRange {
    /// Every partition
    pub fn full() -> Self {
        Self {
            start: Bound::Unbounded,
            end: Bound::Unbounded,
        }
    }

    /// Exactly one partition
    pub fn singular(key: DecoratedKey) -> Self {
        Self {
            start: Bound::Included(key.clone()),
            end: Bound::Included(key),
        }
    }

    /// `[key, +inf)`
    pub fn starting_with(key: DecoratedKey) -> Self {
        Self {
            start: Bound::Included(key),
            end: Bound::Unbounded,
        }
    }

    /// `(key, +inf)`
    pub fn starting_after(key: DecoratedKey) -> Self {
        Self {
            start: Bound::Excluded(key),
            end: Bound::Unbounded,
        }
    }

    /// `[start, end)`
    pub fn between(start: DecoratedKey, end: DecoratedKey) -> Self {
        Self {
            start: Bound::Included(start),
            end: Bound::Excluded(end),
        }
    }

    pub fn contains(&self, key: &DecoratedKey) -> bool {
        let after_start = match &self.start {
            Bound::Included(s) => key >= s,
            Bound::Excluded(s) => key > s,
            Bound::Unbounded => true,
        };
        after_start && !self.is_before(key)
    }

    /// True when `key` lies past the end of the range
    pub fn is_before(&self, key: &DecoratedKey) -> bool {
        match &self.end {
            Bound::Included(e) => key > e,
            Bound::Excluded(e) => key >= e,
            Bound::Unbounded => false,
        }
    }

    /// True when some key of this range sorts at or before `key`
    pub fn reaches_back_to(&self, key: &DecoratedKey) -> bool {
        match &self.start {
            Bound::Included(s) => s <= key,
            Bound::Excluded(s) => s < key,
            Bound::Unbounded => true,
        }
    }

    /// True when this range starts strictly earlier than `other`
    pub fn starts_before(&self, other: &PartitionRange) -> bool {
        match (&self.start, &other.start) {
            (_, Bound::Unbounded) => false,
            (Bound::Unbounded, _) => true,
            (Bound::Included(a), Bound::Included(b)) => a < b,
            (Bound::Included(a), Bound::Excluded(b)) => a <= b,
            (Bound::Excluded(a), Bound::Included(b)) => a < b,
            (Bound::Excluded(a), Bound::Excluded(b)) => a < b,
        }
    }

    /// The same range trimmed to start strictly after `key`
    pub fn resume_after(&self, key: &DecoratedKey) -> Self {
        let start = if self.reaches_back_to(key) {
            Bound::Excluded(key.clone())
        } else {
            self.start.clone()
        };
        Self {
            start,
            end: self.end.clone(),
        }
    }

    /// Bounds in the form accepted by `BTreeMap::range`
    pub fn bounds(&self) -> (Bound<&DecoratedKey>, Bound<&DecoratedKey>) {
        (self.start.as_ref(), self.end.as_ref())
    }

    /// Whether the range can contain any key at all
    pub fn is_empty(&self) -> bool {
        match (&self.start, &self.end) {
            (Bound::Included(s), Bound::Included(e)) => s > e,
            (Bound::Included(s), Bound::Excluded(e))
            | (Bound::Excluded(s), Bound::Included(e))
            | (Bound::Excluded(s), Bound::Excluded(e)) => s >= e,
            _ => false,
        }
    }
}
