//! Operation identifiers and the per-replica Lamport clock.
//!
//! An [`OperationId`] is `(counter, replica)`. The derived ordering compares
//! the counter first and the replica second, which gives the total order the
//! RGA uses to break ties between concurrent inserts at the same anchor.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one participant that generates operations.
///
/// `0` is reserved for content seeded from a stored snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(pub u64);

impl ReplicaId {
    /// Replica that owns elements restored from a snapshot.
    pub const SNAPSHOT: ReplicaId = ReplicaId(0);

    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

impl From<u64> for ReplicaId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Lamport-style operation identifier.
///
/// Field order matters: `Ord` is derived, so ids sort by counter, then replica.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId {
    pub counter: u64,
    pub replica: ReplicaId,
}

impl OperationId {
    /// Sentinel anchor meaning "start of document". Never assigned to an element.
    pub const START: OperationId = OperationId {
        counter: 0,
        replica: ReplicaId(0),
    };

    pub fn new(counter: u64, replica: impl Into<ReplicaId>) -> Self {
        Self {
            counter,
            replica: replica.into(),
        }
    }

    pub fn is_start(&self) -> bool {
        *self == Self::START
    }

    /// Id of the `n`-th element of a run that starts at `self`.
    pub fn offset(&self, n: u64) -> Self {
        Self {
            counter: self.counter + n,
            replica: self.replica,
        }
    }

    /// True if `other` directly follows `self` inside one replica's run.
    pub fn is_followed_by(&self, other: &OperationId) -> bool {
        self.replica == other.replica && self.counter + 1 == other.counter
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.counter, self.replica)
    }
}

/// Per-replica Lamport clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LamportClock {
    current: u64,
}

impl LamportClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(current: u64) -> Self {
        Self { current }
    }

    /// Last counter value handed out or observed.
    pub fn current(&self) -> u64 {
        self.current
    }

    /// Reserve `span` consecutive counter values and return the first one.
    pub fn reserve(&mut self, span: u64) -> u64 {
        let first = self.current + 1;
        self.current += span.max(1);
        first
    }

    /// Merge a counter seen on a remote operation.
    pub fn observe(&mut self, counter: u64) {
        if counter > self.current {
            self.current = counter;
        }
    }
}
