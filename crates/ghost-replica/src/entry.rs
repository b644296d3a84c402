//! Replicated map entry types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::PeerId;

/// Causal stamp attached to every write.
///
/// Ordered by `clock` first, then by `origin`. The clock is a Lamport
/// counter: a replica never issues a stamp lower than one it has seen, so a
/// write made after observing another always wins against it. Concurrent
/// writes with equal clocks resolve deterministically by origin id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    /// Lamport clock value.
    pub clock: u64,
    /// Peer that made the write.
    pub origin: PeerId,
}

impl Stamp {
    /// Create a stamp.
    pub const fn new(clock: u64, origin: PeerId) -> Self {
        Self { clock, origin }
    }
}

/// A keyed value with its causal stamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapEntry {
    /// Facet key.
    pub key: String,
    /// The value.
    pub value: Value,
    /// Stamp of the write that produced this value.
    pub stamp: Stamp,
}

impl MapEntry {
    /// Create an entry.
    pub fn new(key: impl Into<String>, value: Value, stamp: Stamp) -> Self {
        Self {
            key: key.into(),
            value,
            stamp,
        }
    }

    /// Check if this entry supersedes another.
    pub fn is_newer_than(&self, other: &Self) -> bool {
        self.stamp > other.stamp
    }

    /// Merge with another entry, keeping the newer one.
    /// Returns true if self was updated.
    pub fn merge(&mut self, other: Self) -> bool {
        if other.is_newer_than(self) {
            *self = other;
            true
        } else {
            false
        }
    }
}

/// Where an applied change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeOrigin {
    /// Written by this replica.
    Local,
    /// Received from a peer.
    Remote(PeerId),
}

impl ChangeOrigin {
    /// True for changes received from the mesh.
    pub const fn is_remote(&self) -> bool {
        matches!(self, ChangeOrigin::Remote(_))
    }
}

/// A change that was applied to the map.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    /// The entry now stored under the key.
    pub entry: MapEntry,
    /// Whether it was written here or received.
    pub origin: ChangeOrigin,
}
