//! Replicated map state.

use std::collections::HashMap;

use serde_json::Value;
use tracing::trace;

use crate::entry::{Change, ChangeOrigin, MapEntry, Stamp};
use crate::PeerId;

/// Contract for the replicated document behind the mesh.
///
/// Any conflict-free map satisfies it as long as per-key updates are
/// causally ordered and every applied change reports whether it was written
/// locally or received from a peer.
pub trait ReplicatedStore {
    /// Read the current value of a key.
    fn get(&self, key: &str) -> Option<&Value>;

    /// Write a value locally.
    ///
    /// Returns the stamped entry to ship to peers, or `None` when the value
    /// is equal to what is already stored (writes are idempotent).
    fn set(&mut self, key: &str, value: Value) -> Option<MapEntry>;

    /// Apply a batch of remote entries from one peer as a single transaction.
    /// Returns how many entries changed local state.
    fn transact(&mut self, from: PeerId, entries: Vec<MapEntry>) -> usize;

    /// Drain every change applied since the last call, in application order.
    fn observe(&mut self) -> Vec<Change>;
}

/// Last-write-wins replicated map with Lamport stamps.
#[derive(Debug)]
pub struct ReplicatedMap {
    /// This replica's id (stamps local writes).
    local: PeerId,
    /// Highest clock value seen so far.
    clock: u64,
    /// Current entries.
    entries: HashMap<String, MapEntry>,
    /// Changes not yet observed.
    pending: Vec<Change>,
}

impl ReplicatedMap {
    /// Create an empty map owned by `local`.
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            clock: 0,
            entries: HashMap::new(),
            pending: Vec::new(),
        }
    }

    /// The owning replica.
    pub fn local(&self) -> PeerId {
        self.local
    }

    /// Current Lamport clock.
    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Get the full entry for a key.
    pub fn entry(&self, key: &str) -> Option<&MapEntry> {
        self.entries.get(key)
    }

    /// All entries (for full-state sync to a joining peer).
    pub fn entries(&self) -> impl Iterator<Item = &MapEntry> {
        self.entries.values()
    }

    /// Snapshot of all entries, sorted by key.
    pub fn snapshot(&self) -> Vec<MapEntry> {
        let mut all: Vec<MapEntry> = self.entries.values().cloned().collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply one remote entry. Returns true if it replaced local state.
    fn apply_remote(&mut self, from: PeerId, entry: MapEntry) -> bool {
        self.clock = self.clock.max(entry.stamp.clock);

        // Our own writes coming back around the mesh carry nothing new.
        if entry.stamp.origin == self.local {
            trace!("Dropping echo of local write to {}", entry.key);
            return false;
        }

        let applied = match self.entries.get_mut(&entry.key) {
            Some(existing) => existing.merge(entry.clone()),
            None => {
                self.entries.insert(entry.key.clone(), entry.clone());
                true
            }
        };

        if applied {
            self.pending.push(Change {
                entry,
                origin: ChangeOrigin::Remote(from),
            });
        }
        applied
    }
}

impl ReplicatedStore for ReplicatedMap {
    fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).map(|e| &e.value)
    }

    fn set(&mut self, key: &str, value: Value) -> Option<MapEntry> {
        if self.get(key) == Some(&value) {
            return None;
        }

        self.clock += 1;
        let entry = MapEntry::new(key, value, Stamp::new(self.clock, self.local));
        self.entries.insert(key.to_string(), entry.clone());
        self.pending.push(Change {
            entry: entry.clone(),
            origin: ChangeOrigin::Local,
        });
        Some(entry)
    }

    fn transact(&mut self, from: PeerId, entries: Vec<MapEntry>) -> usize {
        let mut applied = 0;
        for entry in entries {
            if self.apply_remote(from, entry) {
                applied += 1;
            }
        }
        applied
    }

    fn observe(&mut self) -> Vec<Change> {
        std::mem::take(&mut self.pending)
    }
}
