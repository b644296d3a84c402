//! Ghost Mesh Replica
//!
//! The shared data structures every peer keeps in sync:
//!
//! - [`ReplicatedMap`]: key → JSON facets of the shared context, last-write-wins
//!   per key under Lamport stamps. Every applied change reports whether it was
//!   written locally or received, so echoes of our own writes are dropped.
//! - [`EphemeralLog`]: hard-capped log of transient peer signals.
//! - [`ContentStore`]: records addressed by the BLAKE3 hash of their payload.
//!
//! # Conflict Resolution
//!
//! A write is stamped `(clock, origin)`. The clock is bumped past everything
//! the replica has observed, so a write made after seeing another supersedes
//! it. Truly concurrent writes tie on clock and fall back to the origin id,
//! which every peer orders identically.

pub mod content;
mod entry;
mod ephemeral;
pub mod error;
mod map;
mod peer;

pub use content::{content_hash, ContentHash, ContentKind, ContentStore, MemoryContentStore, ResidueRecord};
pub use entry::{Change, ChangeOrigin, MapEntry, Stamp};
pub use ephemeral::{EphemeralLog, DEFAULT_EPHEMERAL_CAP};
pub use error::{Error, Result};
pub use map::{ReplicatedMap, ReplicatedStore};
pub use peer::PeerId;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn three_replicas_converge_regardless_of_delivery_order() {
        let mut a = ReplicatedMap::new(PeerId(1));
        let mut b = ReplicatedMap::new(PeerId(2));
        let mut c = ReplicatedMap::new(PeerId(3));

        let wa = a.set("world", json!("from-a")).unwrap();
        let wb = b.set("world", json!("from-b")).unwrap();
        let wc = c.set("metaphor", json!("forest")).unwrap();

        a.transact(PeerId(3), vec![wc.clone()]);
        a.transact(PeerId(2), vec![wb.clone()]);
        b.transact(PeerId(1), vec![wa.clone()]);
        b.transact(PeerId(3), vec![wc]);
        c.transact(PeerId(2), vec![wb]);
        c.transact(PeerId(1), vec![wa]);

        assert_eq!(a.snapshot(), b.snapshot());
        assert_eq!(b.snapshot(), c.snapshot());
    }
}
