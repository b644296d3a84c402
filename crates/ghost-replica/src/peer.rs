//! Peer identity.
//!
//! A peer id is assigned once per connection and never reused. Ids are
//! totally ordered; the ordering is what leader election runs on, so it must
//! be the same on every peer.

use serde::{Deserialize, Serialize};

/// Opaque, comparable peer identifier assigned at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub u64);

impl PeerId {
    /// Create from a raw value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Draw a fresh random id.
    ///
    /// Zero is skipped so a default-initialized id is never mistaken for a
    /// live peer.
    pub fn random() -> Self {
        loop {
            let raw: u64 = rand::random();
            if raw != 0 {
                return Self(raw);
            }
        }
    }

    /// Raw value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer-{:016x}", self.0)
    }
}

impl From<u64> for PeerId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_follows_raw_value() {
        assert!(PeerId(1) < PeerId(2));
        assert_eq!(PeerId(7).max(PeerId(3)), PeerId(7));
    }

    #[test]
    fn random_is_never_zero() {
        for _ in 0..64 {
            assert_ne!(PeerId::random().get(), 0);
        }
    }

    #[test]
    fn serializes_as_bare_number() {
        let json = serde_json::to_string(&PeerId(42)).unwrap();
        assert_eq!(json, "42");
        let back: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, PeerId(42));
    }
}
