//! Inferred leader election.
//!
//! # Minimum-Id Rule
//!
//! ```text
//! HOST = min(live_ids ∪ {self_id})
//! ```
//!
//! There is no voting round. Every peer evaluates the rule against its own
//! liveness table. Two peers that have not yet heard each other may both
//! believe they are HOST; the belief heals within one heartbeat period once
//! each sees the other's heartbeat.
//!
//! The rule is a pure function of the id set, so arrival order of
//! heartbeats never changes the outcome.

use ghost_replica::PeerId;

/// Pluggable election rule.
///
/// A quorum-based policy can replace [`MinIdElection`] without touching the
/// transport: the mesh only ever asks "who is host given this live set".
pub trait ElectionPolicy: Send + Sync {
    /// Elect a host from `live` (peers other than self) plus `self_id`.
    fn elect(&self, self_id: PeerId, live: &[PeerId]) -> PeerId;

    /// Check if `self_id` is the elected host.
    fn is_host(&self, self_id: PeerId, live: &[PeerId]) -> bool {
        self.elect(self_id, live) == self_id
    }
}

/// Lowest id wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct MinIdElection;

impl ElectionPolicy for MinIdElection {
    fn elect(&self, self_id: PeerId, live: &[PeerId]) -> PeerId {
        live.iter().copied().fold(self_id, PeerId::min)
    }
}
