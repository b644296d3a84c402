//! Inferred Leadership for Ghost Mesh
//!
//! The mesh has no election protocol. Peers emit heartbeats; each peer keeps
//! a [`LivenessTable`] of who it has heard from recently and **infers** the
//! host from that table alone.
//!
//! # Core Insight
//!
//! Leadership is a function of the live set, not an agreement about it.
//! Two peers that see the same live set name the same host without a single
//! extra message. Divergent views are possible during churn but last at most
//! one heartbeat period after the views re-align.
//!
//! # Roles
//!
//! The same sorted live set drives [`RoleNegotiator`]: the host coordinates,
//! full-power peers split simulation work by position, low-power peers mirror
//! state and delegate compute to the host.

mod election;
mod liveness;
mod role;

pub use election::{ElectionPolicy, MinIdElection};
pub use liveness::{Heartbeat, LivenessTable, HEARTBEAT_PERIOD, SILENCE_PERIODS};
pub use role::{DevicePower, DeviceProfile, PowerThresholds, Role, RoleNegotiator};

#[cfg(test)]
mod tests {
    use super::*;
    use ghost_replica::PeerId;
    use std::time::{Duration, Instant};

    #[test]
    fn host_reassigned_when_lowest_peer_goes_silent() {
        // Peer 2's view of {1, 2, 5}.
        let me = PeerId(2);
        let mut table = LivenessTable::with_defaults(me);
        let t0 = Instant::now();

        table.record_heartbeat(PeerId(1), t0);
        table.record_heartbeat(PeerId(5), t0);
        assert_eq!(MinIdElection.elect(me, &table.live_ids()), PeerId(1));

        // Peer 5 keeps beating, peer 1 goes silent.
        for s in 1..=6 {
            table.record_heartbeat(PeerId(5), t0 + Duration::from_secs(s));
        }
        let purged = table.purge(t0 + Duration::from_secs(6));
        assert_eq!(purged, vec![PeerId(1)]);

        assert_eq!(MinIdElection.elect(me, &table.live_ids()), me);
        let negotiator = RoleNegotiator::new(DevicePower::High);
        assert_eq!(negotiator.negotiate(me, me, &table.live_ids()), Role::Host);
    }
}
