//! Role negotiation.
//!
//! Roles are derived, never exchanged: each peer sorts the ids it believes
//! live (plus itself) and reads its own role off its position. Peers with
//! the same view compute the same assignment.
//!
//! ```text
//! position 0 (host)      → HOST
//! low-power, any position → REPLICA (delegates compute to host)
//! other positions         → FLUID, RIGID, BEHAVIOR, FLUID, ...
//! ```

use ghost_replica::PeerId;
use serde::{Deserialize, Serialize};

/// Work ownership of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    /// Coordinates global environment and runs delegated compute.
    Host,
    /// Owns fluid simulation.
    FluidWorker,
    /// Owns rigid-body simulation.
    RigidWorker,
    /// Owns agent behaviour.
    BehaviorWorker,
    /// Mirrors state only.
    Replica,
}

impl Role {
    /// Worker rotation for non-host, full-power peers.
    const WORKER_CYCLE: [Role; 3] = [Role::FluidWorker, Role::RigidWorker, Role::BehaviorWorker];

    /// Check if this role runs simulation work.
    pub const fn is_worker(&self) -> bool {
        matches!(
            self,
            Role::FluidWorker | Role::RigidWorker | Role::BehaviorWorker
        )
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Role::Host => "HOST",
            Role::FluidWorker => "FLUID_WORKER",
            Role::RigidWorker => "RIGID_WORKER",
            Role::BehaviorWorker => "BEHAVIOR_WORKER",
            Role::Replica => "REPLICA",
        };
        f.write_str(name)
    }
}

/// Declared compute class of the local device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DevicePower {
    /// Cannot run simulation work; delegates to host.
    Low,
    /// Can take a worker role.
    High,
}

/// Hardware description used for power classification.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    /// Logical CPU cores.
    pub cores: u32,
    /// Memory in GiB.
    pub memory_gb: f32,
}

/// Boundary between low and high power. Heuristic; set from config.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerThresholds {
    /// Minimum cores for a high-power device.
    pub min_cores: u32,
    /// Minimum memory (GiB) for a high-power device.
    pub min_memory_gb: f32,
}

impl Default for PowerThresholds {
    fn default() -> Self {
        Self {
            min_cores: 4,
            min_memory_gb: 4.0,
        }
    }
}

impl DeviceProfile {
    /// Classify against thresholds. Both must be met for high power.
    pub fn classify(&self, thresholds: &PowerThresholds) -> DevicePower {
        if self.cores >= thresholds.min_cores && self.memory_gb >= thresholds.min_memory_gb {
            DevicePower::High
        } else {
            DevicePower::Low
        }
    }
}

/// Deterministic role assignment.
#[derive(Debug, Clone, Copy)]
pub struct RoleNegotiator {
    power: DevicePower,
}

impl RoleNegotiator {
    /// Negotiator for a device of the given power.
    pub const fn new(power: DevicePower) -> Self {
        Self { power }
    }

    /// Declared power.
    pub const fn power(&self) -> DevicePower {
        self.power
    }

    /// Compute this peer's role.
    ///
    /// `host` is the election result; `live` are the other live peers.
    pub fn negotiate(&self, self_id: PeerId, host: PeerId, live: &[PeerId]) -> Role {
        if self_id == host {
            return Role::Host;
        }
        if self.power == DevicePower::Low {
            return Role::Replica;
        }

        let mut ordered: Vec<PeerId> = live
            .iter()
            .copied()
            .chain(std::iter::once(self_id))
            .filter(|p| *p != host)
            .collect();
        ordered.sort();
        ordered.dedup();

        let position = ordered.iter().position(|p| *p == self_id).unwrap_or(0);
        Role::WORKER_CYCLE[position % Role::WORKER_CYCLE.len()]
    }
}
