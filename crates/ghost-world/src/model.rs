//! World state model.

use std::collections::HashSet;

use ghost_replica::PeerId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A point or direction in world space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3::new(0.0, 0.0, 0.0);
    pub const X: Vec3 = Vec3::new(1.0, 0.0, 0.0);

    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn add(self, o: Vec3) -> Vec3 {
        Vec3::new(self.x + o.x, self.y + o.y, self.z + o.z)
    }

    pub fn sub(self, o: Vec3) -> Vec3 {
        Vec3::new(self.x - o.x, self.y - o.y, self.z - o.z)
    }

    pub fn scale(self, s: f64) -> Vec3 {
        Vec3::new(self.x * s, self.y * s, self.z * s)
    }

    pub fn length(self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// Who authored an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum EntityOrigin {
    /// Created on this peer.
    #[default]
    Local,
    /// Received from `peer`.
    Remote { peer: PeerId },
}

impl EntityOrigin {
    pub const fn is_remote(&self) -> bool {
        matches!(self, EntityOrigin::Remote { .. })
    }
}

fn default_radius() -> f64 {
    0.5
}

fn default_mass() -> f64 {
    1.0
}

/// A simulated body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub kind: String,
    pub position: Vec3,
    #[serde(default)]
    pub velocity: Vec3,
    #[serde(default = "default_radius")]
    pub radius: f64,
    #[serde(default = "default_mass")]
    pub mass: f64,
    #[serde(default)]
    pub origin: EntityOrigin,
}

impl Entity {
    /// Local entity with default size and mass.
    pub fn new(id: impl Into<String>, kind: impl Into<String>, position: Vec3) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            position,
            velocity: Vec3::ZERO,
            radius: default_radius(),
            mass: default_mass(),
            origin: EntityOrigin::Local,
        }
    }
}

/// Global environment of the world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Environment {
    /// Vertical acceleration.
    pub gravity: f64,
    pub wind: Vec3,
    /// Free-form atmosphere label ("dusk", "storm", ...).
    pub atmosphere: String,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            gravity: -9.81,
            wind: Vec3::ZERO,
            atmosphere: String::new(),
        }
    }
}

/// Simulation mode. Unrecognized values normalize to [`SimMode::Physics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimMode {
    #[default]
    Physics,
    Sandbox,
    Narrative,
    Paused,
}

impl SimMode {
    /// Normalize a raw mode string.
    pub fn normalize(raw: &str) -> SimMode {
        match raw.trim().to_ascii_lowercase().as_str() {
            "physics" => SimMode::Physics,
            "sandbox" => SimMode::Sandbox,
            "narrative" => SimMode::Narrative,
            "paused" => SimMode::Paused,
            _ => SimMode::Physics,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            SimMode::Physics => "physics",
            SimMode::Sandbox => "sandbox",
            SimMode::Narrative => "narrative",
            SimMode::Paused => "paused",
        }
    }
}

/// The authoritative simulated world.
///
/// `mode` stays a raw string on the wire so snapshots from newer peers still
/// parse; the reducer normalizes it on acceptance.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorldStateSnapshot {
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub mode: String,
}

impl WorldStateSnapshot {
    /// Look up an entity by id.
    pub fn entity(&self, id: &str) -> Option<&Entity> {
        self.entities.iter().find(|e| e.id == id)
    }

    /// Check if every entity was received from the mesh (and there is at least one).
    pub fn is_wholly_remote(&self) -> bool {
        !self.entities.is_empty() && self.entities.iter().all(|e| e.origin.is_remote())
    }

    /// [`is_wholly_remote`](Self::is_wholly_remote) on a raw replicated value.
    /// Values that are not snapshots are never considered remote.
    pub fn value_is_wholly_remote(value: &Value) -> bool {
        serde_json::from_value::<WorldStateSnapshot>(value.clone())
            .map(|w| w.is_wholly_remote())
            .unwrap_or(false)
    }

    /// Re-attribute a snapshot received from `from`.
    ///
    /// Entities the sender created become `Remote { from }`; entities the
    /// sender itself received from us become `Local` again.
    pub fn adopt(&mut self, from: PeerId, local: PeerId) {
        for entity in &mut self.entities {
            entity.origin = match entity.origin {
                EntityOrigin::Local => EntityOrigin::Remote { peer: from },
                EntityOrigin::Remote { peer } if peer == local => EntityOrigin::Local,
                other => other,
            };
        }
    }

    /// Structural checks beyond the serde schema.
    pub fn check(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for entity in &self.entities {
            if entity.id.is_empty() {
                return Err("entity with empty id".into());
            }
            if !seen.insert(entity.id.as_str()) {
                return Err(format!("duplicate entity id {}", entity.id));
            }
            if !entity.position.is_finite() || !entity.velocity.is_finite() {
                return Err(format!("entity {} has non-finite coordinates", entity.id));
            }
            if !(entity.radius.is_finite() && entity.radius >= 0.0) {
                return Err(format!("entity {} has invalid radius", entity.id));
            }
            if !(entity.mass.is_finite() && entity.mass > 0.0) {
                return Err(format!("entity {} has invalid mass", entity.id));
            }
        }
        if !self.environment.gravity.is_finite() || !self.environment.wind.is_finite() {
            return Err("environment has non-finite values".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn minimal_snapshot_fills_defaults() {
        let world: WorldStateSnapshot = serde_json::from_value(json!({
            "entities": [{"id": "a", "kind": "crate", "position": {"x": 0.0, "y": 1.0, "z": 0.0}}]
        }))
        .unwrap();
        let a = world.entity("a").unwrap();
        assert_eq!(a.radius, 0.5);
        assert_eq!(a.mass, 1.0);
        assert_eq!(a.origin, EntityOrigin::Local);
        assert_eq!(world.environment.gravity, -9.81);
        assert!(world.check().is_ok());
    }

    #[test]
    fn mode_normalizes_to_physics() {
        assert_eq!(SimMode::normalize("SANDBOX"), SimMode::Sandbox);
        assert_eq!(SimMode::normalize("hyperdrive"), SimMode::Physics);
        assert_eq!(SimMode::normalize(""), SimMode::Physics);
    }

    #[test]
    fn adopt_tags_sender_and_restores_ours() {
        let me = PeerId(1);
        let sender = PeerId(2);
        let mut world = WorldStateSnapshot {
            entities: vec![
                Entity::new("theirs", "rock", Vec3::ZERO),
                Entity {
                    origin: EntityOrigin::Remote { peer: me },
                    ..Entity::new("ours", "rock", Vec3::X)
                },
                Entity {
                    origin: EntityOrigin::Remote { peer: PeerId(7) },
                    ..Entity::new("third", "rock", Vec3::X)
                },
            ],
            ..Default::default()
        };
        world.adopt(sender, me);

        assert_eq!(world.entity("theirs").unwrap().origin, EntityOrigin::Remote { peer: sender });
        assert_eq!(world.entity("ours").unwrap().origin, EntityOrigin::Local);
        assert_eq!(world.entity("third").unwrap().origin, EntityOrigin::Remote { peer: PeerId(7) });
        assert!(!world.is_wholly_remote());
    }

    #[test]
    fn wholly_remote_requires_entities() {
        assert!(!WorldStateSnapshot::default().is_wholly_remote());

        let mut world = WorldStateSnapshot {
            entities: vec![Entity::new("a", "rock", Vec3::ZERO)],
            ..Default::default()
        };
        world.adopt(PeerId(4), PeerId(1));
        let value = serde_json::to_value(&world).unwrap();
        assert!(WorldStateSnapshot::value_is_wholly_remote(&value));
        assert!(!WorldStateSnapshot::value_is_wholly_remote(&json!({"gravity": 1})));
    }

    #[test]
    fn check_rejects_duplicates_and_nan() {
        let dup = WorldStateSnapshot {
            entities: vec![Entity::new("a", "x", Vec3::ZERO), Entity::new("a", "y", Vec3::X)],
            ..Default::default()
        };
        assert!(dup.check().is_err());

        let nan = WorldStateSnapshot {
            entities: vec![Entity::new("a", "x", Vec3::new(f64::NAN, 0.0, 0.0))],
            ..Default::default()
        };
        assert!(nan.check().is_err());
    }
}
