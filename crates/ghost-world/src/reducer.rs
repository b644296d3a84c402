//! Deterministic state machine.
//!
//! [`reduce`] is total and pure: every action, including ones this build
//! does not understand, maps a state to a new state without side effects.
//! Replaying the same action sequence always yields the same state.
//!
//! World snapshots enter only through [`Action::SyncWorld`], and only after
//! arbitration.

use std::collections::{BTreeMap, VecDeque};

use ghost_replica::PeerId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{Entity, Environment, SimMode, Vec3, WorldStateSnapshot};

/// Retained log lines.
pub const LOG_CAP: usize = 200;

/// Retained impact records.
pub const IMPACT_CAP: usize = 64;

/// A collision reported by the physics layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Impact {
    pub a: String,
    pub b: String,
    /// Impulse magnitude.
    pub force: f64,
    pub at: Vec3,
}

/// One step of a quest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestStep {
    pub label: String,
    #[serde(default)]
    pub done: bool,
}

/// Narrative objective shown to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quest {
    pub id: String,
    pub title: String,
    pub steps: Vec<QuestStep>,
}

impl Quest {
    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| s.done)
    }
}

/// Local view of another participant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    pub position: Vec3,
}

/// Everything the local reducer owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppState {
    pub world: WorldStateSnapshot,
    pub mode: SimMode,
    /// Unix millis of the last accepted world snapshot.
    pub last_update_ms: u64,
    /// Set once the first world has manifested.
    pub ui_unlocked: bool,
    pub peers: BTreeMap<PeerId, Presence>,
    pub impacts: VecDeque<Impact>,
    pub telemetry: BTreeMap<String, Value>,
    pub logs: VecDeque<String>,
    pub quest: Option<Quest>,
}

impl AppState {
    /// Canonical initial state.
    pub fn initial() -> Self {
        Self {
            world: WorldStateSnapshot::default(),
            mode: SimMode::Physics,
            last_update_ms: 0,
            ui_unlocked: false,
            peers: BTreeMap::new(),
            impacts: VecDeque::new(),
            telemetry: BTreeMap::new(),
            logs: VecDeque::new(),
            quest: None,
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::initial()
    }
}

/// State transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    // Session
    PeerJoined {
        peer: PeerId,
        #[serde(default)]
        position: Vec3,
    },
    PeerMoved { peer: PeerId, position: Vec3 },
    PeerLeft { peer: PeerId },

    // World
    /// Accept an arbitrated snapshot.
    SyncWorld { snapshot: WorldStateSnapshot, now_ms: u64 },
    ResetSimulation,
    SpawnEntity { entity: Entity },
    UpdateEntity {
        id: String,
        #[serde(default)]
        position: Option<Vec3>,
        #[serde(default)]
        velocity: Option<Vec3>,
    },
    RemoveEntity { id: String },
    SetEnvironment { environment: Environment },
    RecordImpact { impact: Impact },

    // Bookkeeping
    RecordTelemetry { key: String, value: Value },
    AppendLog { line: String },
    SetQuest { quest: Quest },
    CompleteQuestStep { index: usize },

    /// Any tag this build does not know.
    #[serde(other)]
    Unknown,
}

fn push_capped<T>(queue: &mut VecDeque<T>, item: T, cap: usize) {
    queue.push_back(item);
    while queue.len() > cap {
        queue.pop_front();
    }
}

/// Apply one action.
pub fn reduce(state: &AppState, action: &Action) -> AppState {
    let mut next = state.clone();
    match action {
        Action::PeerJoined { peer, position } => {
            next.peers.insert(*peer, Presence { position: *position });
        }
        Action::PeerMoved { peer, position } => {
            if let Some(p) = next.peers.get_mut(peer) {
                p.position = *position;
            }
        }
        Action::PeerLeft { peer } => {
            next.peers.remove(peer);
        }

        Action::SyncWorld { snapshot, now_ms } => {
            let mode = SimMode::normalize(&snapshot.mode);
            next.world = snapshot.clone();
            next.world.mode = mode.as_str().to_string();
            next.mode = mode;
            next.last_update_ms = *now_ms;
            next.ui_unlocked = true;
        }
        Action::ResetSimulation => return AppState::initial(),
        Action::SpawnEntity { entity } => {
            match next.world.entities.iter_mut().find(|e| e.id == entity.id) {
                Some(existing) => *existing = entity.clone(),
                None => next.world.entities.push(entity.clone()),
            }
        }
        Action::UpdateEntity { id, position, velocity } => {
            if let Some(e) = next.world.entities.iter_mut().find(|e| &e.id == id) {
                if let Some(p) = position {
                    e.position = *p;
                }
                if let Some(v) = velocity {
                    e.velocity = *v;
                }
            }
        }
        Action::RemoveEntity { id } => {
            next.world.entities.retain(|e| &e.id != id);
        }
        Action::SetEnvironment { environment } => {
            next.world.environment = environment.clone();
        }
        Action::RecordImpact { impact } => {
            push_capped(&mut next.impacts, impact.clone(), IMPACT_CAP);
        }

        Action::RecordTelemetry { key, value } => {
            next.telemetry.insert(key.clone(), value.clone());
        }
        Action::AppendLog { line } => {
            push_capped(&mut next.logs, line.clone(), LOG_CAP);
        }
        Action::SetQuest { quest } => {
            next.quest = Some(quest.clone());
        }
        Action::CompleteQuestStep { index } => {
            if let Some(step) = next.quest.as_mut().and_then(|q| q.steps.get_mut(*index)) {
                step.done = true;
            }
        }

        Action::Unknown => {}
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityOrigin;
    use serde_json::json;

    fn world(mode: &str) -> WorldStateSnapshot {
        WorldStateSnapshot {
            entities: vec![Entity::new("tower", "block", Vec3::new(0.0, 2.0, 0.0))],
            environment: Environment::default(),
            mode: mode.into(),
        }
    }

    #[test]
    fn sync_world_unlocks_and_normalizes() {
        let s0 = AppState::initial();
        assert!(!s0.ui_unlocked);

        let s1 = reduce(&s0, &Action::SyncWorld { snapshot: world("warp"), now_ms: 10 });
        assert!(s1.ui_unlocked);
        assert_eq!(s1.mode, SimMode::Physics);
        assert_eq!(s1.world.mode, "physics");
        assert_eq!(s1.last_update_ms, 10);
        assert!(s1.world.entity("tower").is_some());
    }

    #[test]
    fn sync_world_is_idempotent_except_timestamp() {
        let s0 = AppState::initial();
        let snap = world("sandbox");
        let s1 = reduce(&s0, &Action::SyncWorld { snapshot: snap.clone(), now_ms: 100 });
        let s2 = reduce(&s1, &Action::SyncWorld { snapshot: snap, now_ms: 250 });

        assert_eq!(s2.last_update_ms, 250);
        let mut s2_aligned = s2.clone();
        s2_aligned.last_update_ms = s1.last_update_ms;
        assert_eq!(s2_aligned, s1);
    }

    #[test]
    fn reset_returns_full_initial_state() {
        let mut s = AppState::initial();
        for action in [
            Action::SyncWorld { snapshot: world("narrative"), now_ms: 5 },
            Action::PeerJoined { peer: PeerId(3), position: Vec3::X },
            Action::AppendLog { line: "hello".into() },
            Action::RecordTelemetry { key: "fps".into(), value: json!(60) },
        ] {
            s = reduce(&s, &action);
        }
        assert_ne!(s, AppState::initial());
        assert_eq!(reduce(&s, &Action::ResetSimulation), AppState::initial());
    }

    #[test]
    fn unknown_action_is_noop() {
        let action: Action = serde_json::from_value(json!({"type": "SUMMON_DRAGON", "size": 9})).unwrap();
        assert_eq!(action, Action::Unknown);

        let s = reduce(&AppState::initial(), &Action::SyncWorld { snapshot: world("physics"), now_ms: 1 });
        assert_eq!(reduce(&s, &action), s);
    }

    #[test]
    fn entity_lifecycle() {
        let mut s = AppState::initial();
        s = reduce(&s, &Action::SpawnEntity { entity: Entity::new("ball", "sphere", Vec3::ZERO) });
        s = reduce(
            &s,
            &Action::UpdateEntity {
                id: "ball".into(),
                position: Some(Vec3::new(1.0, 2.0, 3.0)),
                velocity: None,
            },
        );
        let ball = s.world.entity("ball").unwrap();
        assert_eq!(ball.position, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(ball.origin, EntityOrigin::Local);

        s = reduce(&s, &Action::RemoveEntity { id: "ball".into() });
        assert!(s.world.entities.is_empty());
    }

    #[test]
    fn session_actions_track_presence() {
        let mut s = reduce(&AppState::initial(), &Action::PeerJoined { peer: PeerId(4), position: Vec3::ZERO });
        s = reduce(&s, &Action::PeerMoved { peer: PeerId(4), position: Vec3::X });
        assert_eq!(s.peers[&PeerId(4)].position, Vec3::X);

        // Moving an unknown peer does not create it.
        s = reduce(&s, &Action::PeerMoved { peer: PeerId(8), position: Vec3::X });
        assert!(!s.peers.contains_key(&PeerId(8)));

        s = reduce(&s, &Action::PeerLeft { peer: PeerId(4) });
        assert!(s.peers.is_empty());
    }

    #[test]
    fn logs_and_impacts_are_bounded() {
        let mut s = AppState::initial();
        for i in 0..(LOG_CAP + 10) {
            s = reduce(&s, &Action::AppendLog { line: format!("line {}", i) });
        }
        assert_eq!(s.logs.len(), LOG_CAP);
        assert_eq!(s.logs.front().map(String::as_str), Some("line 10"));

        for _ in 0..(IMPACT_CAP + 1) {
            s = reduce(
                &s,
                &Action::RecordImpact {
                    impact: Impact { a: "a".into(), b: "b".into(), force: 1.0, at: Vec3::ZERO },
                },
            );
        }
        assert_eq!(s.impacts.len(), IMPACT_CAP);
    }

    #[test]
    fn quest_steps_complete() {
        let quest = Quest {
            id: "q1".into(),
            title: "Raise the arch".into(),
            steps: vec![
                QuestStep { label: "gather".into(), done: false },
                QuestStep { label: "stack".into(), done: false },
            ],
        };
        let mut s = reduce(&AppState::initial(), &Action::SetQuest { quest });
        s = reduce(&s, &Action::CompleteQuestStep { index: 0 });
        s = reduce(&s, &Action::CompleteQuestStep { index: 9 });
        let quest = s.quest.as_ref().unwrap();
        assert!(quest.steps[0].done);
        assert!(!quest.is_complete());
    }
}
