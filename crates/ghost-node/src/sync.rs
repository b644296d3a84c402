//! Blackboard <-> mesh bridge.
//!
//! Local blackboard changes are throttled into replicated-map writes; inbound
//! mesh flushes pass a per-key gate and land on the blackboard tagged
//! [`UpdateSource::Mesh`], which the outbound side never re-offers.
//!
//! Global environment keys are accepted only from the elected host. A host
//! that sees another peer's global write win in the replica writes its own
//! value again; a peer that learns of a new host takes that host's values
//! from the replica.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ghost_protocols::{ContextKey, OutboundThrottle, Patch, PatchEntry};
use ghost_replica::PeerId;
use ghost_world::WorldStateSnapshot;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::blackboard::{Blackboard, SubscriberId, UpdateSource};
use crate::mesh::{self, GhostMesh};
use crate::scheduler::Scheduler;

/// Decides what an inbound value becomes on the blackboard; `None` drops it.
pub type SyncGate = Box<dyn Fn(ContextKey, &PatchEntry) -> Option<Value> + Send + Sync>;

/// Keeps one blackboard and one mesh in step.
pub struct SyncBridge {
    mesh: Arc<GhostMesh>,
    blackboard: Arc<Blackboard>,
    throttle: Mutex<OutboundThrottle>,
    gate: SyncGate,
    subscription: Mutex<Option<SubscriberId>>,
    timers: Scheduler,
    stopped: AtomicBool,
}

impl SyncBridge {
    /// Wire `blackboard` to `mesh`. Pending outbound changes are retried
    /// every `interval`.
    pub fn start(mesh: Arc<GhostMesh>, blackboard: Arc<Blackboard>, interval: Duration, gate: SyncGate) -> Arc<Self> {
        let throttle = OutboundThrottle::with_suppressor(
            interval,
            Box::new(|key, value| key == ContextKey::World && WorldStateSnapshot::value_is_wholly_remote(value)),
        );
        let bridge = Arc::new(Self {
            mesh,
            blackboard,
            throttle: Mutex::new(throttle),
            gate,
            subscription: Mutex::new(None),
            timers: Scheduler::new(),
            stopped: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&bridge);
        let id = bridge.blackboard.subscribe(move |change| {
            if change.source != UpdateSource::Local {
                return;
            }
            if let Some(bridge) = weak.upgrade() {
                bridge.offer(&change.values);
            }
        });
        *bridge.subscription.lock() = Some(id);

        let weak = Arc::downgrade(&bridge);
        bridge.mesh.on_sync(move |patch| {
            if let Some(bridge) = weak.upgrade() {
                bridge.apply_remote(patch);
            }
        });

        let weak = Arc::downgrade(&bridge);
        let local = bridge.mesh.local_id();
        bridge.mesh.on_host_change(move |host| {
            let Some(bridge) = weak.upgrade() else {
                return;
            };
            if host == local {
                bridge.reassert_globals();
            } else {
                bridge.adopt_globals(host);
            }
        });

        let weak = Arc::downgrade(&bridge);
        let _ = bridge.timers.every(interval, move || {
            if let Some(bridge) = weak.upgrade() {
                if bridge.throttle.lock().is_pending() {
                    bridge.flush();
                }
            }
        });

        bridge
    }

    /// Offer the whole blackboard now.
    pub fn flush(&self) {
        self.offer(&self.blackboard.snapshot());
    }

    /// Detach from the blackboard and stop the retry timer.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(id) = self.subscription.lock().take() {
            self.blackboard.unsubscribe(id);
        }
        self.timers.cancel_all();
    }

    fn offer(&self, values: &BTreeMap<String, Value>) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let is_host = self.mesh.is_host();
        let diff = self.throttle.lock().offer(values, mesh::now(), is_host);
        for (key, value) in diff.into_iter().flatten() {
            self.mesh.broadcast_event(key.as_str(), value);
        }
    }

    /// Write this host's global keys again, even if they were sent before.
    fn reassert_globals(&self) {
        self.throttle.lock().forget_global();
        self.flush();
    }

    /// Take `host`'s global values from the replica.
    fn adopt_globals(&self, host: PeerId) {
        let patch: Patch = ContextKey::ALL
            .into_iter()
            .filter(|key| key.is_global_environment())
            .filter_map(|key| {
                let entry = self.mesh.authored(key.as_str())?;
                (entry.origin == host).then(|| (key.as_str().to_string(), entry))
            })
            .collect();
        if !patch.is_empty() {
            debug!("Adopting {} global keys from host {}", patch.len(), host);
            self.apply_remote(&patch);
        }
    }

    fn apply_remote(&self, patch: &Patch) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let host = self.mesh.host();
        let mut overruled = false;
        let mut accepted = BTreeMap::new();
        for (raw_key, entry) in patch {
            let Some(key) = ContextKey::parse(raw_key) else {
                debug!("Ignoring unknown key {} from {}", raw_key, entry.origin);
                continue;
            };
            if key.is_global_environment() && entry.origin != host {
                debug!("Dropping {} from {}: host is {}", raw_key, entry.origin, host);
                overruled |= host == self.mesh.local_id();
                continue;
            }
            if let Some(value) = (self.gate)(key, entry) {
                self.throttle.lock().note_remote(key, value.clone());
                accepted.insert(raw_key.clone(), value);
            }
        }
        if !accepted.is_empty() {
            self.blackboard.update(accepted, UpdateSource::Mesh);
        }
        if overruled {
            self.reassert_globals();
        }
    }
}

impl std::fmt::Debug for SyncBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncBridge")
            .field("throttle", &*self.throttle.lock())
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GhostConfig;
    use crate::relay::{MemoryHub, SignalingRelay};
    use serde_json::json;

    fn pass_through() -> SyncGate {
        Box::new(|_, entry| Some(entry.value.clone()))
    }

    async fn pair(hub: &MemoryHub, room: &str, a: u64, b: u64) -> [(Arc<GhostMesh>, Arc<Blackboard>, Arc<SyncBridge>); 2] {
        let config = GhostConfig::from_lookup(|_| None).unwrap();
        let make = |id: u64| {
            let relay: Arc<dyn SignalingRelay> = Arc::new(hub.relay("r"));
            let mesh = GhostMesh::new(PeerId(id), &config, vec![relay]);
            let board = Arc::new(Blackboard::new());
            let bridge = SyncBridge::start(Arc::clone(&mesh), Arc::clone(&board), config.outbound_interval, pass_through());
            (mesh, board, bridge)
        };
        let first = make(a);
        let second = make(b);
        first.0.connect(room).await.unwrap();
        second.0.connect(room).await.unwrap();
        [first, second]
    }

    #[tokio::test(start_paused = true)]
    async fn local_change_reaches_peer_blackboard() {
        let hub = MemoryHub::new();
        let [(_mesh_a, board_a, _bridge_a), (_mesh_b, board_b, _bridge_b)] = pair(&hub, "bridge", 1, 2).await;

        board_a.set("telemetry", json!({"fps": 60}), UpdateSource::Local);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(board_b.get("telemetry"), Some(json!({"fps": 60})));
    }

    #[tokio::test(start_paused = true)]
    async fn burst_inside_window_is_not_lost() {
        let hub = MemoryHub::new();
        let [(_mesh_a, board_a, _bridge_a), (mesh_b, board_b, _bridge_b)] = pair(&hub, "burst", 1, 2).await;

        board_a.set("audio", json!("a"), UpdateSource::Local);
        board_a.set("audio", json!("b"), UpdateSource::Local);
        board_a.set("audio", json!("c"), UpdateSource::Local);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(board_b.get("audio"), Some(json!("c")));
        assert_eq!(mesh_b.get("audio"), Some(json!("c")));
    }

    #[tokio::test(start_paused = true)]
    async fn remote_values_are_not_echoed() {
        let hub = MemoryHub::new();
        let [(mesh_a, board_a, _bridge_a), (_mesh_b, board_b, _bridge_b)] = pair(&hub, "echo", 1, 2).await;
        let writes = Arc::new(Mutex::new(0usize));
        let w = Arc::clone(&writes);
        mesh_a.on_event("metaphor", move |_, _| *w.lock() += 1);

        board_a.set("metaphor", json!("garden"), UpdateSource::Local);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(board_b.get("metaphor"), Some(json!("garden")));

        // Peer 2 touching an unrelated key must not bounce "metaphor" back.
        board_b.set("telemetry", json!(1), UpdateSource::Local);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*writes.lock(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn gate_can_drop_values() {
        let hub = MemoryHub::new();
        let config = GhostConfig::from_lookup(|_| None).unwrap();
        let relay_a: Arc<dyn SignalingRelay> = Arc::new(hub.relay("r"));
        let relay_b: Arc<dyn SignalingRelay> = Arc::new(hub.relay("r"));
        let mesh_a = GhostMesh::new(PeerId(1), &config, vec![relay_a]);
        let mesh_b = GhostMesh::new(PeerId(2), &config, vec![relay_b]);
        let board_a = Arc::new(Blackboard::new());
        let board_b = Arc::new(Blackboard::new());
        let _a = SyncBridge::start(Arc::clone(&mesh_a), Arc::clone(&board_a), config.outbound_interval, pass_through());
        let _b = SyncBridge::start(
            Arc::clone(&mesh_b),
            Arc::clone(&board_b),
            config.outbound_interval,
            Box::new(|key, entry| (key != ContextKey::World).then(|| entry.value.clone())),
        );
        mesh_a.connect("gate").await.unwrap();
        mesh_b.connect("gate").await.unwrap();

        board_a.set("world", json!({"entities": []}), UpdateSource::Local);
        board_a.set("audio", json!("ping"), UpdateSource::Local);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(board_b.get("world"), None);
        assert_eq!(board_b.get("audio"), Some(json!("ping")));
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_bridge_sends_nothing() {
        let hub = MemoryHub::new();
        let [(_mesh_a, board_a, bridge_a), (_mesh_b, board_b, _bridge_b)] = pair(&hub, "stop", 1, 2).await;
        bridge_a.stop();
        board_a.set("telemetry", json!(9), UpdateSource::Local);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(board_b.get("telemetry"), None);
    }
}
