//! Ghost Node - one participant in a shared world.
//!
//! Architecture:
//! - [`Blackboard`] holds the process-wide context facets
//! - [`WorldStore`] owns the reducer state; world snapshots enter it only
//!   through the [`Arbitrator`], whether generated here or received
//! - [`GhostMesh`] replicates facets and carries ephemeral events
//! - [`SyncBridge`] moves facets between the two, throttled
//! - Roles are renegotiated whenever the live set or host changes

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use ghost_consensus::{DevicePower, Role, RoleNegotiator};
use ghost_protocols::{ContextKey, PatchEntry};
use ghost_replica::{ContentHash, ContentKind, PeerId, ResidueRecord};
use ghost_world::{
    Action, Arbitration, Arbitrator, Consensus, Impact, ProposalSource, SecurityFilter, WorldStateSnapshot,
};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::blackboard::{Blackboard, UpdateSource};
use crate::config::GhostConfig;
use crate::error::{Error, Result};
use crate::mesh::{self, GhostMesh};
use crate::relay::SignalingRelay;
use crate::store::{StateChange, WorldStore};
use crate::sync::SyncBridge;

/// Confidence in the local world when this peer is host.
const HOST_CONFIDENCE: f64 = 1.0;
/// Confidence in the local world otherwise.
const PEER_CONFIDENCE: f64 = 0.5;

/// Source of candidate world snapshots (a generator, a solver, a script).
#[async_trait]
pub trait WorldProducer: Send + Sync {
    /// Produce a candidate for `intent`, given the current world.
    async fn produce(&self, intent: &Value, current: &WorldStateSnapshot) -> Result<Value>;
}

/// A running Ghost participant.
pub struct GhostNode {
    local: PeerId,
    config: GhostConfig,
    blackboard: Arc<Blackboard>,
    arbitrator: Arbitrator,
    store: WorldStore,
    mesh: Arc<GhostMesh>,
    bridge: Mutex<Option<Arc<SyncBridge>>>,
    negotiator: RoleNegotiator,
    role: Mutex<Role>,
    producer: Option<Arc<dyn WorldProducer>>,
    started: AtomicBool,
}

impl GhostNode {
    pub fn new(local: PeerId, config: GhostConfig, relays: Vec<Arc<dyn SignalingRelay>>) -> Result<Self> {
        let mesh = GhostMesh::new(local, &config, relays);
        Self::with_mesh(config, mesh)
    }

    /// Node over an already constructed mesh.
    pub fn with_mesh(config: GhostConfig, mesh: Arc<GhostMesh>) -> Result<Self> {
        let arbitrator = Arbitrator::with_parts(
            SecurityFilter::with_default_rules()?,
            config.stabilization,
            Box::new(config.divergence),
        );
        let power = config.device.classify(&config.power_thresholds);
        info!("Device {:?} classified as {:?}", config.device, power);

        Ok(Self {
            local: mesh.local_id(),
            config,
            blackboard: Arc::new(Blackboard::new()),
            arbitrator,
            store: WorldStore::new(),
            mesh,
            bridge: Mutex::new(None),
            negotiator: RoleNegotiator::new(power),
            role: Mutex::new(Role::Host),
            producer: None,
            started: AtomicBool::new(false),
        })
    }

    pub fn with_producer(mut self, producer: Arc<dyn WorldProducer>) -> Self {
        self.producer = Some(producer);
        self
    }

    /// Wire callbacks and join the configured room.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let weak = Arc::downgrade(self);
        let bridge = SyncBridge::start(
            Arc::clone(&self.mesh),
            Arc::clone(&self.blackboard),
            self.config.outbound_interval,
            Box::new(move |key, entry| weak.upgrade().and_then(|node| node.admit_remote(key, entry))),
        );
        *self.bridge.lock() = Some(bridge);

        let weak = Arc::downgrade(self);
        self.mesh.on_peer_change(move |count| {
            if let Some(node) = weak.upgrade() {
                debug!("{} peers in room", count);
                node.renegotiate();
            }
        });

        let weak = Arc::downgrade(self);
        self.mesh.on_host_change(move |host| {
            if let Some(node) = weak.upgrade() {
                node.blackboard.log(format!("Host is now {}", host));
                node.renegotiate();
            }
        });

        let weak = Arc::downgrade(self);
        self.mesh.on_delegation(move |from, intent| {
            if let Some(node) = weak.upgrade() {
                node.run_delegation(from, intent.clone());
            }
        });

        let weak = Arc::downgrade(self);
        self.mesh.on_content(move |record| {
            if let Some(node) = weak.upgrade() {
                node.blackboard
                    .log(format!("Received {:?} {}", record.kind, record.hash));
            }
        });

        let weak: Weak<Self> = Arc::downgrade(self);
        self.mesh.on_event(ContextKey::Telemetry.as_str(), move |value, origin| {
            if let Some(node) = weak.upgrade() {
                node.store.dispatch(&Action::RecordTelemetry {
                    key: origin.to_string(),
                    value: value.clone(),
                });
            }
        });

        self.mesh.connect(&self.config.room).await?;
        self.renegotiate();
        info!("Node {} started in room {} as {}", self.local, self.config.room, self.role());
        Ok(())
    }

    /// Leave the room and stop syncing.
    pub fn shutdown(&self) {
        if let Some(bridge) = self.bridge.lock().take() {
            bridge.stop();
        }
        self.mesh.disconnect();
        info!("Node {} shut down", self.local);
    }

    /// Arbitrate a locally produced world and apply it if accepted.
    pub fn propose_world(&self, proposed: Value, source: ProposalSource) -> Arbitration {
        let result = self.arbitrator.validate(&proposed, source);
        if let Some(world) = &result.state {
            self.dispatch(Action::SyncWorld {
                snapshot: world.clone(),
                now_ms: mesh::now_ms(),
            });
        }
        result
    }

    /// Apply a local action; a changed world is published to the mesh.
    pub fn dispatch(&self, action: Action) -> StateChange {
        let change = self.store.dispatch(&action);
        if change.world_changed {
            self.publish_world(&change.state.world);
        }
        change
    }

    /// Collision callback for the physics layer.
    pub fn report_impact(&self, impact: Impact) {
        self.dispatch(Action::RecordImpact { impact });
    }

    /// Ask for a new world.
    ///
    /// Low-power non-hosts delegate to the host and return `None`; the
    /// result arrives later as an ordinary world update.
    pub async fn request_world(&self, intent: Value) -> Result<Option<Arbitration>> {
        if self.negotiator.power() == DevicePower::Low && !self.mesh.is_host() {
            info!("Delegating world request to host {}", self.mesh.host());
            self.mesh.delegate_compute(intent)?;
            return Ok(None);
        }
        let world = self.produce(&intent).await?;
        Ok(Some(self.propose_world(world, ProposalSource::Generated)))
    }

    /// Share a verified structural outcome.
    pub fn record_residue(&self, payload: Value) -> Result<ContentHash> {
        self.mesh.announce_content(ContentKind::Residue, payload)
    }

    pub fn share_neural_map(&self, payload: Value) -> Result<ContentHash> {
        self.mesh.announce_content(ContentKind::NeuralMap, payload)
    }

    pub fn lookup_content(&self, kind: ContentKind, hash: &ContentHash) -> Option<ResidueRecord> {
        self.mesh.lookup_content(kind, hash)
    }

    pub fn local_id(&self) -> PeerId {
        self.local
    }

    pub fn role(&self) -> Role {
        *self.role.lock()
    }

    pub fn world(&self) -> WorldStateSnapshot {
        self.store.world()
    }

    pub fn store(&self) -> &WorldStore {
        &self.store
    }

    pub fn blackboard(&self) -> &Arc<Blackboard> {
        &self.blackboard
    }

    pub fn mesh(&self) -> &Arc<GhostMesh> {
        &self.mesh
    }

    async fn produce(&self, intent: &Value) -> Result<Value> {
        let producer = self
            .producer
            .clone()
            .ok_or_else(|| Error::Producer("no world producer configured".into()))?;
        let current = self.store.world();
        producer.produce(intent, &current).await
    }

    /// Host side of compute delegation: the result re-enters as a local
    /// world proposal and replicates like any other write.
    fn run_delegation(self: &Arc<Self>, from: PeerId, intent: Value) {
        if self.producer.is_none() {
            warn!("Delegation from {} dropped: no world producer", from);
            return;
        }
        let node = Arc::clone(self);
        tokio::spawn(async move {
            match node.produce(&intent).await {
                Ok(world) => {
                    let result = node.propose_world(world, ProposalSource::Local);
                    if result.success {
                        node.blackboard.log(format!("Computed world for {}", from));
                    }
                }
                Err(e) => error!("Delegated compute for {} failed: {}", from, e),
            }
        });
    }

    /// Gate for inbound facets. Worlds are arbitrated, re-attributed and
    /// reduced before they reach the blackboard. A world from a peer other
    /// than the host keeps the local environment.
    fn admit_remote(&self, key: ContextKey, entry: &PatchEntry) -> Option<Value> {
        if key != ContextKey::World {
            return Some(entry.value.clone());
        }

        let current = self.store.world();
        let consensus = Consensus {
            snapshot: &current,
            confidence: if self.mesh.is_host() { HOST_CONFIDENCE } else { PEER_CONFIDENCE },
        };
        let result = self
            .arbitrator
            .validate_with(&entry.value, ProposalSource::Peer(entry.origin), Some(&consensus));
        let mut world = result.state?;
        world.adopt(entry.origin, self.local);
        if entry.origin != self.mesh.host() {
            // Only the host sets the environment; keep ours.
            world.environment = current.environment.clone();
        }

        let change = self.store.dispatch(&Action::SyncWorld {
            snapshot: world,
            now_ms: mesh::now_ms(),
        });
        match serde_json::to_value(&change.state.world) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Failed to encode world from {}: {}", entry.origin, e);
                None
            }
        }
    }

    fn publish_world(&self, world: &WorldStateSnapshot) {
        match serde_json::to_value(world) {
            Ok(value) => {
                self.blackboard.set(ContextKey::World.as_str(), value, UpdateSource::Local);
            }
            Err(e) => warn!("Failed to encode world: {}", e),
        }
    }

    fn renegotiate(&self) {
        let role = self
            .negotiator
            .negotiate(self.local, self.mesh.host(), &self.mesh.live_peers());
        let previous = std::mem::replace(&mut *self.role.lock(), role);
        if previous != role {
            self.blackboard.log(format!("Role {} -> {}", previous, role));
        }
    }
}

impl std::fmt::Debug for GhostNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GhostNode")
            .field("local", &self.local)
            .field("role", &self.role())
            .field("mesh", &self.mesh)
            .finish_non_exhaustive()
    }
}
