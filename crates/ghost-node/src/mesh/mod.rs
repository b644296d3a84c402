//! Mesh transport.
//!
//! [`GhostMesh`] runs a [`MeshCore`] on tokio: it races relay handshakes,
//! owns the link reader task and the mesh timers, and fans core effects out
//! to registered callbacks. All core access goes through one lock; callbacks
//! run after it is released, so a handler may call back into the mesh.
//!
//! Transport faults never surface to callers. A lost or unreachable relay
//! drops the mesh into [`ConnectionStatus::LocalSovereignty`] and a rejoin is
//! retried every `rejoin_interval`.

mod engine;

pub use self::engine::{ConnectionStatus, CoreConfig, MeshCore, MeshEffect};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::future::select_ok;
use ghost_consensus::{ElectionPolicy, MinIdElection};
use ghost_protocols::{EventKind, Patch, PatchEntry, VisualEvent, WireMessage};
use ghost_replica::{ContentHash, ContentKind, ContentStore, MemoryContentStore, PeerId, ResidueRecord};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::config::GhostConfig;
use crate::error::{Error, Result};
use crate::relay::{RelayLink, SignalingRelay};
use crate::scheduler::Scheduler;

/// Longest accepted room id.
pub const MAX_ROOM_LEN: usize = 128;

type PeerCountListener = Arc<dyn Fn(usize) + Send + Sync>;
type HostListener = Arc<dyn Fn(PeerId) + Send + Sync>;
type KeyListener = Arc<dyn Fn(&Value, PeerId) + Send + Sync>;
type VisualListener = Arc<dyn Fn(&VisualEvent) + Send + Sync>;
type SyncListener = Arc<dyn Fn(&Patch) + Send + Sync>;
type DelegationListener = Arc<dyn Fn(PeerId, &Value) + Send + Sync>;
type ContentListener = Arc<dyn Fn(&ResidueRecord) + Send + Sync>;
type StatusListener = Arc<dyn Fn(&ConnectionStatus) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    peers: Vec<PeerCountListener>,
    host: Vec<HostListener>,
    keys: HashMap<String, Vec<KeyListener>>,
    visual: Vec<VisualListener>,
    sync: Vec<SyncListener>,
    delegation: Vec<DelegationListener>,
    content: Vec<ContentListener>,
    status: Vec<StatusListener>,
    no_keys: Vec<KeyListener>,
}

struct ActiveLink {
    epoch: u64,
    endpoint: String,
    tx: mpsc::UnboundedSender<WireMessage>,
    reader: AbortHandle,
    /// Race losers, in configured order.
    fallbacks: Vec<usize>,
}

/// One peer's view of the mesh.
pub struct GhostMesh {
    core: Mutex<MeshCore>,
    relays: Vec<Arc<dyn SignalingRelay>>,
    handshake_timeout: Duration,
    heartbeat_period: Duration,
    inbound_interval: Duration,
    rejoin_interval: Duration,
    room: Mutex<Option<String>>,
    link: Mutex<Option<ActiveLink>>,
    /// Bumped by every connect and disconnect; stale joins compare against it.
    generation: AtomicU64,
    link_epoch: AtomicU64,
    timers: Scheduler,
    listeners: RwLock<Listeners>,
}

impl GhostMesh {
    /// Mesh with min-id election and an in-memory content store.
    pub fn new(local: PeerId, config: &GhostConfig, relays: Vec<Arc<dyn SignalingRelay>>) -> Arc<Self> {
        Self::with_parts(
            local,
            config,
            relays,
            Box::new(MinIdElection),
            Box::new(MemoryContentStore::new()),
        )
    }

    pub fn with_parts(
        local: PeerId,
        config: &GhostConfig,
        relays: Vec<Arc<dyn SignalingRelay>>,
        election: Box<dyn ElectionPolicy>,
        store: Box<dyn ContentStore>,
    ) -> Arc<Self> {
        let core = MeshCore::new(
            local,
            CoreConfig {
                heartbeat_period: config.heartbeat_period,
                silence_periods: config.silence_periods,
                inbound_interval: config.inbound_interval,
                ephemeral_cap: config.ephemeral_cap,
            },
            election,
            store,
        );
        Arc::new(Self {
            core: Mutex::new(core),
            relays,
            handshake_timeout: config.handshake_timeout,
            heartbeat_period: config.heartbeat_period,
            inbound_interval: config.inbound_interval,
            rejoin_interval: config.rejoin_interval,
            room: Mutex::new(None),
            link: Mutex::new(None),
            generation: AtomicU64::new(0),
            link_epoch: AtomicU64::new(0),
            timers: Scheduler::new(),
            listeners: RwLock::new(Listeners::default()),
        })
    }

    /// Join `room` through the fastest relay.
    ///
    /// Only local setup problems are errors. If no relay answers, the mesh
    /// keeps running alone and retries in the background.
    pub async fn connect(self: &Arc<Self>, room: &str) -> Result<()> {
        validate_room(room)?;
        if self.relays.is_empty() {
            return Err(Error::NoRelays);
        }

        self.disconnect();
        *self.room.lock() = Some(room.to_string());
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.start_timers();
        self.join(generation).await;
        Ok(())
    }

    /// Leave the room: cancel every timer and drop the link.
    pub fn disconnect(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let cancelled = self.timers.cancel_all();
        if let Some(link) = self.link.lock().take() {
            link.reader.abort();
            info!("Left room via {}", link.endpoint);
        }
        if self.room.lock().take().is_some() {
            debug!("Cancelled {} mesh timers", cancelled);
        }
        let effects = self.core.lock().disconnect();
        self.dispatch(effects);
    }

    /// Write a replicated key. Writing the current value is a no-op.
    pub fn broadcast_event(&self, key: &str, value: Value) {
        let effects = self.core.lock().write(key, value);
        self.dispatch(effects);
    }

    /// Send a presentation event to every peer.
    ///
    /// Local visual listeners are not called for our own events.
    pub fn broadcast_visual_event(&self, kind: EventKind) -> Result<()> {
        if !kind.is_visual() {
            return Err(ghost_protocols::Error::Invalid(format!("{} is not a visual event", kind.tag())).into());
        }
        let effects = self.core.lock().emit(kind, None, now_ms())?;
        self.dispatch(effects);
        Ok(())
    }

    /// Hand `intent` to the current host's delegation handler.
    pub fn delegate_compute(&self, intent: Value) -> Result<()> {
        let effects = self.core.lock().delegate(intent, now_ms())?;
        self.dispatch(effects);
        Ok(())
    }

    /// Store content locally and announce its hash to the room.
    pub fn announce_content(&self, kind: ContentKind, payload: Value) -> Result<ContentHash> {
        let (hash, effects) = self.core.lock().announce_content(kind, payload, now_ms())?;
        self.dispatch(effects);
        Ok(hash)
    }

    pub fn lookup_content(&self, kind: ContentKind, hash: &ContentHash) -> Option<ResidueRecord> {
        self.core.lock().lookup_content(kind, hash)
    }

    /// Current value of a replicated key.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.core.lock().get(key).cloned()
    }

    /// Current value of a replicated key and the peer that wrote it.
    pub fn authored(&self, key: &str) -> Option<PatchEntry> {
        self.core.lock().entry(key).map(|entry| PatchEntry {
            value: entry.value.clone(),
            origin: entry.stamp.origin,
        })
    }

    pub fn local_id(&self) -> PeerId {
        self.core.lock().local()
    }

    pub fn host(&self) -> PeerId {
        self.core.lock().host()
    }

    pub fn is_host(&self) -> bool {
        self.core.lock().is_host()
    }

    /// A peer still announcing itself as host while another is elected.
    pub fn host_contested_by(&self) -> Option<PeerId> {
        self.core.lock().host_contested_by()
    }

    /// Other live peers, sorted.
    pub fn live_peers(&self) -> Vec<PeerId> {
        self.core.lock().live_peers()
    }

    /// Live peers including self.
    pub fn peer_count(&self) -> usize {
        self.core.lock().live_peers().len() + 1
    }

    pub fn status(&self) -> ConnectionStatus {
        self.core.lock().status().clone()
    }

    /// Endpoints to try, in order, if the current link drops.
    pub fn fallback_relays(&self) -> Vec<String> {
        self.link
            .lock()
            .as_ref()
            .map(|link| link.fallbacks.iter().map(|&i| self.relays[i].endpoint().to_string()).collect())
            .unwrap_or_default()
    }

    /// Up to `n` most recent ephemeral events, newest last.
    pub fn recent_events(&self, n: usize) -> Vec<Value> {
        self.core.lock().event_log().recent(n).cloned().collect()
    }

    /// Called with the live peer count (self included) on every change.
    pub fn on_peer_change<F>(&self, f: F)
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.listeners.write().peers.push(Arc::new(f));
    }

    pub fn on_host_change<F>(&self, f: F)
    where
        F: Fn(PeerId) + Send + Sync + 'static,
    {
        self.listeners.write().host.push(Arc::new(f));
    }

    /// Called when a flush carries a remote change to `key`.
    pub fn on_event<F>(&self, key: &str, f: F)
    where
        F: Fn(&Value, PeerId) + Send + Sync + 'static,
    {
        self.listeners.write().keys.entry(key.to_string()).or_default().push(Arc::new(f));
    }

    pub fn on_visual_event<F>(&self, f: F)
    where
        F: Fn(&VisualEvent) + Send + Sync + 'static,
    {
        self.listeners.write().visual.push(Arc::new(f));
    }

    /// Called once per inbound flush with the accumulated patch.
    pub fn on_sync<F>(&self, f: F)
    where
        F: Fn(&Patch) + Send + Sync + 'static,
    {
        self.listeners.write().sync.push(Arc::new(f));
    }

    /// Compute handler, run only while this peer is host.
    pub fn on_delegation<F>(&self, f: F)
    where
        F: Fn(PeerId, &Value) + Send + Sync + 'static,
    {
        self.listeners.write().delegation.push(Arc::new(f));
    }

    pub fn on_content<F>(&self, f: F)
    where
        F: Fn(&ResidueRecord) + Send + Sync + 'static,
    {
        self.listeners.write().content.push(Arc::new(f));
    }

    pub fn on_status<F>(&self, f: F)
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        self.listeners.write().status.push(Arc::new(f));
    }

    fn start_timers(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let _ = self.timers.every(self.heartbeat_period, move || {
            if let Some(mesh) = weak.upgrade() {
                let effects = mesh.core.lock().tick_heartbeat(now_ms());
                mesh.dispatch(effects);
            }
        });

        let weak = Arc::downgrade(self);
        let _ = self.timers.every(self.heartbeat_period, move || {
            if let Some(mesh) = weak.upgrade() {
                let effects = mesh.core.lock().tick_liveness(now());
                mesh.dispatch(effects);
            }
        });

        let weak = Arc::downgrade(self);
        let _ = self.timers.every(self.inbound_interval, move || {
            if let Some(mesh) = weak.upgrade() {
                let effects = mesh.core.lock().flush_inbound(now());
                mesh.dispatch(effects);
            }
        });
    }

    async fn join(self: &Arc<Self>, generation: u64) {
        let Some(room) = self.room.lock().clone() else {
            return;
        };
        let effects = self.core.lock().set_status(ConnectionStatus::Connecting);
        self.dispatch(effects);

        match self.race(&room).await {
            Ok((winner, link)) => {
                let fallbacks = (0..self.relays.len()).filter(|&i| i != winner).collect();
                self.attach(generation, link, fallbacks);
            }
            Err(e) => {
                warn!("No relay reachable for room {}: {}", room, e);
                self.enter_sovereignty(generation);
            }
        }
    }

    /// Race every relay; the first completed handshake wins and the losers
    /// are dropped mid-flight.
    async fn race(&self, room: &str) -> Result<(usize, RelayLink)> {
        let local = self.local_id();
        let timeout = self.handshake_timeout;
        let attempts = self.relays.iter().enumerate().map(|(i, relay)| {
            let relay = Arc::clone(relay);
            let room = room.to_string();
            Box::pin(async move {
                match tokio::time::timeout(timeout, relay.join(&room, local)).await {
                    Ok(Ok(link)) => Ok((i, link)),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(Error::Transport(format!("{} handshake timed out", relay.endpoint()))),
                }
            })
        });
        let (winner, _losers) = select_ok(attempts).await?;
        Ok(winner)
    }

    fn attach(self: &Arc<Self>, generation: u64, link: RelayLink, fallbacks: Vec<usize>) {
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!("Dropping link to {}: connection superseded", link.endpoint);
            return;
        }

        let RelayLink { endpoint, tx, mut rx } = link;
        let epoch = self.link_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let weak = Arc::downgrade(self);
        let reader = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let Some(mesh) = weak.upgrade() else {
                    return;
                };
                let effects = mesh.core.lock().receive(msg, now(), now_ms());
                mesh.dispatch(effects);
            }
            if let Some(mesh) = weak.upgrade() {
                mesh.link_dropped(generation, epoch);
            }
        });

        if let Some(old) = self.link.lock().replace(ActiveLink {
            epoch,
            endpoint: endpoint.clone(),
            tx,
            reader: reader.abort_handle(),
            fallbacks,
        }) {
            old.reader.abort();
        }
        info!("Joined room via {}", endpoint);

        let effects = self.core.lock().link_established(endpoint, now_ms());
        self.dispatch(effects);
    }

    fn link_dropped(self: &Arc<Self>, generation: u64, epoch: u64) {
        let fallbacks = {
            let mut link = self.link.lock();
            match link.as_ref() {
                Some(active) if active.epoch == epoch => {}
                _ => return,
            }
            let Some(active) = link.take() else {
                return;
            };
            warn!("Relay {} dropped the link", active.endpoint);
            active.fallbacks
        };

        let effects = self.core.lock().link_lost();
        self.dispatch(effects);

        let mesh = Arc::clone(self);
        tokio::spawn(async move { mesh.failover(generation, fallbacks).await });
    }

    /// Try the race losers in order, then fall back to periodic rejoin.
    async fn failover(self: Arc<Self>, generation: u64, fallbacks: Vec<usize>) {
        let Some(room) = self.room.lock().clone() else {
            return;
        };
        let local = self.local_id();
        for (pos, &i) in fallbacks.iter().enumerate() {
            let relay = Arc::clone(&self.relays[i]);
            match tokio::time::timeout(self.handshake_timeout, relay.join(&room, local)).await {
                Ok(Ok(link)) => {
                    let rest = fallbacks.iter().copied().filter(|&j| j != i).collect();
                    info!("Failed over to relay {} ({} of {})", relay.endpoint(), pos + 1, fallbacks.len());
                    self.attach(generation, link, rest);
                    return;
                }
                Ok(Err(e)) => debug!("Fallback relay {} refused: {}", relay.endpoint(), e),
                Err(_) => debug!("Fallback relay {} timed out", relay.endpoint()),
            }
        }
        self.enter_sovereignty(generation);
    }

    fn enter_sovereignty(self: &Arc<Self>, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        let effects = self.core.lock().link_lost();
        self.dispatch(effects);
        info!("Running in local sovereignty, rejoin in {:?}", self.rejoin_interval);

        let weak = Arc::downgrade(self);
        let _ = self.timers.after(self.rejoin_interval, move || {
            if let Some(mesh) = weak.upgrade() {
                tokio::spawn(async move { mesh.rejoin(generation).await });
            }
        });
    }

    async fn rejoin(self: Arc<Self>, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation || self.link.lock().is_some() {
            return;
        }
        debug!("Retrying join");
        self.join(generation).await;
    }

    fn send(&self, msg: WireMessage) {
        if let Some(link) = self.link.lock().as_ref() {
            if link.tx.send(msg).is_err() {
                debug!("Link to {} closed, frame dropped", link.endpoint);
            }
        }
    }

    /// Copy of one listener list, taken so no lock is held while calling out.
    fn listeners<T: Clone>(&self, pick: impl FnOnce(&Listeners) -> &Vec<T>) -> Vec<T> {
        pick(&self.listeners.read()).clone()
    }

    fn dispatch(&self, effects: Vec<MeshEffect>) {
        for effect in effects {
            match effect {
                MeshEffect::Send(msg) => self.send(msg),
                MeshEffect::PeersChanged(peers) => {
                    let total = peers.len() + 1;
                    for f in self.listeners(|l| &l.peers) {
                        f(total);
                    }
                }
                MeshEffect::HostChanged(host) => {
                    for f in self.listeners(|l| &l.host) {
                        f(host);
                    }
                }
                MeshEffect::Sync(patch) => {
                    for f in self.listeners(|l| &l.sync) {
                        f(&patch);
                    }
                    for (key, entry) in &patch {
                        let keyed = self.listeners(|l| l.keys.get(key).unwrap_or(&l.no_keys));
                        for f in keyed {
                            f(&entry.value, entry.origin);
                        }
                    }
                }
                MeshEffect::Visual(event) => {
                    for f in self.listeners(|l| &l.visual) {
                        f(&event);
                    }
                }
                MeshEffect::Delegation { from, intent } => {
                    let handlers = self.listeners(|l| &l.delegation);
                    if handlers.is_empty() {
                        warn!("Delegation from {} with no compute handler", from);
                    }
                    for f in handlers {
                        f(from, &intent);
                    }
                }
                MeshEffect::ContentStored(record) => {
                    for f in self.listeners(|l| &l.content) {
                        f(&record);
                    }
                }
                MeshEffect::Status(status) => {
                    for f in self.listeners(|l| &l.status) {
                        f(&status);
                    }
                }
            }
        }
    }
}

impl Drop for GhostMesh {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut().take() {
            link.reader.abort();
        }
    }
}

impl std::fmt::Debug for GhostMesh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GhostMesh")
            .field("core", &*self.core.lock())
            .field("room", &*self.room.lock())
            .field("relays", &self.relays.len())
            .finish_non_exhaustive()
    }
}

/// Room ids are short tokens of ASCII alphanumerics, `-`, `_` and `.`.
fn validate_room(room: &str) -> Result<()> {
    let ok = !room.is_empty()
        && room.len() <= MAX_ROOM_LEN
        && room.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidRoom(room.to_string()))
    }
}

pub(crate) fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
