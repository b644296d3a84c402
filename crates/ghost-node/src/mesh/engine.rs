//! Synchronous mesh state machine.
//!
//! [`MeshCore`] owns the replica, the ephemeral log, the liveness table and
//! the content exchange. It never performs I/O and never reads a clock:
//! every entry point takes `now` and returns the [`MeshEffect`]s the shell
//! must carry out.

use std::time::{Duration, Instant};

use ghost_consensus::{ElectionPolicy, Heartbeat, LivenessTable};
use ghost_protocols::{
    decode_event, ContentExchange, EventEnvelope, EventKind, ExchangeOutcome, InboundBuffer, Inbound, Patch,
    VisualEvent, WireMessage,
};
use ghost_replica::{
    content_hash, ContentHash, ContentKind, ContentStore, EphemeralLog, MapEntry, PeerId, ReplicatedMap,
    ReplicatedStore, ResidueRecord,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Link state as seen by this peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Not joined to any room.
    Disconnected,
    /// Racing relay handshakes.
    Connecting,
    /// Linked through `relay`.
    Connected { relay: String },
    /// No relay reachable; running alone and retrying.
    LocalSovereignty,
}

/// Work the shell must perform after a core call.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEffect {
    /// Put a frame on the link (dropped if there is none).
    Send(WireMessage),
    /// Live peer set changed; carries the other live peers.
    PeersChanged(Vec<PeerId>),
    HostChanged(PeerId),
    /// One inbound flush.
    Sync(Patch),
    Visual(VisualEvent),
    /// A peer asked this (host) peer to compute on its behalf.
    Delegation { from: PeerId, intent: Value },
    /// Verified content arrived from a peer.
    ContentStored(ResidueRecord),
    Status(ConnectionStatus),
}

/// Timing and capacity knobs for the core.
#[derive(Debug, Clone, Copy)]
pub struct CoreConfig {
    pub heartbeat_period: Duration,
    pub silence_periods: u32,
    pub inbound_interval: Duration,
    pub ephemeral_cap: usize,
}

/// The mesh protocol for one peer.
pub struct MeshCore {
    local: PeerId,
    map: ReplicatedMap,
    log: EphemeralLog<Value>,
    liveness: LivenessTable,
    election: Box<dyn ElectionPolicy>,
    host: PeerId,
    inbound: InboundBuffer,
    exchange: ContentExchange,
    status: ConnectionStatus,
    /// Last peer whose heartbeat claimed host while we elected another.
    contested_by: Option<PeerId>,
}

impl MeshCore {
    pub fn new(
        local: PeerId,
        config: CoreConfig,
        election: Box<dyn ElectionPolicy>,
        store: Box<dyn ContentStore>,
    ) -> Self {
        Self {
            local,
            map: ReplicatedMap::new(local),
            log: EphemeralLog::new(config.ephemeral_cap),
            liveness: LivenessTable::new(local, config.heartbeat_period, config.silence_periods),
            election,
            host: local,
            inbound: InboundBuffer::new(config.inbound_interval),
            exchange: ContentExchange::new(store),
            status: ConnectionStatus::Disconnected,
            contested_by: None,
        }
    }

    pub fn local(&self) -> PeerId {
        self.local
    }

    pub fn host(&self) -> PeerId {
        self.host
    }

    pub fn is_host(&self) -> bool {
        self.host == self.local
    }

    /// Other live peers, sorted.
    pub fn live_peers(&self) -> Vec<PeerId> {
        self.liveness.live_ids()
    }

    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    /// A peer that still announces itself as host although this peer
    /// elected someone else. Clears once the claim stops or the peer leaves.
    pub fn host_contested_by(&self) -> Option<PeerId> {
        self.contested_by
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.map.get(key)
    }

    /// Current entry for `key`, with the stamp of the write that produced it.
    pub fn entry(&self, key: &str) -> Option<&MapEntry> {
        self.map.entry(key)
    }

    pub fn event_log(&self) -> &EphemeralLog<Value> {
        &self.log
    }

    pub fn lookup_content(&self, kind: ContentKind, hash: &ContentHash) -> Option<ResidueRecord> {
        self.exchange.lookup(kind, hash)
    }

    /// Write a replicated key. Equal values are a no-op.
    pub fn write(&mut self, key: &str, value: Value) -> Vec<MeshEffect> {
        let mut effects = Vec::new();
        if let Some(entry) = self.map.set(key, value) {
            effects.push(MeshEffect::Send(WireMessage::Update {
                origin: self.local,
                entries: vec![entry],
            }));
        }
        self.drain_changes();
        effects
    }

    /// Emit an ephemeral event, optionally addressed to one peer.
    pub fn emit(&mut self, kind: EventKind, target: Option<PeerId>, now_ms: u64) -> Result<Vec<MeshEffect>> {
        kind.validate()?;
        let mut envelope = EventEnvelope::new(kind, self.local, now_ms);
        envelope.target = target;
        let value = envelope.to_value()?;
        self.append_log(value.clone());
        Ok(vec![MeshEffect::Send(WireMessage::Event { event: value })])
    }

    /// Store local content and announce it.
    pub fn announce_content(&mut self, kind: ContentKind, payload: Value, now_ms: u64) -> Result<(ContentHash, Vec<MeshEffect>)> {
        let hash = content_hash(&payload).map_err(ghost_protocols::Error::from)?;
        let event = self.exchange.announce(kind, payload)?;
        Ok((hash, self.emit(event, None, now_ms)?))
    }

    /// Ask the current host to compute `intent`.
    ///
    /// When this peer is host the request is handed straight back as a
    /// [`MeshEffect::Delegation`].
    pub fn delegate(&mut self, intent: Value, now_ms: u64) -> Result<Vec<MeshEffect>> {
        if self.is_host() {
            return Ok(vec![MeshEffect::Delegation {
                from: self.local,
                intent,
            }]);
        }
        let host = self.host;
        debug!("Delegating compute to host {}", host);
        self.emit(EventKind::ComputeDelegation { intent }, Some(host), now_ms)
    }

    /// Handle one frame from the link.
    pub fn receive(&mut self, msg: WireMessage, now: Instant, now_ms: u64) -> Vec<MeshEffect> {
        match msg {
            WireMessage::Update { origin, entries } => {
                if origin != self.local {
                    let applied = self.map.transact(origin, entries);
                    if applied > 0 {
                        debug!("Applied {} entries from {}", applied, origin);
                    }
                    self.drain_changes();
                }
                Vec::new()
            }
            WireMessage::SyncRequest { origin } => {
                if origin == self.local || self.map.is_empty() {
                    return Vec::new();
                }
                debug!("Answering sync request from {}", origin);
                vec![MeshEffect::Send(WireMessage::Update {
                    origin: self.local,
                    entries: self.map.snapshot(),
                })]
            }
            WireMessage::Event { event } => self.receive_event(event, now, now_ms),
        }
    }

    fn receive_event(&mut self, raw: Value, now: Instant, now_ms: u64) -> Vec<MeshEffect> {
        let inbound = match decode_event(raw.clone()) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!("Dropping malformed event: {}", e);
                return Vec::new();
            }
        };

        let envelope = match inbound {
            Inbound::Untyped(untyped) => {
                if untyped.origin == Some(self.local) || !untyped.is_for(self.local) {
                    return Vec::new();
                }
                debug!("Republishing untyped event {:?}", untyped.event_type);
                self.append_log(raw);
                return vec![MeshEffect::Visual(VisualEvent::Untyped(untyped))];
            }
            Inbound::Event(envelope) => envelope,
        };

        if envelope.origin == self.local {
            return Vec::new();
        }
        self.append_log(raw);
        if !envelope.is_for(self.local) {
            return Vec::new();
        }

        let origin = envelope.origin;
        if envelope.kind.is_visual() {
            return vec![MeshEffect::Visual(VisualEvent::Typed(envelope))];
        }
        if envelope.kind.content_message().is_some() {
            return match self.exchange.handle(origin, &envelope.kind) {
                ExchangeOutcome::Reply { event, target } => self.emit(event, Some(target), now_ms).unwrap_or_else(|e| {
                    warn!("Failed to build exchange reply: {}", e);
                    Vec::new()
                }),
                ExchangeOutcome::Stored(record) => vec![MeshEffect::ContentStored(record)],
                ExchangeOutcome::Ignored | ExchangeOutcome::Rejected => Vec::new(),
            };
        }

        match envelope.kind {
            EventKind::Heartbeat { peer_id, is_host } => {
                if peer_id != origin {
                    warn!("Heartbeat for {} sent by {}, ignoring", peer_id, origin);
                    return Vec::new();
                }
                let mut effects = Vec::new();
                if self.liveness.record_heartbeat(origin, now) == Heartbeat::Joined {
                    info!("Peer {} is live", origin);
                    effects.push(MeshEffect::PeersChanged(self.liveness.live_ids()));
                    self.recompute_host(&mut effects);
                    // Greet the newcomer so it does not wait a full period to see us.
                    effects.extend(self.tick_heartbeat(now_ms));
                }
                self.note_host_claim(origin, is_host);
                effects
            }
            EventKind::ComputeDelegation { intent } => {
                if self.is_host() {
                    vec![MeshEffect::Delegation { from: origin, intent }]
                } else {
                    debug!("Ignoring delegation from {}: not host", origin);
                    Vec::new()
                }
            }
            _ => Vec::new(),
        }
    }

    /// Heartbeat timer.
    pub fn tick_heartbeat(&mut self, now_ms: u64) -> Vec<MeshEffect> {
        let beat = EventKind::Heartbeat {
            peer_id: self.local,
            is_host: self.is_host(),
        };
        self.emit(beat, None, now_ms).unwrap_or_else(|e| {
            warn!("Failed to build heartbeat: {}", e);
            Vec::new()
        })
    }

    /// Liveness timer: purge silent peers.
    pub fn tick_liveness(&mut self, now: Instant) -> Vec<MeshEffect> {
        let purged = self.liveness.purge(now);
        let mut effects = Vec::new();
        if !purged.is_empty() {
            info!("Purged silent peers {:?}", purged);
            if self.contested_by.is_some_and(|p| purged.contains(&p)) {
                self.contested_by = None;
            }
            effects.push(MeshEffect::PeersChanged(self.liveness.live_ids()));
            self.recompute_host(&mut effects);
        }
        effects
    }

    /// Inbound timer: release buffered remote changes.
    pub fn flush_inbound(&mut self, now: Instant) -> Vec<MeshEffect> {
        match self.inbound.flush(now) {
            Some(patch) => vec![MeshEffect::Sync(patch)],
            None => Vec::new(),
        }
    }

    /// Status change without a link event (connecting, retrying).
    pub fn set_status(&mut self, status: ConnectionStatus) -> Vec<MeshEffect> {
        if self.status == status {
            return Vec::new();
        }
        self.status = status.clone();
        vec![MeshEffect::Status(status)]
    }

    /// A relay link is up.
    pub fn link_established(&mut self, relay: String, now_ms: u64) -> Vec<MeshEffect> {
        let mut effects = self.set_status(ConnectionStatus::Connected { relay });
        effects.push(MeshEffect::Send(WireMessage::SyncRequest { origin: self.local }));
        if !self.map.is_empty() {
            effects.push(MeshEffect::Send(WireMessage::Update {
                origin: self.local,
                entries: self.map.snapshot(),
            }));
        }
        effects.extend(self.tick_heartbeat(now_ms));
        effects
    }

    /// The relay link dropped.
    pub fn link_lost(&mut self) -> Vec<MeshEffect> {
        self.forget_peers(ConnectionStatus::LocalSovereignty)
    }

    /// Explicit teardown.
    pub fn disconnect(&mut self) -> Vec<MeshEffect> {
        self.inbound.clear();
        self.forget_peers(ConnectionStatus::Disconnected)
    }

    fn forget_peers(&mut self, status: ConnectionStatus) -> Vec<MeshEffect> {
        let mut effects = self.set_status(status);
        self.contested_by = None;
        if !self.liveness.is_empty() {
            self.liveness.clear();
            effects.push(MeshEffect::PeersChanged(Vec::new()));
        }
        self.recompute_host(&mut effects);
        effects
    }

    fn note_host_claim(&mut self, origin: PeerId, is_host: bool) {
        if is_host && origin != self.host {
            if self.contested_by != Some(origin) {
                if self.is_host() {
                    warn!("Peer {} also claims host; both sides believe they are host", origin);
                } else {
                    warn!("Peer {} claims host but {} is elected", origin, self.host);
                }
            }
            self.contested_by = Some(origin);
        } else if self.contested_by == Some(origin) {
            debug!("Peer {} no longer contests host", origin);
            self.contested_by = None;
        }
    }

    fn recompute_host(&mut self, effects: &mut Vec<MeshEffect>) {
        let host = self.election.elect(self.local, &self.liveness.live_ids());
        if host != self.host {
            info!("Host is now {}{}", host, if host == self.local { " (self)" } else { "" });
            self.host = host;
            effects.push(MeshEffect::HostChanged(host));
        }
    }

    fn drain_changes(&mut self) {
        for change in self.map.observe() {
            // Attribute to the author, not to the peer that relayed it.
            if change.origin.is_remote() {
                let author = change.entry.stamp.origin;
                self.inbound.push(change.entry.key, change.entry.value, author);
            }
        }
    }

    fn append_log(&mut self, event: Value) {
        let pruned = self.log.push(event);
        if pruned > 0 {
            debug!("Pruned {} ephemeral events", pruned);
        }
    }
}

impl std::fmt::Debug for MeshCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshCore")
            .field("local", &self.local)
            .field("host", &self.host)
            .field("status", &self.status)
            .field("live", &self.liveness.len())
            .finish_non_exhaustive()
    }
}
