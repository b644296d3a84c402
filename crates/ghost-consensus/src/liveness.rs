//! Heartbeat liveness tracking.
//!
//! Only heartbeat receipt refreshes an entry. Other traffic from a peer (map
//! updates, residue exchange) says nothing about whether it still runs its
//! heartbeat timer, so it must not keep the peer alive.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use ghost_replica::PeerId;
use tracing::debug;

/// Heartbeat period.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(1);

/// Silent periods after which a peer is purged.
pub const SILENCE_PERIODS: u32 = 5;

/// Outcome of recording a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heartbeat {
    /// First heartbeat from this peer (or first since it was purged).
    Joined,
    /// Refresh of an already live peer.
    Refreshed,
    /// Ignored (our own id).
    Ignored,
}

/// peerId → last heartbeat instant.
#[derive(Debug, Clone)]
pub struct LivenessTable {
    local: PeerId,
    timeout: Duration,
    last_seen: HashMap<PeerId, Instant>,
}

impl LivenessTable {
    /// Create a table that purges peers silent for longer than
    /// `period × silence_periods`.
    pub fn new(local: PeerId, period: Duration, silence_periods: u32) -> Self {
        Self {
            local,
            timeout: period * silence_periods,
            last_seen: HashMap::new(),
        }
    }

    /// Table with the default 1 s × 5 timeout.
    pub fn with_defaults(local: PeerId) -> Self {
        Self::new(local, HEARTBEAT_PERIOD, SILENCE_PERIODS)
    }

    /// Purge timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Record a heartbeat from `peer`.
    pub fn record_heartbeat(&mut self, peer: PeerId, now: Instant) -> Heartbeat {
        if peer == self.local {
            return Heartbeat::Ignored;
        }
        match self.last_seen.insert(peer, now) {
            None => {
                debug!("Peer {} is live", peer);
                Heartbeat::Joined
            }
            Some(_) => Heartbeat::Refreshed,
        }
    }

    /// Remove peers silent for longer than the timeout. Returns them sorted.
    pub fn purge(&mut self, now: Instant) -> Vec<PeerId> {
        let timeout = self.timeout;
        let mut purged: Vec<PeerId> = self
            .last_seen
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) > timeout)
            .map(|(peer, _)| *peer)
            .collect();

        for peer in &purged {
            self.last_seen.remove(peer);
            debug!("Peer {} timed out", peer);
        }
        purged.sort();
        purged
    }

    /// Live peer ids (excluding self), sorted.
    pub fn live_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.last_seen.keys().copied().collect();
        ids.sort();
        ids
    }

    /// When a peer last sent a heartbeat.
    pub fn last_seen(&self, peer: &PeerId) -> Option<Instant> {
        self.last_seen.get(peer).copied()
    }

    /// Check if a peer is currently tracked.
    pub fn is_live(&self, peer: &PeerId) -> bool {
        self.last_seen.contains_key(peer)
    }

    /// Number of live peers (excluding self).
    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    /// Check if no peers are live.
    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }

    /// Forget every peer (link lost).
    pub fn clear(&mut self) {
        self.last_seen.clear();
    }
}
