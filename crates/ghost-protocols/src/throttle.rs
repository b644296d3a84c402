//! Broadcast throttling.
//!
//! # Outbound
//!
//! ```text
//! context change ──▶ OutboundThrottle::offer ──▶ diff ──▶ map.set(..)
//!                     │ inside 50ms window → pending (flushed by next tick)
//!                     │ value == last sent  → skip
//!                     │ global key, !host   → skip
//!                     └ wholly-remote world → skip
//! ```
//!
//! # Inbound
//!
//! Remote changes accumulate in an [`InboundBuffer`]; one flush per window
//! yields a single [`Patch`] so listeners fire once per window, not once per
//! key.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use ghost_replica::PeerId;
use serde_json::Value;

/// Minimum spacing between outbound diffs.
pub const OUTBOUND_MIN_INTERVAL: Duration = Duration::from_millis(50);

/// Inbound flush spacing (~30 Hz).
pub const INBOUND_FLUSH_INTERVAL: Duration = Duration::from_millis(33);

/// Replicated facets of the shared context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ContextKey {
    /// Current physics parameters.
    Physics,
    /// Current world snapshot.
    World,
    /// Active metaphor.
    Metaphor,
    /// Swarm telemetry.
    Telemetry,
    /// Transient audio events.
    Audio,
}

impl ContextKey {
    /// All replicated keys.
    pub const ALL: [ContextKey; 5] = [
        ContextKey::Physics,
        ContextKey::World,
        ContextKey::Metaphor,
        ContextKey::Telemetry,
        ContextKey::Audio,
    ];

    /// Parse a map key. Unknown keys return `None` and are ignored.
    pub fn parse(key: &str) -> Option<Self> {
        match key {
            "physics" => Some(ContextKey::Physics),
            "world" => Some(ContextKey::World),
            "metaphor" => Some(ContextKey::Metaphor),
            "telemetry" => Some(ContextKey::Telemetry),
            "audio" => Some(ContextKey::Audio),
            _ => None,
        }
    }

    /// Map key.
    pub const fn as_str(&self) -> &'static str {
        match self {
            ContextKey::Physics => "physics",
            ContextKey::World => "world",
            ContextKey::Metaphor => "metaphor",
            ContextKey::Telemetry => "telemetry",
            ContextKey::Audio => "audio",
        }
    }

    /// Keys only the HOST may write.
    pub const fn is_global_environment(&self) -> bool {
        matches!(self, ContextKey::Physics | ContextKey::Metaphor)
    }
}

impl std::fmt::Display for ContextKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Predicate deciding that a value must not be re-broadcast.
pub type Suppressor = Box<dyn Fn(ContextKey, &Value) -> bool + Send + Sync>;

/// Rate limiter and diff filter for local context changes.
pub struct OutboundThrottle {
    min_interval: Duration,
    last_send: Option<Instant>,
    last_sent: HashMap<ContextKey, Value>,
    pending: bool,
    suppress: Suppressor,
}

impl OutboundThrottle {
    /// Throttle with no suppression rule.
    pub fn new(min_interval: Duration) -> Self {
        Self::with_suppressor(min_interval, Box::new(|_, _| false))
    }

    /// Throttle that skips values matching `suppress`.
    pub fn with_suppressor(min_interval: Duration, suppress: Suppressor) -> Self {
        Self {
            min_interval,
            last_send: None,
            last_sent: HashMap::new(),
            pending: false,
            suppress,
        }
    }

    /// Offer the current context. Returns the entries to write, if any.
    ///
    /// Inside the spacing window nothing is returned and the throttle is
    /// marked pending; call again on the next tick.
    pub fn offer(&mut self, facets: &BTreeMap<String, Value>, now: Instant, is_host: bool) -> Option<Vec<(ContextKey, Value)>> {
        if let Some(last) = self.last_send {
            if now.saturating_duration_since(last) < self.min_interval {
                self.pending = true;
                return None;
            }
        }
        self.pending = false;

        let mut diff = Vec::new();
        for (raw_key, value) in facets {
            let Some(key) = ContextKey::parse(raw_key) else {
                continue;
            };
            if key.is_global_environment() && !is_host {
                continue;
            }
            if self.last_sent.get(&key) == Some(value) {
                continue;
            }
            if (self.suppress)(key, value) {
                continue;
            }
            diff.push((key, value.clone()));
        }

        if diff.is_empty() {
            return None;
        }
        for (key, value) in &diff {
            self.last_sent.insert(*key, value.clone());
        }
        self.last_send = Some(now);
        Some(diff)
    }

    /// Check if a change arrived inside the window and still needs sending.
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Record a value that arrived from the mesh so it is not echoed back.
    pub fn note_remote(&mut self, key: ContextKey, value: Value) {
        self.last_sent.insert(key, value);
    }

    /// Forget what was sent for host-only keys so the next offer rewrites them.
    pub fn forget_global(&mut self) {
        self.last_sent.retain(|key, _| !key.is_global_environment());
    }

    /// Forget send history (after a reconnect everything is re-offered).
    pub fn reset(&mut self) {
        self.last_send = None;
        self.last_sent.clear();
        self.pending = false;
    }
}

impl std::fmt::Debug for OutboundThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundThrottle")
            .field("min_interval", &self.min_interval)
            .field("last_send", &self.last_send)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

/// One key of an inbound patch.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchEntry {
    /// New value.
    pub value: Value,
    /// Peer whose write produced it.
    pub origin: PeerId,
}

/// Accumulated remote changes applied in one flush.
pub type Patch = BTreeMap<String, PatchEntry>;

/// Buffer for remote changes awaiting the next flush.
#[derive(Debug)]
pub struct InboundBuffer {
    interval: Duration,
    last_flush: Option<Instant>,
    pending: Patch,
}

impl InboundBuffer {
    /// Create a buffer flushing at most once per `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_flush: None,
            pending: Patch::new(),
        }
    }

    /// Buffer a remote change. A later change to the same key replaces it.
    pub fn push(&mut self, key: impl Into<String>, value: Value, origin: PeerId) {
        self.pending.insert(key.into(), PatchEntry { value, origin });
    }

    /// Number of buffered keys.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Check if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Take the accumulated patch if the window has elapsed.
    pub fn flush(&mut self, now: Instant) -> Option<Patch> {
        if self.pending.is_empty() {
            return None;
        }
        if let Some(last) = self.last_flush {
            if now.saturating_duration_since(last) < self.interval {
                return None;
            }
        }
        self.last_flush = Some(now);
        Some(std::mem::take(&mut self.pending))
    }

    /// Drop everything buffered.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn facets(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn second_offer_inside_window_is_pending() {
        let mut throttle = OutboundThrottle::new(OUTBOUND_MIN_INTERVAL);
        let t0 = Instant::now();

        let sent = throttle.offer(&facets(&[("telemetry", json!(1))]), t0, false).unwrap();
        assert_eq!(sent, vec![(ContextKey::Telemetry, json!(1))]);

        let next = facets(&[("telemetry", json!(2))]);
        assert!(throttle.offer(&next, t0 + Duration::from_millis(10), false).is_none());
        assert!(throttle.is_pending());

        let sent = throttle.offer(&next, t0 + Duration::from_millis(50), false).unwrap();
        assert_eq!(sent, vec![(ContextKey::Telemetry, json!(2))]);
        assert!(!throttle.is_pending());
    }

    #[test]
    fn unchanged_values_are_skipped() {
        let mut throttle = OutboundThrottle::new(OUTBOUND_MIN_INTERVAL);
        let t0 = Instant::now();
        let ctx = facets(&[("telemetry", json!({"fps": 60})), ("audio", json!([]))]);

        assert_eq!(throttle.offer(&ctx, t0, false).unwrap().len(), 2);
        assert!(throttle.offer(&ctx, t0 + Duration::from_secs(1), false).is_none());

        let ctx = facets(&[("telemetry", json!({"fps": 59})), ("audio", json!([]))]);
        let sent = throttle.offer(&ctx, t0 + Duration::from_secs(2), false).unwrap();
        assert_eq!(sent, vec![(ContextKey::Telemetry, json!({"fps": 59}))]);
    }

    #[test]
    fn only_host_sends_global_keys() {
        let ctx = facets(&[("physics", json!({"gravity": -3.0})), ("world", json!({}))]);
        let t0 = Instant::now();

        let mut worker = OutboundThrottle::new(OUTBOUND_MIN_INTERVAL);
        let sent = worker.offer(&ctx, t0, false).unwrap();
        assert_eq!(sent, vec![(ContextKey::World, json!({}))]);

        let mut host = OutboundThrottle::new(OUTBOUND_MIN_INTERVAL);
        let sent = host.offer(&ctx, t0, true).unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, ContextKey::Physics);
    }

    #[test]
    fn unknown_keys_are_not_replicated() {
        let mut throttle = OutboundThrottle::new(OUTBOUND_MIN_INTERVAL);
        assert!(throttle
            .offer(&facets(&[("ui_panel", json!("open"))]), Instant::now(), true)
            .is_none());
    }

    #[test]
    fn suppressor_blocks_values() {
        let mut throttle = OutboundThrottle::with_suppressor(
            OUTBOUND_MIN_INTERVAL,
            Box::new(|key, value| key == ContextKey::World && value["remote"] == json!(true)),
        );
        let ctx = facets(&[("world", json!({"remote": true}))]);
        assert!(throttle.offer(&ctx, Instant::now(), true).is_none());
    }

    #[test]
    fn remote_values_are_not_echoed() {
        let mut throttle = OutboundThrottle::new(OUTBOUND_MIN_INTERVAL);
        throttle.note_remote(ContextKey::Telemetry, json!({"peers": 3}));
        assert!(throttle
            .offer(&facets(&[("telemetry", json!({"peers": 3}))]), Instant::now(), false)
            .is_none());
    }

    #[test]
    fn forgotten_globals_are_offered_again() {
        let mut throttle = OutboundThrottle::new(OUTBOUND_MIN_INTERVAL);
        let t0 = Instant::now();
        let ctx = facets(&[("physics", json!({"gravity": -3.7})), ("audio", json!("hum"))]);
        assert_eq!(throttle.offer(&ctx, t0, true).unwrap().len(), 2);

        throttle.forget_global();
        let later = t0 + OUTBOUND_MIN_INTERVAL;
        let sent = throttle.offer(&ctx, later, true).unwrap();
        assert_eq!(sent, vec![(ContextKey::Physics, json!({"gravity": -3.7}))]);
    }

    #[test]
    fn inbound_flush_coalesces_keys() {
        let mut buffer = InboundBuffer::new(INBOUND_FLUSH_INTERVAL);
        let t0 = Instant::now();
        buffer.push("world", json!(1), PeerId(2));
        buffer.push("telemetry", json!(1), PeerId(2));
        buffer.push("world", json!(2), PeerId(3));

        let patch = buffer.flush(t0).unwrap();
        assert_eq!(patch.len(), 2);
        assert_eq!(patch["world"], PatchEntry { value: json!(2), origin: PeerId(3) });
        assert!(buffer.is_empty());
        assert!(buffer.flush(t0 + Duration::from_secs(1)).is_none());
    }

    #[test]
    fn inbound_flush_respects_interval() {
        let mut buffer = InboundBuffer::new(INBOUND_FLUSH_INTERVAL);
        let t0 = Instant::now();
        buffer.push("audio", json!("ping"), PeerId(2));
        assert!(buffer.flush(t0).is_some());

        buffer.push("audio", json!("pong"), PeerId(2));
        assert!(buffer.flush(t0 + Duration::from_millis(5)).is_none());
        assert_eq!(buffer.len(), 1);
        assert!(buffer.flush(t0 + INBOUND_FLUSH_INTERVAL).is_some());
    }

    #[test]
    fn context_key_roundtrip() {
        for key in ContextKey::ALL {
            assert_eq!(ContextKey::parse(key.as_str()), Some(key));
        }
        assert!(ContextKey::Metaphor.is_global_environment());
        assert!(!ContextKey::Telemetry.is_global_environment());
    }

    proptest! {
        #[test]
        fn non_host_never_sends_global_keys(
            writes in proptest::collection::vec((0usize..5, 0i64..4), 1..40),
        ) {
            let mut throttle = OutboundThrottle::new(OUTBOUND_MIN_INTERVAL);
            let t0 = Instant::now();
            let mut board = BTreeMap::new();
            for (step, (key, value)) in writes.into_iter().enumerate() {
                board.insert(ContextKey::ALL[key].as_str().to_string(), json!(value));
                let now = t0 + OUTBOUND_MIN_INTERVAL * step as u32;
                for (sent, _) in throttle.offer(&board, now, false).unwrap_or_default() {
                    prop_assert!(!sent.is_global_environment());
                }
            }
        }
    }
}
