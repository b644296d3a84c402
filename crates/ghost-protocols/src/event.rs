//! Ephemeral mesh events.
//!
//! Every transient signal is one variant of [`EventKind`]. Raw JSON from the
//! wire is decoded once at the transport boundary by [`decode_event`]:
//!
//! ```text
//! known tag, valid fields   → Inbound::Event(envelope)
//! known tag, bad fields     → Err(Malformed | Invalid)   (logged, dropped)
//! unknown tag               → Inbound::Untyped(..)       (republished as visual)
//! no tag                    → Err(MissingTag)
//! ```

use ghost_replica::{ContentHash, ContentKind, PeerId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Longest accepted thought-stream fragment, in bytes.
pub const MAX_THOUGHT_LEN: usize = 4096;

/// Payload of an ephemeral event, one variant per type tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Liveness beacon.
    Heartbeat { peer_id: PeerId, is_host: bool },
    /// "I hold residue with this hash."
    ResidueHashAnnounce { hash: ContentHash },
    /// "Send me the residue with this hash."
    ResidueRequest { hash: ContentHash },
    /// Residue payload in answer to a request.
    ResidueFulfill { hash: ContentHash, payload: Value },
    /// A peer manifested a new reality (world branch).
    RealityAnnounce {
        reality_id: String,
        label: String,
        #[serde(default)]
        summary: Value,
    },
    /// Speculative simulation path shared for preview.
    SpeculativePathSync { path_id: String, steps: Vec<Value> },
    /// Low-power peer asks the host to compute on its behalf.
    ComputeDelegation { intent: Value },
    /// "I hold a neural map with this hash."
    NeuralMapHashAnnounce { hash: ContentHash },
    /// "Send me the neural map with this hash."
    NeuralMapRequest { hash: ContentHash },
    /// Neural map payload in answer to a request.
    NeuralMapFulfill { hash: ContentHash, payload: Value },
    /// Shared destruction effect.
    CollectiveShatter { epicenter: [f64; 3], intensity: f64 },
    /// Streamed narration fragment.
    ThoughtStream { text: String },
}

/// Content exchange step carried by an event.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentMessage {
    /// Holder advertises a hash.
    Announce(ContentHash),
    /// Peer asks for a hash.
    Request(ContentHash),
    /// Holder sends the payload.
    Fulfill(ContentHash, Value),
}

impl EventKind {
    /// Every known type tag.
    pub const TAGS: [&'static str; 12] = [
        "heartbeat",
        "residue_hash_announce",
        "residue_request",
        "residue_fulfill",
        "reality_announce",
        "speculative_path_sync",
        "compute_delegation",
        "neural_map_hash_announce",
        "neural_map_request",
        "neural_map_fulfill",
        "collective_shatter",
        "thought_stream",
    ];

    /// The wire tag of this variant.
    pub fn tag(&self) -> &'static str {
        match self {
            EventKind::Heartbeat { .. } => "heartbeat",
            EventKind::ResidueHashAnnounce { .. } => "residue_hash_announce",
            EventKind::ResidueRequest { .. } => "residue_request",
            EventKind::ResidueFulfill { .. } => "residue_fulfill",
            EventKind::RealityAnnounce { .. } => "reality_announce",
            EventKind::SpeculativePathSync { .. } => "speculative_path_sync",
            EventKind::ComputeDelegation { .. } => "compute_delegation",
            EventKind::NeuralMapHashAnnounce { .. } => "neural_map_hash_announce",
            EventKind::NeuralMapRequest { .. } => "neural_map_request",
            EventKind::NeuralMapFulfill { .. } => "neural_map_fulfill",
            EventKind::CollectiveShatter { .. } => "collective_shatter",
            EventKind::ThoughtStream { .. } => "thought_stream",
        }
    }

    /// Check if a raw tag is one of ours.
    pub fn is_known_tag(tag: &str) -> bool {
        Self::TAGS.contains(&tag)
    }

    /// Events that only drive presentation (delivered to visual listeners).
    pub fn is_visual(&self) -> bool {
        matches!(
            self,
            EventKind::RealityAnnounce { .. }
                | EventKind::SpeculativePathSync { .. }
                | EventKind::CollectiveShatter { .. }
                | EventKind::ThoughtStream { .. }
        )
    }

    /// Build the announce event for a namespace.
    pub fn announce(kind: ContentKind, hash: ContentHash) -> Self {
        match kind {
            ContentKind::Residue => EventKind::ResidueHashAnnounce { hash },
            ContentKind::NeuralMap => EventKind::NeuralMapHashAnnounce { hash },
        }
    }

    /// Build the request event for a namespace.
    pub fn request(kind: ContentKind, hash: ContentHash) -> Self {
        match kind {
            ContentKind::Residue => EventKind::ResidueRequest { hash },
            ContentKind::NeuralMap => EventKind::NeuralMapRequest { hash },
        }
    }

    /// Build the fulfill event for a namespace.
    pub fn fulfill(kind: ContentKind, hash: ContentHash, payload: Value) -> Self {
        match kind {
            ContentKind::Residue => EventKind::ResidueFulfill { hash, payload },
            ContentKind::NeuralMap => EventKind::NeuralMapFulfill { hash, payload },
        }
    }

    /// Split a content exchange event into namespace and step.
    pub fn content_message(&self) -> Option<(ContentKind, ContentMessage)> {
        let (kind, msg) = match self {
            EventKind::ResidueHashAnnounce { hash } => (ContentKind::Residue, ContentMessage::Announce(*hash)),
            EventKind::ResidueRequest { hash } => (ContentKind::Residue, ContentMessage::Request(*hash)),
            EventKind::ResidueFulfill { hash, payload } => {
                (ContentKind::Residue, ContentMessage::Fulfill(*hash, payload.clone()))
            }
            EventKind::NeuralMapHashAnnounce { hash } => (ContentKind::NeuralMap, ContentMessage::Announce(*hash)),
            EventKind::NeuralMapRequest { hash } => (ContentKind::NeuralMap, ContentMessage::Request(*hash)),
            EventKind::NeuralMapFulfill { hash, payload } => {
                (ContentKind::NeuralMap, ContentMessage::Fulfill(*hash, payload.clone()))
            }
            _ => return None,
        };
        Some((kind, msg))
    }

    /// Domain checks serde cannot express.
    pub fn validate(&self) -> Result<()> {
        match self {
            EventKind::CollectiveShatter { epicenter, intensity } => {
                if !epicenter.iter().all(|c| c.is_finite()) || !intensity.is_finite() || *intensity < 0.0 {
                    return Err(Error::Invalid("collective_shatter with non-finite geometry".into()));
                }
            }
            EventKind::ThoughtStream { text } if text.len() > MAX_THOUGHT_LEN => {
                return Err(Error::Invalid(format!(
                    "thought_stream fragment of {} bytes exceeds {}",
                    text.len(),
                    MAX_THOUGHT_LEN
                )));
            }
            EventKind::RealityAnnounce { reality_id, .. } if reality_id.is_empty() => {
                return Err(Error::Invalid("reality_announce without id".into()));
            }
            _ => {}
        }
        Ok(())
    }
}

/// An event with its routing envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Type tag and type-specific fields.
    #[serde(flatten)]
    pub kind: EventKind,
    /// Unix milliseconds at the sender.
    pub timestamp: u64,
    /// Sending peer.
    pub origin: PeerId,
    /// Addressee; peers other than the target ignore the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<PeerId>,
}

impl EventEnvelope {
    /// Broadcast envelope.
    pub fn new(kind: EventKind, origin: PeerId, timestamp: u64) -> Self {
        Self {
            kind,
            timestamp,
            origin,
            target: None,
        }
    }

    /// Restrict handling to one peer.
    pub fn to(mut self, target: PeerId) -> Self {
        self.target = Some(target);
        self
    }

    /// Check if `peer` should handle this event.
    pub fn is_for(&self, peer: PeerId) -> bool {
        self.target.map_or(true, |t| t == peer)
    }

    /// Encode for the wire.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// An event with a tag this peer does not understand.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UntypedEvent {
    /// The unrecognized tag.
    pub event_type: String,
    /// Sender, if the envelope named one.
    pub origin: Option<PeerId>,
    /// Addressee, if any.
    pub target: Option<PeerId>,
    /// Sender timestamp, 0 if absent.
    pub timestamp: u64,
    /// The full raw event.
    pub payload: Value,
}

impl UntypedEvent {
    /// Check if `peer` should handle this event.
    pub fn is_for(&self, peer: PeerId) -> bool {
        self.target.map_or(true, |t| t == peer)
    }
}

/// Result of decoding one raw event.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Known, valid event.
    Event(EventEnvelope),
    /// Unknown tag, kept for the generic visual fallback.
    Untyped(UntypedEvent),
}

/// What visual listeners receive.
#[derive(Debug, Clone, PartialEq)]
pub enum VisualEvent {
    /// A presentation event this peer understands.
    Typed(EventEnvelope),
    /// An event republished without interpretation.
    Untyped(UntypedEvent),
}

impl VisualEvent {
    /// Type tag of the underlying event.
    pub fn event_type(&self) -> &str {
        match self {
            VisualEvent::Typed(env) => env.kind.tag(),
            VisualEvent::Untyped(raw) => &raw.event_type,
        }
    }
}

/// Decode a raw event received from a peer.
pub fn decode_event(raw: Value) -> Result<Inbound> {
    let tag = raw
        .get("type")
        .and_then(Value::as_str)
        .ok_or(Error::MissingTag)?
        .to_string();

    if !EventKind::is_known_tag(&tag) {
        let origin = raw.get("origin").and_then(Value::as_u64).map(PeerId);
        let target = raw.get("target").and_then(Value::as_u64).map(PeerId);
        let timestamp = raw.get("timestamp").and_then(Value::as_u64).unwrap_or(0);
        return Ok(Inbound::Untyped(UntypedEvent {
            event_type: tag,
            origin,
            target,
            timestamp,
            payload: raw,
        }));
    }

    let envelope: EventEnvelope =
        serde_json::from_value(raw).map_err(|source| Error::Malformed { tag, source })?;
    envelope.kind.validate()?;
    Ok(Inbound::Event(envelope))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ghost_replica::content_hash;
    use serde_json::json;

    #[test]
    fn envelope_flattens_tag_and_fields() {
        let env = EventEnvelope::new(
            EventKind::Heartbeat {
                peer_id: PeerId(7),
                is_host: true,
            },
            PeerId(7),
            1_000,
        );
        let value = env.to_value().unwrap();
        assert_eq!(value["type"], "heartbeat");
        assert_eq!(value["peer_id"], 7);
        assert_eq!(value["is_host"], true);
        assert_eq!(value["origin"], 7);
        assert!(value.get("target").is_none());

        assert_eq!(decode_event(value).unwrap(), Inbound::Event(env));
    }

    #[test]
    fn target_roundtrips_and_restricts() {
        let env = EventEnvelope::new(EventKind::ComputeDelegation { intent: json!("bridge") }, PeerId(9), 5)
            .to(PeerId(2));
        assert!(env.is_for(PeerId(2)));
        assert!(!env.is_for(PeerId(3)));

        let Inbound::Event(back) = decode_event(env.to_value().unwrap()).unwrap() else {
            panic!("expected typed event");
        };
        assert_eq!(back.target, Some(PeerId(2)));
    }

    #[test]
    fn unknown_tag_becomes_untyped() {
        let raw = json!({"type": "aurora_burst", "origin": 4, "timestamp": 12, "hue": 0.3});
        match decode_event(raw.clone()).unwrap() {
            Inbound::Untyped(u) => {
                assert_eq!(u.event_type, "aurora_burst");
                assert_eq!(u.origin, Some(PeerId(4)));
                assert_eq!(u.timestamp, 12);
                assert_eq!(u.payload, raw);
            }
            other => panic!("expected untyped, got {:?}", other),
        }
    }

    #[test]
    fn known_tag_with_bad_fields_is_malformed() {
        let raw = json!({"type": "heartbeat", "origin": 4, "timestamp": 1, "peer_id": "nope"});
        assert!(matches!(decode_event(raw), Err(Error::Malformed { .. })));
    }

    #[test]
    fn missing_tag_is_rejected() {
        assert!(matches!(decode_event(json!({"origin": 1})), Err(Error::MissingTag)));
    }

    #[test]
    fn non_finite_shatter_is_invalid() {
        let env = EventEnvelope::new(
            EventKind::CollectiveShatter {
                epicenter: [0.0, 1.0, 2.0],
                intensity: -1.0,
            },
            PeerId(1),
            0,
        );
        assert!(matches!(decode_event(env.to_value().unwrap()), Err(Error::Invalid(_))));
    }

    #[test]
    fn oversized_thought_is_invalid() {
        let env = EventEnvelope::new(
            EventKind::ThoughtStream {
                text: "x".repeat(MAX_THOUGHT_LEN + 1),
            },
            PeerId(1),
            0,
        );
        assert!(matches!(decode_event(env.to_value().unwrap()), Err(Error::Invalid(_))));
    }

    #[test]
    fn every_tag_matches_its_variant() {
        let hash = content_hash(&json!(1)).unwrap();
        let samples = vec![
            EventKind::Heartbeat { peer_id: PeerId(1), is_host: false },
            EventKind::announce(ContentKind::Residue, hash),
            EventKind::request(ContentKind::Residue, hash),
            EventKind::fulfill(ContentKind::Residue, hash, json!(1)),
            EventKind::RealityAnnounce { reality_id: "r1".into(), label: "dunes".into(), summary: Value::Null },
            EventKind::SpeculativePathSync { path_id: "p".into(), steps: vec![] },
            EventKind::ComputeDelegation { intent: json!({}) },
            EventKind::announce(ContentKind::NeuralMap, hash),
            EventKind::request(ContentKind::NeuralMap, hash),
            EventKind::fulfill(ContentKind::NeuralMap, hash, json!(1)),
            EventKind::CollectiveShatter { epicenter: [0.0; 3], intensity: 1.0 },
            EventKind::ThoughtStream { text: "hm".into() },
        ];
        assert_eq!(samples.len(), EventKind::TAGS.len());
        for (kind, tag) in samples.iter().zip(EventKind::TAGS) {
            assert_eq!(kind.tag(), tag);
            let value = serde_json::to_value(kind).unwrap();
            assert_eq!(value["type"], tag);
        }
    }

    #[test]
    fn content_message_splits_namespace() {
        let hash = content_hash(&json!({"w": 1})).unwrap();
        assert_eq!(
            EventKind::request(ContentKind::NeuralMap, hash).content_message(),
            Some((ContentKind::NeuralMap, ContentMessage::Request(hash)))
        );
        assert_eq!(EventKind::ThoughtStream { text: String::new() }.content_message(), None);
    }
}
