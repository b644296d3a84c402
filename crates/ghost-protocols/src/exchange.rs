//! Content-addressed residue and neural-map exchange.
//!
//! ```text
//! holder                      requester
//!   │── *_hash_announce ─────────▶│  (missing locally)
//!   │◀──────────── *_request ─────│  target = holder
//!   │── *_fulfill ───────────────▶│  target = requester
//!   │                             │  verify hash(payload) == hash, store
//! ```

use ghost_replica::{ContentHash, ContentKind, ContentStore, PeerId, ResidueRecord};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Result;
use crate::event::{ContentMessage, EventKind};

/// What the caller should do after handling an exchange event.
#[derive(Debug, Clone, PartialEq)]
pub enum ExchangeOutcome {
    /// Nothing to do.
    Ignored,
    /// Send `event` addressed to `target`.
    Reply { event: EventKind, target: PeerId },
    /// A verified record was stored.
    Stored(ResidueRecord),
    /// Fulfilled payload did not match its hash; dropped.
    Rejected,
}

/// Request/fulfill state machine over a [`ContentStore`].
pub struct ContentExchange {
    store: Box<dyn ContentStore>,
}

impl ContentExchange {
    /// Exchange backed by `store`.
    pub fn new(store: Box<dyn ContentStore>) -> Self {
        Self { store }
    }

    /// Store a local outcome and build its announcement.
    pub fn announce(&mut self, kind: ContentKind, payload: Value) -> Result<EventKind> {
        let record = ResidueRecord::new(kind, payload)?;
        let hash = record.hash;
        if self.store.put(record) {
            debug!("Stored local {:?} {}", kind, hash);
        }
        Ok(EventKind::announce(kind, hash))
    }

    /// Look up a held record.
    pub fn lookup(&self, kind: ContentKind, hash: &ContentHash) -> Option<ResidueRecord> {
        self.store.get(kind, hash)
    }

    /// Check if a record is held.
    pub fn holds(&self, kind: ContentKind, hash: &ContentHash) -> bool {
        self.store.contains(kind, hash)
    }

    /// Handle an exchange event from `origin`. Non-exchange events are ignored.
    pub fn handle(&mut self, origin: PeerId, event: &EventKind) -> ExchangeOutcome {
        let Some((kind, message)) = event.content_message() else {
            return ExchangeOutcome::Ignored;
        };

        match message {
            ContentMessage::Announce(hash) => {
                if self.store.contains(kind, &hash) {
                    return ExchangeOutcome::Ignored;
                }
                debug!("Requesting {:?} {} from {}", kind, hash, origin);
                ExchangeOutcome::Reply {
                    event: EventKind::request(kind, hash),
                    target: origin,
                }
            }
            ContentMessage::Request(hash) => match self.store.get(kind, &hash) {
                Some(record) => ExchangeOutcome::Reply {
                    event: EventKind::fulfill(kind, hash, record.payload),
                    target: origin,
                },
                None => ExchangeOutcome::Ignored,
            },
            ContentMessage::Fulfill(hash, payload) => {
                if self.store.contains(kind, &hash) {
                    return ExchangeOutcome::Ignored;
                }
                match ResidueRecord::verified(kind, hash, payload) {
                    Ok(record) => {
                        self.store.put(record.clone());
                        debug!("Stored {:?} {} fulfilled by {}", kind, hash, origin);
                        ExchangeOutcome::Stored(record)
                    }
                    Err(e) => {
                        warn!("Dropping {:?} fulfill from {}: {}", kind, origin, e);
                        ExchangeOutcome::Rejected
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for ContentExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentExchange").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ghost_replica::{content_hash, MemoryContentStore};
    use serde_json::json;

    fn exchange() -> ContentExchange {
        ContentExchange::new(Box::new(MemoryContentStore::new()))
    }

    #[test]
    fn residue_roundtrip_reconstructs_announced_hash() {
        let holder_id = PeerId(1);
        let requester_id = PeerId(2);
        let mut holder = exchange();
        let mut requester = exchange();

        let payload = json!({"structure": "arch", "stable": true, "load": [1.5, 2.0]});
        let announce = holder.announce(ContentKind::Residue, payload.clone()).unwrap();
        let EventKind::ResidueHashAnnounce { hash: announced } = announce.clone() else {
            panic!("expected residue announce");
        };

        let ExchangeOutcome::Reply { event: request, target } = requester.handle(holder_id, &announce) else {
            panic!("requester should ask for missing residue");
        };
        assert_eq!(target, holder_id);

        let ExchangeOutcome::Reply { event: fulfill, target } = holder.handle(requester_id, &request) else {
            panic!("holder should fulfill");
        };
        assert_eq!(target, requester_id);

        let ExchangeOutcome::Stored(record) = requester.handle(holder_id, &fulfill) else {
            panic!("requester should store verified residue");
        };
        assert_eq!(record.payload, payload);
        assert_eq!(content_hash(&record.payload).unwrap(), announced);
        assert!(requester.holds(ContentKind::Residue, &announced));
    }

    #[test]
    fn held_content_is_not_requested() {
        let mut a = exchange();
        let announce = a.announce(ContentKind::NeuralMap, json!([0.1, 0.2])).unwrap();
        assert_eq!(a.handle(PeerId(9), &announce), ExchangeOutcome::Ignored);
    }

    #[test]
    fn tampered_fulfill_is_rejected() {
        let mut requester = exchange();
        let hash = content_hash(&json!("honest")).unwrap();
        let forged = EventKind::fulfill(ContentKind::Residue, hash, json!("forged"));
        assert_eq!(requester.handle(PeerId(3), &forged), ExchangeOutcome::Rejected);
        assert!(!requester.holds(ContentKind::Residue, &hash));
    }

    #[test]
    fn request_for_unknown_hash_is_ignored() {
        let mut holder = exchange();
        let hash = content_hash(&json!(42)).unwrap();
        let request = EventKind::request(ContentKind::Residue, hash);
        assert_eq!(holder.handle(PeerId(3), &request), ExchangeOutcome::Ignored);
    }

    #[test]
    fn namespaces_are_separate() {
        let mut holder = exchange();
        let announce = holder.announce(ContentKind::Residue, json!("shared")).unwrap();
        let EventKind::ResidueHashAnnounce { hash } = announce else {
            panic!("expected residue announce");
        };
        assert!(holder.lookup(ContentKind::Residue, &hash).is_some());
        assert!(holder.lookup(ContentKind::NeuralMap, &hash).is_none());
    }
}
