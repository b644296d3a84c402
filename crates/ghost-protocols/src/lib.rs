//! Ghost Mesh Protocols
//!
//! Everything that crosses a link between two peers:
//!
//! - [`WireMessage`]: line-delimited frames (map updates, events, sync requests)
//! - [`EventKind`]: the closed union of ephemeral events, decoded once at the
//!   boundary by [`decode_event`]
//! - [`OutboundThrottle`] / [`InboundBuffer`]: rate control in both directions
//! - [`ContentExchange`]: hash-announce / request / fulfill for residue and
//!   neural maps

pub mod error;
mod event;
mod exchange;
mod throttle;
mod wire;

pub use error::{Error, Result};
pub use event::{
    decode_event, ContentMessage, EventEnvelope, EventKind, Inbound, UntypedEvent, VisualEvent, MAX_THOUGHT_LEN,
};
pub use exchange::{ContentExchange, ExchangeOutcome};
pub use throttle::{
    ContextKey, InboundBuffer, OutboundThrottle, Patch, PatchEntry, Suppressor, INBOUND_FLUSH_INTERVAL,
    OUTBOUND_MIN_INTERVAL,
};
pub use wire::WireMessage;
