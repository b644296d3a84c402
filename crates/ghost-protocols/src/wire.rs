//! Wire frames exchanged over a relay link.
//!
//! One frame per line, JSON-encoded. Map updates carry stamped entries so
//! every replica merges them identically; events travel as raw JSON and are
//! decoded by the receiver (an unknown tag must survive transit).

use ghost_replica::{MapEntry, PeerId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Messages flooded to every peer in a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireMessage {
    /// Replicated-map entries written (or held) by `origin`.
    Update { origin: PeerId, entries: Vec<MapEntry> },
    /// Ephemeral event, undecoded.
    Event { event: Value },
    /// New peer asks for the full map.
    SyncRequest { origin: PeerId },
}

impl WireMessage {
    /// Encode as one newline-terminated line.
    pub fn encode_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Decode one line (trailing whitespace ignored).
    pub fn decode_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim_end())?)
    }
}
