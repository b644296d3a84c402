//! Content-addressed records (residue, neural maps).
//!
//! A record is addressed by the BLAKE3 hash of its payload's canonical JSON
//! encoding. Object keys serialize in sorted order, so two peers holding
//! the same payload always compute the same address.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// A 32-byte content address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> std::result::Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 hex chars
        write!(f, "{}...", &self.to_hex()[..8])
    }
}

impl Serialize for ContentHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Hash a payload to its content address.
pub fn content_hash(payload: &Value) -> Result<ContentHash> {
    let bytes = serde_json::to_vec(payload)?;
    Ok(ContentHash(*blake3::hash(&bytes).as_bytes()))
}

/// Which exchange namespace a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    /// Verified structural/physical outcome.
    Residue,
    /// Learned neural map.
    NeuralMap,
}

/// A content-addressed record of a verified outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResidueRecord {
    /// Content address of `payload`.
    pub hash: ContentHash,
    /// Namespace.
    pub kind: ContentKind,
    /// The outcome itself.
    pub payload: Value,
}

impl ResidueRecord {
    /// Build a record, computing its address.
    pub fn new(kind: ContentKind, payload: Value) -> Result<Self> {
        let hash = content_hash(&payload)?;
        Ok(Self {
            hash,
            kind,
            payload,
        })
    }

    /// Rebuild a record received from a peer, checking its address.
    pub fn verified(kind: ContentKind, expected: ContentHash, payload: Value) -> Result<Self> {
        let actual = content_hash(&payload)?;
        if actual != expected {
            return Err(Error::HashMismatch { expected, actual });
        }
        Ok(Self {
            hash: actual,
            kind,
            payload,
        })
    }
}

/// Durable lookup/persistence of records by content hash.
pub trait ContentStore: Send {
    /// Look up a record.
    fn get(&self, kind: ContentKind, hash: &ContentHash) -> Option<ResidueRecord>;

    /// Store a record. Returns false if it was already present.
    fn put(&mut self, record: ResidueRecord) -> bool;

    /// Check presence without cloning.
    fn contains(&self, kind: ContentKind, hash: &ContentHash) -> bool {
        self.get(kind, hash).is_some()
    }
}

/// In-process content store.
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    records: HashMap<(ContentKind, ContentHash), ResidueRecord>,
}

impl MemoryContentStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl ContentStore for MemoryContentStore {
    fn get(&self, kind: ContentKind, hash: &ContentHash) -> Option<ResidueRecord> {
        self.records.get(&(kind, *hash)).cloned()
    }

    fn put(&mut self, record: ResidueRecord) -> bool {
        let key = (record.kind, record.hash);
        if self.records.contains_key(&key) {
            return false;
        }
        self.records.insert(key, record);
        true
    }

    fn contains(&self, kind: ContentKind, hash: &ContentHash) -> bool {
        self.records.contains_key(&(kind, *hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hash_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": [1, 2]}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": [1, 2], "b": 1}"#).unwrap();
        assert_eq!(content_hash(&a).unwrap(), content_hash(&b).unwrap());
    }

    #[test]
    fn hash_hex_roundtrip() {
        let hash = content_hash(&json!({"arch": "truss"})).unwrap();
        assert_eq!(ContentHash::from_hex(&hash.to_hex()).unwrap(), hash);
        assert!(ContentHash::from_hex("abcd").is_err());
    }

    #[test]
    fn verified_rejects_tampered_payload() {
        let record = ResidueRecord::new(ContentKind::Residue, json!({"load": 12})).unwrap();
        let tampered = ResidueRecord::verified(ContentKind::Residue, record.hash, json!({"load": 13}));
        assert!(matches!(tampered, Err(Error::HashMismatch { .. })));

        let ok = ResidueRecord::verified(ContentKind::Residue, record.hash, json!({"load": 12}));
        assert_eq!(ok.unwrap(), record);
    }

    #[test]
    fn store_deduplicates_by_hash() {
        let mut store = MemoryContentStore::new();
        let record = ResidueRecord::new(ContentKind::Residue, json!({"span": 4})).unwrap();

        assert!(store.put(record.clone()));
        assert!(!store.put(record.clone()));
        assert_eq!(store.len(), 1);
        assert!(store.contains(ContentKind::Residue, &record.hash));
        assert!(!store.contains(ContentKind::NeuralMap, &record.hash));
    }
}
