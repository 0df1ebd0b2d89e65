use serde::{Deserialize, Serialize};
use std::fmt;

pub type Hash = [u8; 32];

/// `prev_hash` of the first record in every chain.
pub const GENESIS_HASH: Hash = [0u8; 32];

/// Data-driven action tag (`DELIV_DONE`, `GEO_VIOL`, ...). New action types are
/// registry entries, never new variants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionType(String);

impl ActionType {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActionType {
    fn from(code: &str) -> Self {
        Self::new(code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub identity: String,
    pub action_type: ActionType,
    pub timestamp: u64,
    /// Position in the identity's chain, starting at 0.
    pub sequence: u64,
    pub payload_hash: Hash,
    pub prev_hash: Hash,
    pub record_hash: Hash,
    /// ed25519 signature over `record_hash`.
    pub signature: Vec<u8>,
}

impl ActionRecord {
    /// Recomputes the hash this record should carry.
    pub fn expected_hash(&self) -> Hash {
        compute_record_hash(
            &self.identity,
            &self.action_type,
            self.timestamp,
            &self.payload_hash,
            &self.prev_hash,
        )
    }
}

pub fn hash_payload(payload: &[u8]) -> Hash {
    *blake3::hash(payload).as_bytes()
}

/// `H(identity ‖ action_type ‖ timestamp ‖ payload_hash ‖ prev_hash)`.
///
/// Variable-width fields are length-prefixed so that adjacent strings cannot
/// alias each other (`"ab" ‖ "c"` vs `"a" ‖ "bc"`).
pub fn compute_record_hash(
    identity: &str,
    action_type: &ActionType,
    timestamp: u64,
    payload_hash: &Hash,
    prev_hash: &Hash,
) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(identity.len() as u64).to_le_bytes());
    hasher.update(identity.as_bytes());
    hasher.update(&(action_type.as_str().len() as u64).to_le_bytes());
    hasher.update(action_type.as_str().as_bytes());
    hasher.update(&timestamp.to_le_bytes());
    hasher.update(payload_hash);
    hasher.update(prev_hash);
    *hasher.finalize().as_bytes()
}

/// First 8 bytes in hex, for log lines.
pub fn short_hex(hash: &Hash) -> String {
    hex::encode(&hash[..8])
}
