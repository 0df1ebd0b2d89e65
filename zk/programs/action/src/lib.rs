use anyhow::Result;
use serde::{Deserialize, Serialize};
use zk_core::{blake3_commit, CircuitDescriptor, CircuitId, Hash};

pub const CIRCUIT_VERSION: &str = "3.0.0";

/// Public inputs of the action circuit. `record_hash` ties a proof to exactly
/// one ledger record, so it cannot be replayed against another.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublicInputs {
    pub record_hash: Hash,
    pub action_type: String,
    pub time_bucket: u64,
}

impl PublicInputs {
    pub fn new(record_hash: Hash, action_type: &str, timestamp: u64, bucket_secs: u64) -> Self {
        Self {
            record_hash,
            action_type: action_type.to_string(),
            time_bucket: time_bucket(timestamp, bucket_secs),
        }
    }

    /// Canonical bytes handed to the prover and verifier.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// The proof's public commitment; also the Merkle leaf pre-image.
    pub fn commitment(&self) -> Result<Hash> {
        Ok(blake3_commit(&self.encode()?))
    }
}

pub fn decode_public_inputs(bytes: &[u8]) -> Result<PublicInputs> {
    Ok(bincode::deserialize(bytes)?)
}

/// Private witness. Holds the raw payload, so it is only ever passed to the
/// proving backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionWitness {
    pub payload: Vec<u8>,
    pub payload_hash: Hash,
    pub signature: Vec<u8>,
    pub predicate_id: Option<String>,
    pub predicate_holds: bool,
}

pub fn encode_witness(witness: &ActionWitness) -> Result<Vec<u8>> {
    Ok(bincode::serialize(witness)?)
}

pub fn time_bucket(timestamp: u64, bucket_secs: u64) -> u64 {
    if bucket_secs == 0 {
        timestamp
    } else {
        timestamp / bucket_secs
    }
}

pub fn circuit_id() -> CircuitId {
    CircuitId::ActionPredicate
}

pub fn descriptor() -> CircuitDescriptor {
    CircuitDescriptor {
        id: circuit_id(),
        name: "action_predicate".into(),
        description: "record-bound action predicate proof".into(),
        version: CIRCUIT_VERSION.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commitment_depends_on_record() {
        let a = PublicInputs::new([1u8; 32], "DELIV_DONE", 7_200, 3_600);
        let b = PublicInputs::new([2u8; 32], "DELIV_DONE", 7_200, 3_600);
        assert_eq!(a.time_bucket, 2);
        assert_ne!(a.commitment().unwrap(), b.commitment().unwrap());
        assert_eq!(decode_public_inputs(&a.encode().unwrap()).unwrap(), a);
    }

    #[test]
    fn zero_bucket_keeps_raw_timestamp() {
        assert_eq!(time_bucket(1234, 0), 1234);
        assert_eq!(time_bucket(3_599, 3_600), 0);
    }
}
