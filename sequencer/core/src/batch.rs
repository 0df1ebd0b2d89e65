use crate::error::{BatchError, BatchResult};
use crate::merkle::{hash_leaf, Hash, InclusionProof, MerkleTree};
use serde::{Deserialize, Serialize};
use zk_engine::Proof;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubmissionState {
    Open,
    Sealed,
    Submitted,
    Confirmed,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchLeaf {
    pub record_hash: Hash,
    pub identity: String,
    pub timestamp: u64,
    pub action_type: String,
    pub public_commitment: Hash,
    pub leaf_hash: Hash,
}

/// A sealed group of proofs. Everything except `submission_state`,
/// `submission_handle` and `confirmation_ref` is fixed once sealed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: String,
    /// Sealing order across all batches.
    pub sequence: u64,
    /// Highest rejection count among the member proofs.
    pub attempt: u32,
    pub ordered_leaves: Vec<BatchLeaf>,
    pub proofs: Vec<Proof>,
    pub merkle_root: Hash,
    pub inclusion_proofs: Vec<InclusionProof>,
    pub submission_state: SubmissionState,
    pub submission_handle: Option<String>,
    pub confirmation_ref: Option<String>,
    pub sealed_at: i64,
}

/// What leaves the process on submission: the root and leaf commitments, no
/// witnesses or proof bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPayload {
    pub batch_id: String,
    pub sequence: u64,
    pub merkle_root: Hash,
    pub leaves: Vec<Hash>,
}

impl Batch {
    pub fn recompute_root(&self) -> Option<Hash> {
        let leaves: Vec<Hash> = self
            .ordered_leaves
            .iter()
            .map(|leaf| hash_leaf(&leaf.public_commitment))
            .collect();
        MerkleTree::build(leaves).map(|tree| tree.root())
    }

    /// Root recomputes from the leaves and every inclusion proof verifies.
    pub fn verify_integrity(&self) -> bool {
        if self.recompute_root() != Some(self.merkle_root) {
            return false;
        }
        self.inclusion_proofs.len() == self.ordered_leaves.len()
            && self
                .inclusion_proofs
                .iter()
                .zip(&self.ordered_leaves)
                .enumerate()
                .all(|(i, (proof, leaf))| {
                    proof.leaf_index == i
                        && proof.leaf_count == self.ordered_leaves.len()
                        && proof.leaf == leaf.leaf_hash
                        && proof.verify_commitment(&leaf.public_commitment, &self.merkle_root)
                })
    }

    pub fn payload(&self) -> BatchPayload {
        BatchPayload {
            batch_id: self.batch_id.clone(),
            sequence: self.sequence,
            merkle_root: self.merkle_root,
            leaves: self.ordered_leaves.iter().map(|l| l.leaf_hash).collect(),
        }
    }

    pub fn root_hex(&self) -> String {
        hex::encode(self.merkle_root)
    }

    pub fn identities(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.ordered_leaves.iter().map(|l| l.identity.clone()).collect();
        ids.dedup();
        ids
    }
}

/// Orders proofs by `(identity, timestamp, record_hash)` and builds the tree.
/// The returned batch is `Open`; the caller seals it.
pub fn build_batch(
    sequence: u64,
    attempt: u32,
    mut proofs: Vec<Proof>,
    sealed_at: i64,
) -> BatchResult<Batch> {
    proofs.sort_by(|a, b| {
        (&a.identity, a.timestamp, a.record_hash).cmp(&(&b.identity, b.timestamp, b.record_hash))
    });
    let ordered_leaves: Vec<BatchLeaf> = proofs
        .iter()
        .map(|proof| BatchLeaf {
            record_hash: proof.record_hash,
            identity: proof.identity.clone(),
            timestamp: proof.timestamp,
            action_type: proof.action_type().to_string(),
            public_commitment: proof.public_commitment,
            leaf_hash: hash_leaf(&proof.public_commitment),
        })
        .collect();
    let tree = MerkleTree::build(ordered_leaves.iter().map(|l| l.leaf_hash).collect())
        .ok_or(BatchError::EmptyBatch)?;
    Ok(Batch {
        batch_id: format!("batch-{sequence}"),
        sequence,
        attempt,
        merkle_root: tree.root(),
        inclusion_proofs: tree.proofs(),
        ordered_leaves,
        proofs,
        submission_state: SubmissionState::Open,
        submission_handle: None,
        confirmation_ref: None,
        sealed_at,
    })
}
