use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use zk_core::Hash;
use zk_program_action::PublicInputs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProofStatus {
    Pending,
    Generated,
    Batched,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    /// The ledger record this proof is bound to.
    pub record_hash: Hash,
    pub identity: String,
    pub timestamp: u64,
    pub public_inputs: PublicInputs,
    pub public_commitment: Hash,
    pub proof_bytes: Vec<u8>,
    pub verification_key_id: String,
    pub status: ProofStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl Proof {
    pub fn action_type(&self) -> &str {
        &self.public_inputs.action_type
    }
}

/// Durable record of proof status transitions.
#[async_trait]
pub trait ProofStore: Send + Sync {
    async fn put(&self, proof: &Proof) -> anyhow::Result<()>;
    async fn get(&self, record_hash: &Hash) -> anyhow::Result<Option<Proof>>;
    async fn by_status(&self, status: ProofStatus) -> anyhow::Result<Vec<Proof>>;
}

#[derive(Clone, Default)]
pub struct InMemoryProofStore {
    inner: Arc<RwLock<HashMap<Hash, Proof>>>,
}

impl InMemoryProofStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProofStore for InMemoryProofStore {
    async fn put(&self, proof: &Proof) -> anyhow::Result<()> {
        self.inner
            .write()
            .await
            .insert(proof.record_hash, proof.clone());
        Ok(())
    }

    async fn get(&self, record_hash: &Hash) -> anyhow::Result<Option<Proof>> {
        Ok(self.inner.read().await.get(record_hash).cloned())
    }

    async fn by_status(&self, status: ProofStatus) -> anyhow::Result<Vec<Proof>> {
        let mut proofs: Vec<Proof> = self
            .inner
            .read()
            .await
            .values()
            .filter(|p| p.status == status)
            .cloned()
            .collect();
        proofs.sort_by(|a, b| (&a.identity, a.timestamp).cmp(&(&b.identity, b.timestamp)));
        Ok(proofs)
    }
}
