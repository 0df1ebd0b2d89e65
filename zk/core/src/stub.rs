use crate::{
    blake3_commit, CircuitDescriptor, CircuitId, CircuitRegistry, Hash, ProofRequest,
    VerificationKey, ZkBackend, ZkError, ZkResult,
};
use async_trait::async_trait;
use blake3::Hasher;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct StubConfig {
    pub circuits: Vec<CircuitDescriptor>,
    /// Simulated proving time.
    pub latency: Duration,
}

impl Default for StubConfig {
    fn default() -> Self {
        Self {
            circuits: vec![],
            latency: Duration::ZERO,
        }
    }
}

/// Commitment-based backend with the same contract as a real prover.
///
/// Proof layout: `witness_digest (32) ‖ tag (32)` where
/// `tag = H(vk ‖ public_inputs ‖ witness_digest)`. The witness itself never
/// appears in the proof, and a proof only verifies against the exact public
/// inputs and key it was produced for.
pub struct StubBackend {
    registry: CircuitRegistry,
    latency: Duration,
    fail_next: AtomicU32,
}

impl StubBackend {
    pub fn new(cfg: StubConfig) -> Self {
        let mut registry = CircuitRegistry::new();
        for circuit in cfg.circuits {
            registry.register(circuit);
        }
        Self {
            registry,
            latency: cfg.latency,
            fail_next: AtomicU32::new(0),
        }
    }

    /// Makes the next `count` prove calls fail with `BackendUnavailable`.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    fn ensure_circuit(&self, id: &CircuitId) -> ZkResult<&CircuitDescriptor> {
        self.registry
            .get(id)
            .ok_or_else(|| ZkError::UnknownCircuit(id.clone()))
    }
}

fn stub_tag(key: &[u8], public_inputs: &[u8], witness_digest: &Hash) -> Hash {
    let mut hasher = Hasher::new();
    hasher.update(&(key.len() as u64).to_le_bytes());
    hasher.update(key);
    hasher.update(&(public_inputs.len() as u64).to_le_bytes());
    hasher.update(public_inputs);
    hasher.update(witness_digest);
    *hasher.finalize().as_bytes()
}

#[async_trait]
impl ZkBackend for StubBackend {
    fn backend_id(&self) -> &'static str {
        "stub"
    }

    fn registry(&self) -> &CircuitRegistry {
        &self.registry
    }

    async fn prove(&self, request: ProofRequest) -> ZkResult<Vec<u8>> {
        let circuit = self.ensure_circuit(&request.circuit_id)?;
        let key = VerificationKey::derive(circuit);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ZkError::BackendUnavailable("injected failure".into()));
        }
        let witness_digest = blake3_commit(&request.witness);
        let tag = stub_tag(&key.bytes, &request.public_inputs, &witness_digest);
        debug!(circuit = %request.circuit_id, "stub proof produced");
        let mut proof = witness_digest.to_vec();
        proof.extend_from_slice(&tag);
        Ok(proof)
    }

    fn verify(&self, proof: &[u8], public_inputs: &[u8], key: &VerificationKey) -> ZkResult<bool> {
        self.ensure_circuit(&key.circuit_id)?;
        if proof.len() != 64 {
            return Ok(false);
        }
        let mut witness_digest = [0u8; 32];
        witness_digest.copy_from_slice(&proof[..32]);
        let tag = stub_tag(&key.bytes, public_inputs, &witness_digest);
        Ok(proof[32..] == tag)
    }
}
