use async_trait::async_trait;
use blake3::Hasher;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

mod stub;

pub use stub::{StubBackend, StubConfig};

/// Alias to keep hashes consistent with the ledger layer.
pub type Hash = [u8; 32];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CircuitId {
    ActionPredicate,
    Custom(String),
}

impl fmt::Display for CircuitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitId::ActionPredicate => f.write_str("action_predicate"),
            CircuitId::Custom(name) => write!(f, "custom:{name}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CircuitDescriptor {
    pub id: CircuitId,
    pub name: String,
    pub description: String,
    pub version: String,
}

/// Verification key pinned to one circuit version. A key whose
/// `circuit_version` differs from the registered circuit is a mismatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerificationKey {
    pub id: String,
    pub circuit_id: CircuitId,
    pub circuit_version: String,
    pub bytes: Vec<u8>,
}

impl VerificationKey {
    /// Deterministic key material for a circuit descriptor. Stands in for a
    /// trusted-setup output in environments without a real prover.
    pub fn derive(circuit: &CircuitDescriptor) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(b"roboid-vk");
        hasher.update(circuit.id.to_string().as_bytes());
        hasher.update(circuit.version.as_bytes());
        let bytes = hasher.finalize().as_bytes().to_vec();
        Self {
            id: format!("vk-{}-{}", circuit.id, circuit.version),
            circuit_id: circuit.id.clone(),
            circuit_version: circuit.version.clone(),
            bytes,
        }
    }

    pub fn matches(&self, circuit: &CircuitDescriptor) -> bool {
        self.circuit_id == circuit.id && self.circuit_version == circuit.version
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofRequest {
    pub circuit_id: CircuitId,
    /// Private witness; never leaves the prover.
    pub witness: Vec<u8>,
    pub public_inputs: Vec<u8>,
}

#[derive(Default, Clone)]
pub struct CircuitRegistry {
    circuits: HashMap<CircuitId, CircuitDescriptor>,
}

impl CircuitRegistry {
    pub fn new() -> Self {
        Self {
            circuits: HashMap::new(),
        }
    }

    pub fn register(&mut self, descriptor: CircuitDescriptor) {
        self.circuits.insert(descriptor.id.clone(), descriptor);
    }

    pub fn get(&self, id: &CircuitId) -> Option<&CircuitDescriptor> {
        self.circuits.get(id)
    }

    pub fn list(&self) -> Vec<CircuitDescriptor> {
        self.circuits.values().cloned().collect()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ZkError {
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("circuit not registered: {0}")]
    UnknownCircuit(CircuitId),
    #[error("proof rejected: {0}")]
    ProofRejected(String),
    #[error("encoding error: {0}")]
    Encoding(String),
}

impl ZkError {
    /// Errors worth retrying with the same inputs.
    pub fn is_transient(&self) -> bool {
        matches!(self, ZkError::BackendUnavailable(_))
    }
}

pub type ZkResult<T> = Result<T, ZkError>;

/// Abstract proving system. `verify` must be pure.
#[async_trait]
pub trait ZkBackend: Send + Sync {
    fn backend_id(&self) -> &'static str;
    fn registry(&self) -> &CircuitRegistry;
    async fn prove(&self, request: ProofRequest) -> ZkResult<Vec<u8>>;
    fn verify(&self, proof: &[u8], public_inputs: &[u8], key: &VerificationKey) -> ZkResult<bool>;
}

/// Deterministic commitment helper.
pub fn blake3_commit(data: &[u8]) -> Hash {
    let mut hasher = Hasher::new();
    hasher.update(data);
    *hasher.finalize().as_bytes()
}
