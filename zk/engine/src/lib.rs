//! Proof construction and verification for ledger records.

mod engine;
mod error;
mod predicate;
mod proof;

pub use engine::{verify_proof, ProofEngine, ProofEngineConfig, ProofStatistics};
pub use error::{ProofError, ProofResult};
pub use predicate::{AcceptAll, PredicateFn, PredicateProvider, PredicateSet};
pub use proof::{InMemoryProofStore, Proof, ProofStatus, ProofStore};
pub use zk_program_action::PublicInputs;
