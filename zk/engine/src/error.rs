use std::time::Duration;
use thiserror::Error;
use zk_core::ZkError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProofError {
    #[error("proof generation timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid witness: {0}")]
    InvalidWitness(String),
    #[error("verification key is for circuit {key_version}, backend runs {circuit_version}")]
    KeyMismatch {
        key_version: String,
        circuit_version: String,
    },
    #[error("proof generation cancelled")]
    Cancelled,
    #[error("backend error: {0}")]
    Backend(#[from] ZkError),
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("no proof tracked for record {0}")]
    UnknownRecord(String),
}

impl ProofError {
    /// Timeouts and transient backend failures are retried; everything else
    /// fails the proof on the first occurrence.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProofError::Timeout(_) => true,
            ProofError::Backend(err) => err.is_transient(),
            _ => false,
        }
    }
}

pub type ProofResult<T> = Result<T, ProofError>;
