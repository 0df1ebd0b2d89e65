use crate::batch::SubmissionState;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BatchError {
    #[error("pending queue full ({limit} proofs)")]
    Overflow { limit: usize },
    #[error("submission of {batch_id} failed after {attempts} attempts: {reason}")]
    SubmissionFailed {
        batch_id: String,
        attempts: u32,
        reason: String,
    },
    #[error("merkle root {0} already submitted")]
    DuplicateRoot(String),
    #[error("batch {batch_id} permanently failed: {records} records exhausted their retries")]
    PermanentBatchFailure { batch_id: String, records: usize },
    #[error("record {record} not verified: {reason}")]
    RecordNotVerified { record: String, reason: String },
    #[error("cannot build an empty batch")]
    EmptyBatch,
    #[error("unknown batch {0}")]
    UnknownBatch(String),
    #[error("invalid transition for {batch_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        batch_id: String,
        from: SubmissionState,
        to: SubmissionState,
    },
    #[error("confirmation sink failed: {0}")]
    Sink(String),
    #[error("store error: {0}")]
    Store(String),
}

pub type BatchResult<T> = Result<T, BatchError>;
