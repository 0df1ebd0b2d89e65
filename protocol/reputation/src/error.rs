use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReputationError {
    #[error("identity {0} is not registered")]
    UnknownIdentity(String),
    #[error("reorder buffer full ({limit} batches waiting for sequence {expected})")]
    ReorderBufferFull { limit: usize, expected: u64 },
}

pub type ReputationResult<T> = Result<T, ReputationError>;
